//! # Pending Operations
//!
//! Correlation-id table for one connection. Every request registers a
//! completion slot here before it is written; the receive task completes the
//! slot when the matching REPLY arrives, whatever order replies come in.
//!
//! Ids start at 1, skip 0 on wrap, and never collide with an id that is still
//! waiting. Once the table is closed every slot is failed and new
//! registrations are refused, so a dead connection never holds waiters.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::trace;

use gdict_common::{Frame, FrameKind, UNSOLICITED_ID};

use crate::error::{DriverError, DriverResult};

pub(crate) type ReplyReceiver = oneshot::Receiver<DriverResult<Frame>>;

/// A request waiting for its reply.
#[derive(Debug)]
struct PendingOp {
    request: FrameKind,
    key: Bytes,
    deadline: Instant,
    tx: oneshot::Sender<DriverResult<Frame>>,
}

/// Returned by [`PendingTable::register`].
#[derive(Debug)]
pub(crate) struct Registration {
    pub id: u64,
    pub deadline: Instant,
    pub rx: ReplyReceiver,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    ops: HashMap<u64, PendingOp>,
    closed: bool,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                UNSOLICITED_ID => 1,
                next => next,
            };
            if !self.ops.contains_key(&id) {
                return id;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        PendingTable {
            inner: Mutex::new(Inner {
                next_id: 1,
                ops: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Reserves a fresh id for a request that must be answered within `timeout`.
    pub(crate) fn register(&self, request: FrameKind, key: Bytes, timeout: Duration) -> DriverResult<Registration> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DriverError::ConnectionClosed);
        }
        let id = inner.allocate_id();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        inner.ops.insert(
            id,
            PendingOp {
                request,
                key,
                deadline,
                tx,
            },
        );
        Ok(Registration { id, deadline, rx })
    }

    /// Hands a reply to its waiter. Gives the frame back when no request
    /// with that id is waiting.
    pub(crate) fn complete(&self, reply: Frame) -> Result<(), Frame> {
        let op = self.inner.lock().ops.remove(&reply.id);
        match op {
            Some(op) => {
                trace!(
                    id = reply.id,
                    request = %op.request,
                    key = ?op.key,
                    remaining = ?op.deadline.saturating_duration_since(Instant::now()),
                    "reply matched"
                );
                // The waiter may have given up already.
                let _ = op.tx.send(Ok(reply));
                Ok(())
            }
            None => Err(reply),
        }
    }

    /// Drops one entry without resolving it. Returns whether it was present.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        self.inner.lock().ops.remove(&id).is_some()
    }

    /// Fails every waiter with `ConnectionClosed` and refuses new
    /// registrations. Returns how many waiters were failed.
    pub(crate) fn close(&self) -> usize {
        let drained: Vec<PendingOp> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.ops.drain().map(|(_, op)| op).collect()
        };
        let count = drained.len();
        for op in drained {
            let _ = op.tx.send(Err(DriverError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
