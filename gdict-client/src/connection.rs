//! # Connection
//!
//! One TCP session to the server plus the background task that reads it.
//!
//! ## State Machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Disconnected
//!              \            |
//!               `---------> Failed -----> Disconnecting
//! ```
//!
//! Writers share the write half behind an async mutex, so frames from
//! concurrent operations never interleave. The receive task owns the read
//! half and completes pending operations as replies arrive.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use gdict_common::{body_len, decode_frame, encode_frame, CodecError, Frame, FrameKind, Status, LEN_PREFIX_SIZE};

use crate::config::{DriverConfig, Endpoint};
use crate::error::{DriverError, DriverResult};
use crate::events::{Event, EventBus};
use crate::pending::PendingTable;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Opaque identifier for one connection owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub const fn new(index: u64) -> Self {
        ConnectionHandle(index)
    }

    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

/// Parts shared with the receive task.
#[derive(Debug)]
struct Shared {
    handle: ConnectionHandle,
    state: Mutex<ConnectionState>,
    pending: PendingTable,
    events: EventBus,
    last_used: Mutex<Instant>,
    max_frame_size: usize,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        trace!(handle = %self.handle, from = ?*state, to = ?next, "state change");
        *state = next;
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Moves a live connection to `Failed`, fails its waiters, and reports it.
    /// No-op once the connection is already failed or shutting down.
    fn fail(&self, reason: String) {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => *state = ConnectionState::Failed,
                _ => return,
            }
        }
        let failed = self.pending.close();
        warn!(handle = %self.handle, %reason, failed, "connection failed");
        self.events.publish(Event::Failed {
            handle: self.handle,
            reason,
        });
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Reply => {
                self.touch();
                if let Err(frame) = self.pending.complete(frame) {
                    if frame.status == Status::Error {
                        let message = frame.value.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
                        warn!(handle = %self.handle, id = frame.id, %message, "unmatched error reply");
                    } else {
                        warn!(handle = %self.handle, id = frame.id, "discarding reply with unknown id");
                    }
                }
            }
            FrameKind::Notify => {
                trace!(handle = %self.handle, key = ?frame.key, "key changed");
                self.events.publish(Event::KeyChanged {
                    handle: self.handle,
                    key: frame.key,
                    value: frame.value,
                });
            }
            kind => warn!(handle = %self.handle, %kind, "discarding request frame sent by server"),
        }
    }
}

/// A live (or formerly live) session.
#[derive(Debug)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Read half parked until `start` hands it to the receive task.
    read_half: Mutex<Option<OwnedReadHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Performs the TCP handshake. Nothing is read from the socket until
    /// [`Connection::start`] runs, so no event for this handle can precede
    /// the caller's own announcement of it.
    pub(crate) async fn open(handle: ConnectionHandle, config: &DriverConfig, events: EventBus) -> DriverResult<Self> {
        let shared = Arc::new(Shared {
            handle,
            state: Mutex::new(ConnectionState::Idle),
            pending: PendingTable::new(),
            events,
            last_used: Mutex::new(Instant::now()),
            max_frame_size: config.max_frame_size,
        });
        let endpoint = config.endpoint.clone();

        shared.set_state(ConnectionState::Connecting);
        debug!(%handle, %endpoint, "connecting");

        let target = (endpoint.host(), endpoint.port());
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                shared.set_state(ConnectionState::Failed);
                return Err(match err.kind() {
                    std::io::ErrorKind::ConnectionRefused => DriverError::ConnectRefused { endpoint },
                    _ => DriverError::Io(err),
                });
            }
            Err(_) => {
                shared.set_state(ConnectionState::Failed);
                return Err(DriverError::ConnectTimeout {
                    endpoint,
                    timeout: config.connect_timeout,
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            shared.set_state(ConnectionState::Failed);
            return Err(DriverError::Io(err));
        }

        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        shared.set_state(ConnectionState::Connected);
        shared.touch();
        debug!(%handle, ?peer, "connected");

        Ok(Connection {
            shared,
            endpoint,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            read_half: Mutex::new(Some(read_half)),
            reader: Mutex::new(None),
        })
    }

    /// Spawns the receive task. Later calls do nothing.
    pub(crate) fn start(&self) {
        let Some(read_half) = self.read_half.lock().take() else {
            return;
        };
        let task = tokio::spawn(receive_loop(Arc::clone(&self.shared), read_half));
        *self.reader.lock() = Some(task);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.shared.pending
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.shared.last_used.lock())
    }

    /// Writes one frame. A transport error fails the whole connection.
    pub(crate) async fn send(&self, frame: &Frame) -> DriverResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(DriverError::ConnectionClosed);
        }
        let size = body_len(frame);
        if size > self.shared.max_frame_size {
            return Err(DriverError::MalformedFrame(CodecError::FrameTooLarge {
                size,
                max: self.shared.max_frame_size,
            }));
        }
        let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + size);
        encode_frame(frame, &mut buf);

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(DriverError::ConnectionClosed)?;

        // A write abandoned halfway would leave a partial frame on the wire.
        let mut guard = PartialWriteGuard {
            shared: &self.shared,
            armed: true,
        };
        let result = stream.write_all(&buf).await;
        guard.armed = false;
        drop(writer);

        match result {
            Ok(()) => {
                trace!(handle = %self.shared.handle, id = frame.id, kind = %frame.kind, size, "frame sent");
                self.shared.touch();
                Ok(())
            }
            Err(err) => {
                self.shared.fail(format!("write failed: {err}"));
                Err(DriverError::Io(err))
            }
        }
    }

    /// Cancels pending operations and releases the socket. Safe to call
    /// on a failed connection and more than once.
    pub(crate) async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => return,
                _ => *state = ConnectionState::Disconnecting,
            }
        }
        let cancelled = self.shared.pending.close();
        self.read_half.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        debug!(handle = %self.shared.handle, endpoint = %self.endpoint, cancelled, "disconnected");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        self.shared.pending.close();
    }
}

struct PartialWriteGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for PartialWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.fail("send cancelled mid-frame".to_string());
        }
    }
}

/// Reads frames until EOF, a transport error, or malformed input.
async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let reason = loop {
        match decode_frame(&mut buffer, shared.max_frame_size) {
            Ok(Some(frame)) => {
                trace!(handle = %shared.handle, id = frame.id, kind = %frame.kind, "frame received");
                shared.dispatch(frame);
                continue;
            }
            Ok(None) => {}
            Err(err) => break format!("malformed frame: {err}"),
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "connection closed by server".to_string(),
            Ok(_) => {}
            Err(err) => break format!("read failed: {err}"),
        }
    };
    shared.fail(reason);
}
