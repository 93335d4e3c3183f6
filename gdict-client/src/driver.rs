//! # Async Driver API
//!
//! `Driver` is the caller-facing facade. It owns the table of live
//! connections, hands out [`ConnectionHandle`]s, and turns each operation into
//! a correlated request/reply exchange on the chosen connection.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Callers see handles and typed results, never frames.
//! 2. **Pipelining**: Any number of operations may be in flight on one
//!    connection; replies are matched by correlation id.
//! 3. **Fail Fast**: Nothing is retried; every failure is returned as-is.
//! 4. **Cheap Clones**: `Driver` is an `Arc` handle and can be shared freely
//!    between tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use gdict_common::{Frame, FrameKind, Status};

use crate::config::{DriverConfig, Endpoint};
use crate::connection::{Connection, ConnectionHandle, ConnectionState};
use crate::error::{DriverError, DriverResult};
use crate::events::{Event, EventBus, Subscription};

/// Shortest interval between idle sweeps.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct ConnectionTable {
    live: HashMap<ConnectionHandle, Arc<Connection>>,
    /// Slots reserved by `connect` calls still handshaking.
    connecting: usize,
}

#[derive(Debug)]
struct DriverInner {
    config: DriverConfig,
    table: Mutex<ConnectionTable>,
    events: EventBus,
    next_handle: AtomicU64,
    reaper_started: AtomicBool,
}

/// Asynchronous Guaradict driver.
#[derive(Debug, Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Creates a driver for `endpoint` (`host:port`) with default settings.
    pub fn new(endpoint: &str) -> DriverResult<Self> {
        let endpoint: Endpoint = endpoint.parse()?;
        Self::with_config(DriverConfig::new(endpoint))
    }

    /// Creates a driver with a custom configuration. No connection is opened.
    pub fn with_config(config: DriverConfig) -> DriverResult<Self> {
        config.validate()?;
        Ok(Driver {
            inner: Arc::new(DriverInner {
                config,
                table: Mutex::new(ConnectionTable::default()),
                events: EventBus::new(),
                next_handle: AtomicU64::new(1),
                reaper_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Starts receiving connection events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Handles currently held by the driver, in allocation order.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self.inner.table.lock().live.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// State of a held connection, `None` for unknown handles.
    pub fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.inner.table.lock().live.get(&handle).map(|conn| conn.state())
    }

    /// Operations still waiting for a reply on `handle`.
    pub fn pending_count(&self, handle: ConnectionHandle) -> DriverResult<usize> {
        let table = self.inner.table.lock();
        let conn = table.live.get(&handle).ok_or(DriverError::InvalidHandle(handle))?;
        Ok(conn.pending().len())
    }

    /// Opens a new connection to the configured endpoint.
    pub async fn connect(&self) -> DriverResult<ConnectionHandle> {
        let slot = self.reserve_slot()?;
        let handle = ConnectionHandle::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));

        let conn = Arc::new(Connection::open(handle, &self.inner.config, self.inner.events.clone()).await?);
        {
            let mut table = self.inner.table.lock();
            slot.consume(&mut table);
            table.live.insert(handle, Arc::clone(&conn));
        }

        // Announce the handle before its receive task can publish anything.
        self.inner.events.publish(Event::Connected { handle });
        conn.start();
        self.ensure_reaper();
        Ok(handle)
    }

    /// Stores `value` under `key`.
    pub async fn set(
        &self,
        handle: ConnectionHandle,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> DriverResult<()> {
        let key = checked_key(key)?;
        let value = value.into();
        let reply = self
            .execute(handle, FrameKind::Set, key.clone(), |id| Frame::set(id, key, value))
            .await?;
        match reply.status {
            Status::Ok => Ok(()),
            status => Err(unexpected(FrameKind::Set, status, &reply)),
        }
    }

    /// Fetches the value under `key`. `None` when the key does not exist.
    pub async fn get(&self, handle: ConnectionHandle, key: impl Into<Bytes>) -> DriverResult<Option<Bytes>> {
        let key = checked_key(key)?;
        let reply = self
            .execute(handle, FrameKind::Get, key.clone(), |id| Frame::get(id, key))
            .await?;
        match (reply.status, &reply.value) {
            (Status::Ok, Some(value)) => Ok(Some(value.clone())),
            (Status::NotFound, None) => Ok(None),
            _ => Err(unexpected(FrameKind::Get, reply.status, &reply)),
        }
    }

    /// Removes `key`. Returns whether a key was removed.
    pub async fn delete(&self, handle: ConnectionHandle, key: impl Into<Bytes>) -> DriverResult<bool> {
        let key = checked_key(key)?;
        let reply = self
            .execute(handle, FrameKind::Delete, key.clone(), |id| Frame::delete(id, key))
            .await?;
        match reply.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            status => Err(unexpected(FrameKind::Delete, status, &reply)),
        }
    }

    /// Round-trips an empty frame and returns the measured latency.
    pub async fn ping(&self, handle: ConnectionHandle) -> DriverResult<Duration> {
        let started = Instant::now();
        let reply = self.execute(handle, FrameKind::Ping, Bytes::new(), Frame::ping).await?;
        match reply.status {
            Status::Ok => Ok(started.elapsed()),
            status => Err(unexpected(FrameKind::Ping, status, &reply)),
        }
    }

    /// Closes the connection and forgets its handle. Pending operations on
    /// it fail with `ConnectionClosed`.
    pub async fn disconnect(&self, handle: ConnectionHandle) -> DriverResult<()> {
        let conn = self
            .inner
            .table
            .lock()
            .live
            .remove(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        conn.close().await;
        self.inner.events.publish(Event::Disconnected { handle });
        Ok(())
    }

    /// Disconnects every held connection.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.inner.table.lock().live.drain().collect();
        for (handle, conn) in drained {
            conn.close().await;
            self.inner.events.publish(Event::Disconnected { handle });
        }
    }

    fn reserve_slot(&self) -> DriverResult<ConnectSlot> {
        let mut table = self.inner.table.lock();
        let limit = self.inner.config.max_connections;
        if table.live.len() + table.connecting >= limit {
            return Err(DriverError::TooManyConnections { limit });
        }
        table.connecting += 1;
        Ok(ConnectSlot {
            driver: Arc::downgrade(&self.inner),
            held: true,
        })
    }

    /// Looks up a connection that can take new operations.
    fn usable(&self, handle: ConnectionHandle) -> DriverResult<Arc<Connection>> {
        let table = self.inner.table.lock();
        match table.live.get(&handle) {
            Some(conn) if conn.state() == ConnectionState::Connected => Ok(Arc::clone(conn)),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    /// Registers, sends, and awaits one request.
    async fn execute<F>(&self, handle: ConnectionHandle, kind: FrameKind, key: Bytes, build: F) -> DriverResult<Frame>
    where
        F: FnOnce(u64) -> Frame,
    {
        let conn = self.usable(handle)?;
        let timeout = self.inner.config.operation_timeout;
        let mut registration = conn.pending().register(kind, key, timeout)?;
        let id = registration.id;
        let mut guard = PendingGuard {
            conn: &conn,
            id,
            armed: true,
        };

        conn.send(&build(id)).await?;
        trace!(%handle, id, %kind, "request in flight");

        let outcome = tokio::time::timeout_at(registration.deadline, &mut registration.rx).await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            // Slot dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(DriverError::ConnectionClosed),
            Err(_) => {
                if conn.pending().cancel(id) {
                    debug!(%handle, id, ?timeout, "operation timed out");
                    Err(DriverError::OperationTimeout { id, timeout })
                } else {
                    // Answered between the deadline and the cancel.
                    registration.rx.try_recv().unwrap_or(Err(DriverError::ConnectionClosed))
                }
            }
        };
        guard.armed = false;

        let reply = result?;
        match reply.status {
            Status::Error => Err(DriverError::Server(error_message(&reply))),
            _ => Ok(reply),
        }
    }

    fn ensure_reaper(&self) {
        let Some(idle) = self.inner.config.idle_timeout else {
            return;
        };
        if self.inner.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = (idle / 2).max(MIN_REAP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Driver { inner }.reap_idle(idle).await;
            }
        });
    }

    /// Closes connections with nothing in flight that have been unused for
    /// at least `idle`.
    async fn reap_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(ConnectionHandle, Arc<Connection>)> = {
            let mut table = self.inner.table.lock();
            let handles: Vec<ConnectionHandle> = table
                .live
                .iter()
                .filter(|(_, conn)| conn.pending().len() == 0 && conn.idle_for(now) >= idle)
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| table.live.remove(&handle).map(|conn| (handle, conn)))
                .collect()
        };

        let count = expired.len();
        for (handle, conn) in expired {
            debug!(%handle, idle_for = ?conn.idle_for(now), "closing idle connection");
            conn.close().await;
            self.inner.events.publish(Event::Disconnected { handle });
        }
        count
    }
}

/// Connection-limit slot held while a handshake is in progress. Released
/// on drop so an abandoned `connect` does not leak it.
struct ConnectSlot {
    driver: Weak<DriverInner>,
    held: bool,
}

impl ConnectSlot {
    /// Hands the slot over to a live table entry.
    fn consume(mut self, table: &mut ConnectionTable) {
        table.connecting = table.connecting.saturating_sub(1);
        self.held = false;
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Some(inner) = self.driver.upgrade() {
            let mut table = inner.table.lock();
            table.connecting = table.connecting.saturating_sub(1);
        }
    }
}

/// Removes a pending entry whose waiter went away before it was answered.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.pending().cancel(self.id);
        }
    }
}

fn checked_key(key: impl Into<Bytes>) -> DriverResult<Bytes> {
    let key = key.into();
    if key.is_empty() {
        return Err(DriverError::InvalidKey);
    }
    Ok(key)
}

fn error_message(reply: &Frame) -> String {
    reply
        .value
        .as_deref()
        .map(|message| String::from_utf8_lossy(message).into_owned())
        .unwrap_or_default()
}

fn unexpected(request: FrameKind, status: Status, reply: &Frame) -> DriverError {
    debug!(%request, ?status, id = reply.id, has_value = reply.value.is_some(), "reply does not fit request");
    DriverError::UnexpectedReply { request, status }
}
