//! # TCP Server
//!
//! Accept Guaradict sessions, decode frames, and dispatch them to the
//! dictionary with minimal overhead.
//!
//! Every session runs in its own task. Successful writes are broadcast to
//! the other sessions as NOTIFY frames.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use gdict_common::{
    decode_frame, encode_frame, Frame, FrameKind, Status, DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT,
    UNSOLICITED_ID,
};
use gdict_engine::Dictionary;

/// Address the binary listens on when none is given.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:13141";

/// Pending notifications per session before a slow reader starts losing them.
const NOTIFY_CAPACITY: usize = 1024;

/// A key change published by one session for all the others.
#[derive(Debug, Clone)]
struct Notification {
    origin: u64,
    frame: Frame,
}

/// State shared by every session of one server.
struct Shared {
    dictionary: Arc<dyn Dictionary>,
    notifications: broadcast::Sender<Notification>,
    max_frame_size: usize,
}

impl Shared {
    fn publish(&self, origin: u64, frame: Frame) {
        // No receivers just means no other session is listening.
        let _ = self.notifications.send(Notification { origin, frame });
    }
}

/// Bound, not yet running server.
pub struct Server {
    listener: TcpListener,
    dictionary: Arc<dyn Dictionary>,
    max_frame_size: usize,
}

impl Server {
    /// Binds the listener and prepares shared state.
    pub async fn bind(addr: impl ToSocketAddrs, dictionary: Arc<dyn Dictionary>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            dictionary,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    /// Overrides the largest frame a session accepts, capped at what the
    /// length prefix can describe.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE_LIMIT);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves forever.
    pub async fn run(self) -> io::Result<()> {
        self.serve_until(std::future::pending::<()>()).await
    }

    /// Serves until `shutdown` completes, then closes every session.
    pub async fn serve_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);
        let shared = Arc::new(Shared {
            dictionary: self.dictionary,
            notifications,
            max_frame_size: self.max_frame_size,
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut next_session: u64 = 1;
        tokio::pin!(shutdown);

        info!(addr = ?self.listener.local_addr().ok(), "server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            // Accept errors (e.g. EMFILE) affect one attempt, not the listener.
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let session = next_session;
                    next_session += 1;
                    let shared = Arc::clone(&shared);
                    let stop = stop_rx.clone();
                    debug!(session, %peer, "session opened");

                    tokio::spawn(async move {
                        if let Err(err) = handle_session(socket, session, shared, stop).await {
                            debug!(session, %peer, error = %err, "session ended with error");
                        } else {
                            debug!(session, %peer, "session closed");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("server shutting down");
                    let _ = stop_tx.send(true);
                    return Ok(());
                }
            }
        }
    }

    /// Runs the server on the current runtime and returns a handle to stop it.
    ///
    /// Dropping the handle also stops the server.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(self.serve_until(async move {
            let _ = shutdown_rx.await;
        }));
        Ok(ServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            join,
        })
    }
}

/// Handle to a server started with [`Server::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes all sessions, and waits for the accept loop.
    pub async fn shutdown(mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.join).await {
            Ok(result) => result,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }
}

/// Handles a single client session until EOF, a fatal frame, or shutdown.
async fn handle_session(
    stream: TcpStream,
    session: u64,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);
    let mut notifications = shared.notifications.subscribe();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }

                loop {
                    match decode_frame(&mut buffer, shared.max_frame_size) {
                        Ok(Some(frame)) => {
                            trace!(session, id = frame.id, kind = %frame.kind, "request");
                            let reply = dispatch_frame(frame, session, &shared);
                            encode_frame(&reply, &mut out);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(session, error = %err, "malformed frame, closing session");
                            encode_frame(&Frame::error_reply(UNSOLICITED_ID, &err.to_string()), &mut out);
                            writer.write_all(&out).await?;
                            writer.shutdown().await?;
                            return Ok(());
                        }
                    }
                }

                if !out.is_empty() {
                    writer.write_all(&out).await?;
                    out.clear();
                }
            }
            note = notifications.recv() => match note {
                Ok(note) if note.origin != session => {
                    encode_frame(&note.frame, &mut out);
                    writer.write_all(&out).await?;
                    out.clear();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session, skipped, "session lagged behind notifications");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = stop.changed() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        }
    }
}

fn dispatch_frame(frame: Frame, session: u64, shared: &Shared) -> Frame {
    let id = frame.id;
    match frame.kind {
        FrameKind::Get => match shared.dictionary.get(&frame.key) {
            Some(value) => Frame::reply(id, Status::Ok, Some(value)),
            None => Frame::reply(id, Status::NotFound, None),
        },
        FrameKind::Set => {
            // Copy out of the receive buffer so stored entries don't pin it.
            let key = Bytes::copy_from_slice(&frame.key);
            let value = Bytes::copy_from_slice(frame.value.as_deref().unwrap_or_default());
            shared.dictionary.set(key.clone(), value.clone());
            shared.publish(session, Frame::notify(key, Some(value)));
            Frame::reply(id, Status::Ok, None)
        }
        FrameKind::Delete => {
            if shared.dictionary.delete(&frame.key) {
                shared.publish(session, Frame::notify(Bytes::copy_from_slice(&frame.key), None));
                Frame::reply(id, Status::Ok, None)
            } else {
                Frame::reply(id, Status::NotFound, None)
            }
        }
        FrameKind::Ping => Frame::reply(id, Status::Ok, None),
        FrameKind::Reply | FrameKind::Notify => Frame::error_reply(id, "unexpected frame kind"),
    }
}
