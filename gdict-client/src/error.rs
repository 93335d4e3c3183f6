//! # Driver Errors
//!
//! Every failure a driver operation can report, one variant per kind so
//! callers can match on what went wrong instead of parsing messages.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use gdict_common::{CodecError, FrameKind, Status};

use crate::config::Endpoint;
use crate::connection::ConnectionHandle;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by the driver. None are retried automatically.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The endpoint did not accept the TCP handshake in time.
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },

    /// The endpoint actively refused the connection.
    #[error("connection to {endpoint} refused")]
    ConnectRefused { endpoint: Endpoint },

    /// The driver already holds its maximum number of connections.
    #[error("connection limit of {limit} reached")]
    TooManyConnections { limit: usize },

    /// The handle is unknown, disconnected, or no longer usable.
    #[error("invalid connection handle {0}")]
    InvalidHandle(ConnectionHandle),

    #[error("key must not be empty")]
    InvalidKey,

    /// No reply arrived before the operation deadline.
    #[error("operation {id} timed out after {timeout:?}")]
    OperationTimeout { id: u64, timeout: Duration },

    /// The connection was closed or failed while the operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The reply does not fit the request it answers.
    #[error("unexpected {status:?} reply to {request} request")]
    UnexpectedReply { request: FrameKind, status: Status },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while building, loading, or validating a `DriverConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint {0:?}: expected host:port")]
    InvalidEndpoint(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
