//! # Driver Configuration
//!
//! `DriverConfig` can be built in code with [`DriverConfig::builder`] or
//! loaded from a JSON document whose durations are given in milliseconds:
//!
//! ```json
//! {
//!   "endpoint": "127.0.0.1:13141",
//!   "connect_timeout_ms": 30000,
//!   "operation_timeout_ms": 5000,
//!   "max_connections": 10,
//!   "idle_timeout_ms": 10000,
//!   "max_frame_size": 16777216
//! }
//! ```
//!
//! Only `endpoint` is required.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use gdict_common::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, MAX_FRAME_SIZE_LIMIT};

use crate::error::ConfigError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Server address as `host:port`. IPv6 hosts are written `[::1]:13141`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(rest) => rest.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Settings shared by every connection a driver opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub endpoint: Endpoint,
    /// Upper bound on the TCP handshake.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for one reply.
    pub operation_timeout: Duration,
    /// Live plus connecting sessions allowed at once.
    pub max_connections: usize,
    /// Connections unused for this long are closed. `None` keeps them open.
    pub idle_timeout: Option<Duration>,
    /// Largest frame sent or accepted, in bytes after the length prefix.
    pub max_frame_size: usize,
}

impl DriverConfig {
    /// Default settings for `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        DriverConfig {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn builder(endpoint: Endpoint) -> DriverConfigBuilder {
        DriverConfigBuilder {
            config: DriverConfig::new(endpoint),
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let config = raw.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be greater than zero"));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid("operation_timeout must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be greater than zero"));
        }
        if self.idle_timeout.is_some_and(|idle| idle.is_zero()) {
            return Err(ConfigError::Invalid("idle_timeout must be greater than zero"));
        }
        if self.max_frame_size < HEADER_SIZE {
            return Err(ConfigError::Invalid("max_frame_size is smaller than a frame header"));
        }
        if self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(ConfigError::Invalid("max_frame_size does not fit the 32-bit length prefix"));
        }
        Ok(())
    }
}

/// Builder for [`DriverConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    pub fn build(self) -> Result<DriverConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// On-disk shape of the config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    endpoint: String,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    operation_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default)]
    idle_timeout_ms: Option<u64>,
    #[serde(default = "default_max_frame_size")]
    max_frame_size: usize,
}

impl RawConfig {
    fn into_config(self) -> Result<DriverConfig, ConfigError> {
        Ok(DriverConfig {
            endpoint: self.endpoint.parse()?,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
            max_frame_size: self.max_frame_size,
        })
    }
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
