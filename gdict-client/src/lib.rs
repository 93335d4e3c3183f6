//! # Guaradict Async Driver
//!
//! Client driver for the Guaradict key-value server: open connections,
//! issue pipelined GET/SET/DELETE/PING requests, and watch key changes
//! pushed by the server.
//!
//! ```no_run
//! # async fn demo() -> gdict_client::DriverResult<()> {
//! let driver = gdict_client::Driver::new("127.0.0.1:13141")?;
//! let handle = driver.connect().await?;
//! driver.set(handle, "my-key", "val").await?;
//! assert_eq!(driver.get(handle, "my-key").await?.as_deref(), Some(&b"val"[..]));
//! driver.disconnect(handle).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod driver;
mod error;
mod events;
mod pending;

pub use config::{
    DriverConfig, DriverConfigBuilder, Endpoint, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_OPERATION_TIMEOUT,
};
pub use connection::{ConnectionHandle, ConnectionState};
pub use driver::Driver;
pub use error::{ConfigError, DriverError, DriverResult};
pub use events::{Event, Subscription};
