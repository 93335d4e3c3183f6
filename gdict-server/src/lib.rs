//! # Guaradict Server
//!
//! TCP server speaking the Guaradict frame protocol on top of a
//! [`gdict_engine::Dictionary`].

mod server;

pub use server::{Server, ServerHandle, DEFAULT_LISTEN_ADDR};
