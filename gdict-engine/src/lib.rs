//! # Guaradict Storage Engine
//!
//! In-memory dictionary backing the Guaradict server.

mod engine;
mod memory;

pub use engine::Dictionary;
pub use memory::MemoryDictionary;
