// gdict-common - Shared frame types and wire codec for Guaradict
//
// Both the client driver and the server speak the protocol defined here.

pub mod codec;
pub mod error;
pub mod frame;

// Re-export for convenience
pub use codec::*;
pub use error::*;
pub use frame::*;
