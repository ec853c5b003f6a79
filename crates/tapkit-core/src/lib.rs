//! Shared building blocks for the tapkit NFC engine: the error taxonomy,
//! card identity types, RF constants, the bit-oriented frame buffer and the
//! key-value persistence contract.

pub mod bit_buffer;
pub mod constants;
pub mod error;
pub mod format;
pub mod types;

pub use bit_buffer::BitBuffer;
pub use error::{Error, ErrorKind, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
