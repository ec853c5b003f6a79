//! RF front-end abstraction for the tapkit NFC engine.
//!
//! This crate defines the [`Transceiver`] contract pollers are written
//! against, the [`HardwareContext`] that hands out exclusive use of the one
//! front-end a device has, and a mock implementation that simulates cards in
//! the field.
//!
//! # Design
//!
//! - **Async-first**: native `async fn` in traits (Rust 1.90 + Edition 2024
//!   RPITIT).
//! - **Dumb front-end**: a transceiver moves bits. CRC, parity, timing and
//!   retries belong to the pollers.
//! - **Exclusive**: only a [`TransceiverLease`] can drive the hardware, and
//!   only one lease exists at a time.
//!
//! # Example
//!
//! ```
//! use tapkit_hardware::{AnyTransceiver, HardwareContext, Transceiver};
//! use tapkit_hardware::mock::MockTransceiver;
//!
//! #[tokio::main]
//! async fn main() -> tapkit_hardware::Result<()> {
//!     let (transceiver, _handle) = MockTransceiver::new();
//!     let context = HardwareContext::new(AnyTransceiver::from(transceiver));
//!
//!     let mut lease = context.try_acquire()?;
//!     lease.field_on().await?;
//!     lease.field_off().await?;
//!     lease.release();
//!     Ok(())
//! }
//! ```
//!
//! [`Transceiver`]: traits::Transceiver
//! [`HardwareContext`]: context::HardwareContext
//! [`TransceiverLease`]: context::TransceiverLease

pub mod context;
pub mod devices;
pub mod error;
pub mod mock;
pub mod traits;
pub mod types;

// Re-export commonly used types for convenience
pub use context::{HardwareContext, TransceiverLease};
pub use devices::AnyTransceiver;
pub use error::{HardwareError, Result};
pub use traits::Transceiver;
pub use types::{RxStatus, TransceiverInfo, TransceiverMode};
