//! Enum wrapper for transceiver dispatch.
//!
//! Native `async fn` in traits is not object-safe, so `Box<dyn Transceiver>`
//! is not an option. [`AnyTransceiver`] provides concrete type dispatch
//! instead, and because every variant is a concrete type the futures it
//! returns are `Send` and can run inside spawned tasks.
//!
//! # Examples
//!
//! ```
//! use tapkit_hardware::devices::AnyTransceiver;
//! use tapkit_hardware::mock::MockTransceiver;
//! use tapkit_hardware::traits::Transceiver;
//!
//! #[tokio::main]
//! async fn main() -> tapkit_hardware::Result<()> {
//!     let (transceiver, _handle) = MockTransceiver::new();
//!     let any = AnyTransceiver::Mock(transceiver);
//!
//!     let info = any.info().await?;
//!     println!("Transceiver: {}", info.name);
//!     Ok(())
//! }
//! ```

use crate::mock::MockTransceiver;
use crate::traits::Transceiver;
use crate::types::{RxStatus, TransceiverInfo, TransceiverMode};
use crate::Result;
use tapkit_core::BitBuffer;

/// Enum wrapper for transceiver dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyTransceiver {
    /// Mock transceiver for development and testing.
    Mock(MockTransceiver),
}

impl From<MockTransceiver> for AnyTransceiver {
    fn from(transceiver: MockTransceiver) -> Self {
        Self::Mock(transceiver)
    }
}

impl Transceiver for AnyTransceiver {
    async fn field_on(&mut self) -> Result<()> {
        match self {
            Self::Mock(device) => device.field_on().await,
        }
    }

    async fn field_off(&mut self) -> Result<()> {
        match self {
            Self::Mock(device) => device.field_off().await,
        }
    }

    fn is_field_on(&self) -> bool {
        match self {
            Self::Mock(device) => device.is_field_on(),
        }
    }

    async fn set_mode(&mut self, mode: TransceiverMode) -> Result<()> {
        match self {
            Self::Mock(device) => device.set_mode(mode).await,
        }
    }

    fn mode(&self) -> TransceiverMode {
        match self {
            Self::Mock(device) => device.mode(),
        }
    }

    async fn tx(&mut self, frame: &BitBuffer) -> Result<()> {
        match self {
            Self::Mock(device) => device.tx(frame).await,
        }
    }

    async fn rx(&mut self, frame: &mut BitBuffer) -> Result<RxStatus> {
        match self {
            Self::Mock(device) => device.rx(frame).await,
        }
    }

    async fn info(&self) -> Result<TransceiverInfo> {
        match self {
            Self::Mock(device) => device.info().await,
        }
    }
}
