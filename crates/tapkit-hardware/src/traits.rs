//! Transceiver trait definition.
//!
//! A transceiver is the RF front-end: it switches the field, sends a frame
//! and hands back whatever came over the air. Everything protocol-specific
//! (CRC, parity checks, timing budgets, retries) lives above it.
//!
//! The trait uses native `async fn` methods (Rust 1.90 + Edition 2024
//! RPITIT), so it is not object-safe. Use [`AnyTransceiver`] for dynamic
//! selection.
//!
//! [`AnyTransceiver`]: crate::devices::AnyTransceiver

#![allow(async_fn_in_trait)]

use crate::error::Result;
use crate::types::{RxStatus, TransceiverInfo, TransceiverMode};
use tapkit_core::BitBuffer;

/// RF front-end.
///
/// # Contract
///
/// - `tx` and `rx` only work while the field is on in poller mode.
/// - `rx` completes only when a frame is available. It never times out on
///   its own; the caller bounds it with the frame wait time and must be able
///   to drop the future at any point.
/// - A collision is reported in the [`RxStatus`], not as an error.
///
/// # Examples
///
/// ```
/// use tapkit_core::BitBuffer;
/// use tapkit_hardware::mock::MockTransceiver;
/// use tapkit_hardware::traits::Transceiver;
///
/// #[tokio::main]
/// async fn main() -> tapkit_hardware::Result<()> {
///     let (mut transceiver, _handle) = MockTransceiver::new();
///     transceiver.field_on().await?;
///     assert!(transceiver.is_field_on());
///
///     let mut reqa = BitBuffer::new();
///     reqa.append_bits(0x26, 7)?;
///     transceiver.tx(&reqa).await?;
///
///     transceiver.field_off().await?;
///     Ok(())
/// }
/// ```
pub trait Transceiver: Send + Sync {
    /// Switch the RF field on.
    async fn field_on(&mut self) -> Result<()>;

    /// Switch the RF field off. Cards in the field lose power.
    async fn field_off(&mut self) -> Result<()>;

    fn is_field_on(&self) -> bool;

    /// Switch between poller and listener role.
    async fn set_mode(&mut self, mode: TransceiverMode) -> Result<()>;

    fn mode(&self) -> TransceiverMode;

    /// Transmit one frame exactly as given (bit length and parity bits).
    async fn tx(&mut self, frame: &BitBuffer) -> Result<()>;

    /// Wait for the next frame and store it in `frame`.
    async fn rx(&mut self, frame: &mut BitBuffer) -> Result<RxStatus>;

    /// Device metadata.
    async fn info(&self) -> Result<TransceiverInfo>;
}

/// Pollers take their transceiver by value; this lets them borrow one held
/// in a [`TransceiverLease`](crate::context::TransceiverLease).
impl<T: Transceiver> Transceiver for &mut T {
    async fn field_on(&mut self) -> Result<()> {
        (**self).field_on().await
    }

    async fn field_off(&mut self) -> Result<()> {
        (**self).field_off().await
    }

    fn is_field_on(&self) -> bool {
        (**self).is_field_on()
    }

    async fn set_mode(&mut self, mode: TransceiverMode) -> Result<()> {
        (**self).set_mode(mode).await
    }

    fn mode(&self) -> TransceiverMode {
        (**self).mode()
    }

    async fn tx(&mut self, frame: &BitBuffer) -> Result<()> {
        (**self).tx(frame).await
    }

    async fn rx(&mut self, frame: &mut BitBuffer) -> Result<RxStatus> {
        (**self).rx(frame).await
    }

    async fn info(&self) -> Result<TransceiverInfo> {
        (**self).info().await
    }
}
