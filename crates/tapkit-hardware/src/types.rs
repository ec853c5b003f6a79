//! Types shared by transceiver implementations.

use serde::{Deserialize, Serialize};
use tapkit_core::ProtocolType;

/// Role of the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransceiverMode {
    /// Generate the field and talk to cards.
    #[default]
    Poller,
    /// Answer a reader's field as a card.
    Listener,
}

/// How a frame was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// A clean frame.
    Complete,
    /// Several cards answered; bits from `first_bit` on are not reliable.
    Collision { first_bit: usize },
}

impl RxStatus {
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }
}

/// Transceiver metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransceiverInfo {
    /// Device name (e.g., "ST25R3916", "Mock Transceiver").
    pub name: String,

    /// Protocols the front-end can poll.
    pub protocols: Vec<ProtocolType>,

    /// Largest frame the front-end buffers, in bits.
    pub max_frame_bits: usize,

    /// Whether card emulation is available.
    pub listener_supported: bool,
}

impl TransceiverInfo {
    pub fn new(name: impl Into<String>, protocols: Vec<ProtocolType>) -> Self {
        Self {
            name: name.into(),
            protocols,
            max_frame_bits: 256 * 8,
            listener_supported: false,
        }
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_bits(mut self, max_frame_bits: usize) -> Self {
        self.max_frame_bits = max_frame_bits;
        self
    }

    /// Mark card emulation as supported.
    pub fn with_listener(mut self) -> Self {
        self.listener_supported = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_builder() {
        let info = TransceiverInfo::new("Front-end", ProtocolType::ALL.to_vec())
            .with_max_frame_bits(128)
            .with_listener();
        assert_eq!(info.max_frame_bits, 128);
        assert!(info.listener_supported);
    }

    #[test]
    fn test_info_serializes() {
        let info = TransceiverInfo::new("Front-end", vec![ProtocolType::Iso14443_3a]);
        let json = serde_json::to_string(&info).unwrap();
        let back: TransceiverInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
