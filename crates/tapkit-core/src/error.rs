//! Error taxonomy shared by every NFC layer.
//!
//! Errors are grouped into kinds so that callers can decide between retrying,
//! reporting a bad card, or giving up without matching on every variant:
//!
//! | Kind        | Variants                                                  |
//! |-------------|-----------------------------------------------------------|
//! | `Transport` | `Timeout`, `NotPresent`                                   |
//! | `Framing`   | `WrongCrc`, `ColResFailed`, `Communication`, `Nack`, `AuthFailed` |
//! | `Semantic`  | `WrongCard`                                               |
//! | `Data`      | buffer, format and I/O failures                           |
//! | `Cancelled` | `Cancelled`                                               |
//!
//! Contract violations (starting a running worker, acquiring busy hardware
//! from a worker) are assertions and never appear here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("No response within frame wait time")]
    Timeout,

    #[error("Card not present")]
    NotPresent,

    // Framing errors
    #[error("CRC check failed")]
    WrongCrc,

    #[error("Collision resolution failed: {0}")]
    ColResFailed(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Card answered NACK 0x{0:X}")]
    Nack(u8),

    #[error("Authentication failed for block {block}")]
    AuthFailed { block: u8 },

    // Semantic errors
    #[error("Wrong card detected: expected {expected}, found {found}")]
    WrongCard { expected: String, found: String },

    // Data errors
    #[error("Buffer capacity exceeded: {requested_bits} bits requested, maximum is {max_bits}")]
    CapacityExceeded {
        requested_bits: usize,
        max_bits: usize,
    },

    #[error("Buffer is not byte aligned ({size_bits} bits)")]
    NotByteAligned { size_bits: usize },

    #[error("Index {index} out of bounds (length {len})")]
    OutOfBounds { index: usize, len: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Nothing answered. Always worth another polling cycle.
    Transport,
    /// Something answered but did not follow the protocol.
    Framing,
    /// Well-formed answer from the wrong kind of card.
    Semantic,
    /// Local data handling failed (buffers, files, parsing).
    Data,
    /// The operation was stopped by its owner.
    Cancelled,
}

impl Error {
    /// Classify this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_core::{Error, ErrorKind};
    ///
    /// assert_eq!(Error::Timeout.kind(), ErrorKind::Transport);
    /// assert_eq!(Error::WrongCrc.kind(), ErrorKind::Framing);
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout | Self::NotPresent => ErrorKind::Transport,
            Self::WrongCrc
            | Self::ColResFailed(_)
            | Self::Communication(_)
            | Self::Nack(_)
            | Self::AuthFailed { .. } => ErrorKind::Framing,
            Self::WrongCard { .. } => ErrorKind::Semantic,
            Self::CapacityExceeded { .. }
            | Self::NotByteAligned { .. }
            | Self::OutOfBounds { .. }
            | Self::InvalidData(_)
            | Self::Format(_)
            | Self::InvalidStateTransition { .. }
            | Self::Io(_) => ErrorKind::Data,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the worker loop may simply try again on the next cycle.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Create a collision resolution error.
    pub fn col_res(message: impl Into<String>) -> Self {
        Self::ColResFailed(message.into())
    }

    /// Create a communication error.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication(message.into())
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
