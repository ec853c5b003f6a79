//! Error types for transceiver operations.
//!
//! These cover front-end faults only. Pollers convert them into the NFC
//! taxonomy of [`tapkit_core::Error`] so that upper layers see one error
//! type.

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// Errors that can occur while driving a transceiver.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The transceiver is leased by someone else.
    #[error("Transceiver busy")]
    Busy,

    /// The RF field is off (poller) or the reader's field went away
    /// (listener).
    #[error("RF field is off")]
    FieldOff,

    /// Front-end level timeout.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Device is not connected or has been disconnected.
    #[error("Device disconnected: {device}")]
    Disconnected { device: String },

    /// Invalid data handed to or received from the device.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },
}

impl HardwareError {
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }
}

impl From<tapkit_core::Error> for HardwareError {
    fn from(error: tapkit_core::Error) -> Self {
        Self::invalid_data(error.to_string())
    }
}

impl From<HardwareError> for tapkit_core::Error {
    fn from(error: HardwareError) -> Self {
        match error {
            HardwareError::Timeout { .. } => Self::Timeout,
            HardwareError::FieldOff => Self::NotPresent,
            other => Self::communication(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapkit_core::ErrorKind;

    #[test]
    fn test_timeout_error() {
        let error = HardwareError::timeout(3000);
        assert!(matches!(error, HardwareError::Timeout { .. }));
        assert_eq!(error.to_string(), "Operation timeout after 3000ms");
    }

    #[test]
    fn test_disconnected_error() {
        let error = HardwareError::disconnected("mock");
        assert_eq!(error.to_string(), "Device disconnected: mock");
    }

    #[test]
    fn test_conversion_keeps_transport_kind() {
        let timeout: tapkit_core::Error = HardwareError::timeout(10).into();
        assert_eq!(timeout.kind(), ErrorKind::Transport);

        let field_off: tapkit_core::Error = HardwareError::FieldOff.into();
        assert!(matches!(field_off, tapkit_core::Error::NotPresent));

        let busy: tapkit_core::Error = HardwareError::Busy.into();
        assert_eq!(busy.kind(), ErrorKind::Framing);
        assert_eq!(busy.to_string(), "Communication error: Transceiver busy");
    }
}
