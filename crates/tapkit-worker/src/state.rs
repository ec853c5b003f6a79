//! Worker lifecycle.
//!
//! ```text
//! None ──► Ready ──► Detect | Read | Write | Emulate ──► Stop ──► None
//! ```
//!
//! `Ready` is only entered once the transceiver lease is held, and `Stop`
//! always switches the field off and releases the lease before the worker
//! returns to `None`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tapkit_core::ProtocolType;

/// What a started worker does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMode {
    /// Report cards entering and leaving the field.
    Detect,
    /// Read one card. With `expected` set, cards of other families are
    /// reported as wrong cards and skipped.
    Read { expected: Option<ProtocolType> },
    /// Write the device's Mifare Classic dump onto a card.
    Write,
    /// Answer readers as the device's card.
    Emulate,
}

impl WorkerMode {
    /// State the worker is in while running this mode.
    pub fn state(&self) -> WorkerState {
        match self {
            Self::Detect => WorkerState::Detect,
            Self::Read { .. } => WorkerState::Read,
            Self::Write => WorkerState::Write,
            Self::Emulate => WorkerState::Emulate,
        }
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    None,
    Ready,
    Detect,
    Read,
    Write,
    Emulate,
    Stop,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, target),
            (None, Ready)
                | (Ready, Detect | Read | Write | Emulate | Stop)
                | (Detect | Read | Write | Emulate, Stop)
                | (Stop, None)
        )
    }

    /// Whether a mode is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Detect | Self::Read | Self::Write | Self::Emulate)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Ready => "Ready",
            Self::Detect => "Detect",
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Emulate => "Emulate",
            Self::Stop => "Stop",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(WorkerState::None, WorkerState::Ready, true)]
    #[case(WorkerState::Ready, WorkerState::Read, true)]
    #[case(WorkerState::Read, WorkerState::Stop, true)]
    #[case(WorkerState::Stop, WorkerState::None, true)]
    #[case(WorkerState::None, WorkerState::Read, false)]
    #[case(WorkerState::Read, WorkerState::Emulate, false)]
    #[case(WorkerState::Read, WorkerState::None, false)]
    #[case(WorkerState::Stop, WorkerState::Ready, false)]
    fn test_transitions(#[case] from: WorkerState, #[case] to: WorkerState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_mode_states() {
        assert_eq!(WorkerMode::Read { expected: None }.state(), WorkerState::Read);
        assert!(WorkerMode::Emulate.state().is_running());
        assert!(!WorkerState::Ready.is_running());
    }
}
