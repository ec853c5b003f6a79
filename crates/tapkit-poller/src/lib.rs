//! Poller state machines for the ISO14443-3A family.
//!
//! A poller owns a [`Transceiver`](tapkit_hardware::Transceiver) and drives
//! one card through activation and the exchanges of its family:
//!
//! - [`Iso14443_3aPoller`]: request, anticollision, select, halt. Every
//!   frame of every family goes through its `txrx`, which enforces the
//!   frame wait time and performs no retries.
//! - [`Iso14443_4aPoller`]: RATS/ATS and I-block exchanges.
//! - [`MfClassicPoller`]: Crypto1 authentication and block access.
//!
//! The [`ProtocolRegistry`] tells which family an activated card belongs to
//! and hands out the matching [`AnyReader`].
//!
//! # Example
//!
//! ```
//! use tapkit_core::{ProtocolType, Uid};
//! use tapkit_hardware::mock::MockTransceiver;
//! use tapkit_poller::{Iso14443_3aPoller, PollerConfig, ProtocolRegistry};
//! use tapkit_protocol::{CardListener, Iso14443_3aData, Iso14443_4aData};
//!
//! #[tokio::main]
//! async fn main() -> tapkit_core::Result<()> {
//!     let (transceiver, handle) = MockTransceiver::new();
//!     let uid = Uid::new(&[0x08, 0x44, 0x19, 0x7E])?;
//!     handle.add_card(CardListener::iso14443_4a(Iso14443_4aData {
//!         iso14443_3a: Iso14443_3aData::new(uid, [0x04, 0x00], 0x20),
//!         ats: None,
//!     }));
//!
//!     let mut poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
//!     let base = poller.activate().await?;
//!     assert_eq!(ProtocolRegistry::default().resolve(&base), ProtocolType::Iso14443_4a);
//!
//!     poller.halt().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod iso14443_3a;
pub mod iso14443_4a;
pub mod mf_classic;
pub mod registry;
pub mod state;

pub use config::PollerConfig;
pub use iso14443_3a::Iso14443_3aPoller;
pub use iso14443_4a::Iso14443_4aPoller;
pub use mf_classic::{MfClassicEvent, MfClassicPoller, WriteSummary};
pub use registry::{AnyReader, CardReader, Detector, ProtocolRegistry, ReadRequest};
pub use state::{PollerState, PollerStateMachine, PollerStateMachineBuilder, StateTransition};
