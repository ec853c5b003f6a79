//! Background worker for the tapkit NFC engine.
//!
//! A [`Worker`] takes the transceiver from a shared
//! [`HardwareContext`](tapkit_hardware::HardwareContext), runs one mode on a
//! tokio task and reports what happens through a bounded event channel:
//!
//! ```text
//! ┌──────────────┐  WorkerEvent   ┌─────────────────────┐
//! │ Worker task  │───────────────►│ WorkerEventReceiver │──────► Application
//! │ (poll loop)  │  (mpsc, bound) └─────────────────────┘
//! └──────┬───────┘
//!        │ TransceiverLease
//!        ▼
//!   RF front-end
//! ```
//!
//! The [`NfcDevice`] record belongs to the task while it runs and is handed
//! back by [`Worker::stop`].
//!
//! # Example
//!
//! ```
//! use tapkit_core::Uid;
//! use tapkit_hardware::mock::MockTransceiver;
//! use tapkit_hardware::{AnyTransceiver, HardwareContext};
//! use tapkit_protocol::{CardListener, Iso14443_3aData};
//! use tapkit_worker::{NfcDevice, Worker, WorkerConfig, WorkerEvent, WorkerMode};
//!
//! #[tokio::main]
//! async fn main() -> tapkit_core::Result<()> {
//!     let (transceiver, handle) = MockTransceiver::new();
//!     let uid = Uid::new(&[0x04, 0xAB, 0xCD, 0xEF])?;
//!     handle.add_card(CardListener::iso14443_3a(Iso14443_3aData::new(uid, [0x44, 0x00], 0x00)));
//!
//!     let context = HardwareContext::new(AnyTransceiver::from(transceiver));
//!     let mut worker = Worker::new(context, WorkerConfig::default());
//!     let mut events = worker.start(WorkerMode::Read { expected: None }, NfcDevice::new());
//!
//!     let mut outcome = None;
//!     events
//!         .dispatch(|event| {
//!             let more = !event.is_terminal();
//!             outcome = Some(event);
//!             more
//!         })
//!         .await;
//!     assert_eq!(outcome, Some(WorkerEvent::Success { partial: false }));
//!
//!     let device = worker.stop().await.expect("worker was running");
//!     assert!(device.data().is_some());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod event;
pub mod state;
pub mod worker;

pub use config::{ListenerConfig, MfClassicConfig, WorkerConfig};
pub use device::{DEVICE_FILE_VERSION, DEVICE_FILETYPE, NfcDevice};
pub use event::{WorkerEvent, WorkerEventReceiver};
pub use state::{WorkerMode, WorkerState};
pub use worker::Worker;
