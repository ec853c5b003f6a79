//! Mock transceiver for testing and development.
//!
//! The mock simulates an RF field holding any number of cards, each backed by
//! a [`CardListener`](tapkit_protocol::CardListener), so that pollers run
//! unmodified against it.

pub mod field;
pub mod transceiver;

// Re-export commonly used types
pub use field::{CardId, ExchangeCounters, Fault};
pub use transceiver::{MockTransceiver, MockTransceiverHandle};
