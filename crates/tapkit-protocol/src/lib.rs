//! Pure NFC protocol codecs.
//!
//! Frame builders, parsers and card-side state machines for ISO14443-3A,
//! ISO14443-4A and Mifare Classic. Nothing here touches hardware; pollers in
//! `tapkit-poller` sequence these against a transceiver.

pub mod crc;
pub mod data;
pub mod iso14443_3a;
pub mod iso14443_4a;
pub mod listener;
pub mod mf_classic;

pub use crc::{append_crc_a, bcc, check_crc_a, crc_a, trim_crc_a};
pub use data::ProtocolData;
pub use iso14443_3a::{CascadeLevel, Iso14443_3aData, RequestKind};
pub use iso14443_4a::{AtsData, Iso14443_4aData, ats_fill_default, ats_parse};
pub use listener::CardListener;
pub use mf_classic::crypto1::Crypto1;
pub use mf_classic::dictionary::MfClassicDict;
pub use mf_classic::{KeyType, MfClassicData, MfClassicKey, MfClassicType};
