//! Shared fixtures for the poller integration tests.

#![allow(dead_code)]

use tapkit_core::Uid;
use tapkit_hardware::mock::{MockTransceiver, MockTransceiverHandle};
use tapkit_poller::{Iso14443_3aPoller, PollerConfig};
use tapkit_protocol::mf_classic::access::DEFAULT_ACCESS_BITS;
use tapkit_protocol::mf_classic::{blocks_in_sector, first_block, trailer_of};
use tapkit_protocol::{CardListener, Iso14443_3aData, KeyType, MfClassicData, MfClassicKey, MfClassicType};

pub const UID_4: [u8; 4] = [0xC0, 0xFF, 0xEE, 0x42];
pub const UID_7: [u8; 7] = [0x04, 0x5A, 0x3B, 0x12, 0x6C, 0x80, 0x01];

/// Key found in no dictionary the tests use.
pub const SECRET_KEY: MfClassicKey = MfClassicKey::new([0x5E, 0xC2, 0xE7, 0x00, 0x13, 0x37]);

pub fn poller() -> (Iso14443_3aPoller<MockTransceiver>, MockTransceiverHandle) {
    poller_with(PollerConfig::default())
}

pub fn poller_with(config: PollerConfig) -> (Iso14443_3aPoller<MockTransceiver>, MockTransceiverHandle) {
    let (transceiver, handle) = MockTransceiver::new();
    (Iso14443_3aPoller::new(transceiver, config), handle)
}

pub fn plain_card(uid: &[u8], atqa: [u8; 2], sak: u8) -> CardListener {
    CardListener::iso14443_3a(Iso14443_3aData::new(Uid::new(uid).unwrap(), atqa, sak))
}

/// Mifare Classic dump where every block holds its own number and each
/// sector's keys come from `key_of(sector)`.
pub fn mf_classic_dump(card_type: MfClassicType, key_of: impl Fn(u8) -> MfClassicKey) -> MfClassicData {
    let (atqa, sak) = match card_type {
        MfClassicType::Mini => ([0x04, 0x00], 0x09),
        MfClassicType::Classic1k => ([0x04, 0x00], 0x08),
        MfClassicType::Classic4k => ([0x02, 0x00], 0x18),
    };
    let base = Iso14443_3aData::new(Uid::new(&UID_4).unwrap(), atqa, sak);
    let mut data = MfClassicData::new(base, card_type);
    for sector in 0..card_type.sectors_total() {
        let first = first_block(sector);
        for block in first..first + blocks_in_sector(sector) {
            data.set_block_read(block, &[block; 16]).unwrap();
        }
        let mut trailer = [0u8; 16];
        trailer[6..10].copy_from_slice(&DEFAULT_ACCESS_BITS);
        data.set_block_read(trailer_of(sector), &trailer).unwrap();
        data.set_key_found(sector, KeyType::A, key_of(sector)).unwrap();
        data.set_key_found(sector, KeyType::B, key_of(sector)).unwrap();
    }
    data
}
