//! Shared helpers for the protocol integration tests.
//!
//! The helpers play the reader against a [`CardListener`] directly, without
//! any transceiver in between.

#![allow(dead_code)]

use tapkit_core::{BitBuffer, Uid};
use tapkit_protocol::CardListener;
use tapkit_protocol::iso14443_3a::{
    ActivationFrames, CascadeFrames, CascadeLevel, RequestKind, parse_sdd_response, sdd_request,
    sel_request, sens_request,
};
use tapkit_protocol::mf_classic::access::DEFAULT_ACCESS_BITS;
use tapkit_protocol::mf_classic::{trailer_of, KeyType, MfClassicData, MfClassicKey, MfClassicType};
use tapkit_protocol::Iso14443_3aData;

pub const UID_4: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
pub const UID_7: [u8; 7] = [0x04, 0x5A, 0x3B, 0x12, 0x6C, 0x80, 0x01];

/// Mifare Classic dump with every trailer in transport configuration and
/// both keys of each sector set to `key`.
pub fn mf_classic_data(uid: &[u8], card_type: MfClassicType, key: MfClassicKey) -> MfClassicData {
    let base = Iso14443_3aData::new(Uid::new(uid).unwrap(), [0x04, 0x00], 0x08);
    let mut data = MfClassicData::new(base, card_type);
    for block in 0..card_type.blocks_total() {
        let block = block as u8;
        data.set_block_read(block, &[block; 16]).unwrap();
    }
    for sector in 0..card_type.sectors_total() {
        let mut trailer = [0u8; 16];
        trailer[6..10].copy_from_slice(&DEFAULT_ACCESS_BITS);
        data.set_block_read(trailer_of(sector), &trailer).unwrap();
        data.set_key_found(sector, KeyType::A, key).unwrap();
        data.set_key_found(sector, KeyType::B, key).unwrap();
    }
    data
}

/// Send one frame and require an answer.
pub fn exchange(card: &mut CardListener, frame: &BitBuffer) -> BitBuffer {
    card.process(frame)
        .unwrap()
        .unwrap_or_else(|| panic!("card did not answer {frame}"))
}

/// Activate a single card level by level, recording every answer.
pub fn activate(card: &mut CardListener) -> ActivationFrames {
    let mut frames = ActivationFrames {
        atqa: exchange(card, &sens_request(RequestKind::Wupa)),
        levels: Vec::new(),
    };
    for level in CascadeLevel::ALL {
        let uid_cl = exchange(card, &sdd_request(level, &BitBuffer::new()).unwrap());
        let part = parse_sdd_response(&uid_cl).unwrap();
        let sak = exchange(card, &sel_request(level, &part).unwrap());
        let cascades = sak.raw_bytes()[0] & 0x04 != 0;
        frames.levels.push(CascadeFrames { uid_cl, sak });
        if !cascades {
            break;
        }
    }
    frames
}
