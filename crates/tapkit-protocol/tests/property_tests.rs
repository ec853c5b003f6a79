//! Property-based tests for the protocol codecs.

mod common;

use proptest::prelude::*;
use tapkit_core::{BitBuffer, Uid};
use tapkit_protocol::iso14443_3a::activate_parse;
use tapkit_protocol::iso14443_4a::AtsData;
use tapkit_protocol::mf_classic::access::AccessConditions;
use tapkit_protocol::{
    CardListener, Crypto1, Iso14443_3aData, MfClassicKey, append_crc_a, ats_parse, check_crc_a,
};

/// Strategy for UIDs of every legal length.
///
/// The first byte avoids the cascade tag, which real cards never use there.
fn valid_uid() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![Just(4usize), Just(7usize), Just(10usize)].prop_flat_map(|len| {
        (0u8..0x88, prop::collection::vec(any::<u8>(), len - 1)).prop_map(|(first, rest)| {
            let mut uid = vec![first];
            uid.extend(rest);
            uid
        })
    })
}

/// Strategy for well-formed ATS values.
fn valid_ats() -> impl Strategy<Value = AtsData> {
    (
        0u8..=8,
        prop::option::of(any::<u8>()),
        prop::option::of(any::<u8>()),
        prop::option::of(any::<u8>()),
        prop::collection::vec(any::<u8>(), 0..8),
    )
        .prop_map(|(fsci, ta_1, tb_1, tc_1, historical)| AtsData {
            fsci,
            ta_1,
            tb_1,
            tc_1,
            historical,
        })
}

proptest! {
    /// Property: any frame with CRC_A appended passes the check, and flipping
    /// a single bit breaks it.
    #[test]
    fn prop_crc_detects_single_bit_errors(
        payload in prop::collection::vec(any::<u8>(), 1..32),
        flip in any::<prop::sample::Index>(),
    ) {
        let mut frame = BitBuffer::from_bytes(&payload);
        append_crc_a(&mut frame).unwrap();
        prop_assert!(check_crc_a(&frame));

        let bit = flip.index(frame.size_bits());
        let value = frame.bit(bit).unwrap();
        frame.set_bit(bit, !value).unwrap();
        prop_assert!(!check_crc_a(&frame));
    }

    /// Property: a serialised ATS parses back to the same value.
    #[test]
    fn prop_ats_bytes_parse_back(ats in valid_ats()) {
        let bytes = ats.to_bytes().unwrap();
        prop_assert_eq!(usize::from(bytes[0]), bytes.len());
        prop_assert_eq!(ats_parse(&BitBuffer::from_bytes(&bytes)).unwrap(), Some(ats));
    }

    /// Property: activating an emulated card yields exactly its identity.
    #[test]
    fn prop_activation_recovers_identity(uid in valid_uid(), sak in 0u8..0x04) {
        let data = Iso14443_3aData::new(Uid::new(&uid).unwrap(), [0x44, 0x00], sak);
        let mut card = CardListener::iso14443_3a(data.clone());

        let frames = common::activate(&mut card);
        prop_assert_eq!(frames.levels.len(), data.uid.cascade_levels());
        prop_assert_eq!(activate_parse(&frames).unwrap(), data);
    }

    /// Property: two ciphers loaded with the same key stay in lockstep.
    #[test]
    fn prop_crypto1_round_trip(
        key in prop::array::uniform6(any::<u8>()),
        payload in prop::collection::vec(any::<u8>(), 1..24),
    ) {
        let key = MfClassicKey::new(key);
        let mut sender = Crypto1::new(&key);
        let mut receiver = Crypto1::new(&key);

        let plain = BitBuffer::from_bytes(&payload);
        let encrypted = sender.encrypt(&plain).unwrap();
        prop_assert_eq!(receiver.decrypt(&encrypted).unwrap(), plain);
    }

    /// Property: encoded access conditions decode to the same permissions.
    #[test]
    fn prop_access_bits_round_trip(groups in prop::array::uniform4(0u8..8), gpb in any::<u8>()) {
        let access = AccessConditions::from_groups(groups);
        let bytes = access.to_bytes(gpb);
        prop_assert_eq!(bytes[3], gpb);
        prop_assert_eq!(AccessConditions::parse(&bytes).unwrap(), access);
    }
}
