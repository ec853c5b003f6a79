//! Card-side Mifare Classic.
//!
//! Runs on top of a selected ISO14443-3A card. Handles the three-pass
//! authentication and the encrypted READ, WRITE and HALT commands against an
//! in-memory [`MfClassicData`]. Only first authentications are supported: a
//! reader must halt and re-select the card before authenticating another
//! sector.

use super::access::AccessConditions;
use super::crypto1::{Crypto1, prng_successor};
use super::{Block, KeyType, MfClassicData, ack_frame, is_trailer, sector_of, trailer_of};
use crate::crc::{append_crc_a, check_crc_a};
use subtle::ConstantTimeEq;
use tapkit_core::constants::*;
use tapkit_core::{BitBuffer, Result};
use tracing::{debug, trace};

/// Authentication progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfClassicListenerState {
    Idle,
    NonceSent {
        nt: u32,
        sector: u8,
        key_type: KeyType,
    },
    Authenticated {
        sector: u8,
        key_type: KeyType,
    },
    WriteData {
        sector: u8,
        key_type: KeyType,
        block: u8,
    },
}

/// Outcome of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfClassicAction {
    /// Send this frame back.
    Respond(BitBuffer),
    /// Not a Mifare Classic command; another layer may handle it.
    Unhandled,
    /// Encrypted HALT: the card goes to the halted state.
    Halt,
    /// Protocol error: optionally send a final frame, then drop the
    /// selection.
    Abort(Option<BitBuffer>),
}

/// Card side of Mifare Classic.
#[derive(Debug, Clone)]
pub struct MfClassicListener {
    data: MfClassicData,
    cipher: Crypto1,
    state: MfClassicListenerState,
}

impl MfClassicListener {
    pub fn new(data: MfClassicData) -> Self {
        Self {
            data,
            cipher: Crypto1::default(),
            state: MfClassicListenerState::Idle,
        }
    }

    pub fn data(&self) -> &MfClassicData {
        &self.data
    }

    pub fn into_data(self) -> MfClassicData {
        self.data
    }

    pub fn state(&self) -> MfClassicListenerState {
        self.state
    }

    /// Forget any authentication.
    pub fn reset(&mut self) {
        self.cipher.reset();
        self.state = MfClassicListenerState::Idle;
    }

    /// Process one frame received while the 3A layer is active.
    pub fn process(&mut self, frame: &BitBuffer) -> Result<MfClassicAction> {
        match self.state {
            MfClassicListenerState::Idle => self.process_plain(frame),
            MfClassicListenerState::NonceSent {
                nt,
                sector,
                key_type,
            } => self.process_reader_answer(frame, nt, sector, key_type),
            MfClassicListenerState::Authenticated { sector, key_type } => {
                self.process_command(frame, sector, key_type)
            }
            MfClassicListenerState::WriteData {
                sector,
                key_type,
                block,
            } => self.process_write_data(frame, sector, key_type, block),
        }
    }

    fn process_plain(&mut self, frame: &BitBuffer) -> Result<MfClassicAction> {
        if frame.size_bits() != 32 || !check_crc_a(frame) {
            return Ok(MfClassicAction::Unhandled);
        }
        let bytes = frame.raw_bytes();
        let key_type = match bytes[0] {
            MF_CLASSIC_AUTH_KEY_A => KeyType::A,
            MF_CLASSIC_AUTH_KEY_B => KeyType::B,
            _ => return Ok(MfClassicAction::Unhandled),
        };
        let block = bytes[1];
        if usize::from(block) >= self.data.blocks_total() {
            return Ok(MfClassicAction::Abort(Some(ack_frame(MF_CLASSIC_NACK)?)));
        }
        let sector = sector_of(block);
        let Some(key) = self.data.key(sector, key_type) else {
            // Unknown key: the card cannot answer meaningfully.
            debug!(sector, %key_type, "No key for emulated authentication");
            return Ok(MfClassicAction::Abort(None));
        };

        let nt: u32 = rand::random();
        self.cipher.init(&key);
        self.cipher.word(nt ^ self.data.iso14443_3a.cuid(), false);
        self.state = MfClassicListenerState::NonceSent {
            nt,
            sector,
            key_type,
        };
        trace!(block, %key_type, nt = format_args!("{nt:08X}"), "Auth nonce sent");
        Ok(MfClassicAction::Respond(BitBuffer::from_bytes(&nt.to_be_bytes())))
    }

    fn process_reader_answer(
        &mut self,
        frame: &BitBuffer,
        nt: u32,
        sector: u8,
        key_type: KeyType,
    ) -> Result<MfClassicAction> {
        if frame.size_bits() != 64 {
            self.reset();
            return Ok(MfClassicAction::Abort(None));
        }
        let bytes = frame.raw_bytes();
        for &encrypted in &bytes[..4] {
            self.cipher.byte(encrypted, true);
        }
        let mut ar = [0u8; 4];
        for (plain, &encrypted) in ar.iter_mut().zip(&bytes[4..8]) {
            *plain = self.cipher.byte(0, false) ^ encrypted;
        }

        let expected = prng_successor(nt, 64).to_be_bytes();
        if !bool::from(ar[..].ct_eq(&expected[..])) {
            debug!(sector, %key_type, "Reader answer mismatch");
            self.reset();
            return Ok(MfClassicAction::Abort(None));
        }

        let at = prng_successor(nt, 96).to_be_bytes();
        let response = self.cipher.encrypt(&BitBuffer::from_bytes(&at))?;
        self.state = MfClassicListenerState::Authenticated { sector, key_type };
        debug!(sector, %key_type, "Reader authenticated");
        Ok(MfClassicAction::Respond(response))
    }

    fn process_command(
        &mut self,
        frame: &BitBuffer,
        sector: u8,
        key_type: KeyType,
    ) -> Result<MfClassicAction> {
        let Some(plain) = self.decrypt_command(frame, 4)? else {
            return Ok(MfClassicAction::Abort(None));
        };
        let bytes = plain.raw_bytes();
        let (command, block) = (bytes[0], bytes[1]);

        match command {
            MF_CLASSIC_READ if self.is_permitted(block, sector, key_type, false) => {
                let mut response = BitBuffer::from_bytes(&self.read_response(block));
                append_crc_a(&mut response)?;
                trace!(block, "Encrypted read");
                Ok(MfClassicAction::Respond(self.cipher.encrypt(&response)?))
            }
            MF_CLASSIC_WRITE if self.is_permitted(block, sector, key_type, true) => {
                self.state = MfClassicListenerState::WriteData {
                    sector,
                    key_type,
                    block,
                };
                self.ack(MF_CLASSIC_ACK)
            }
            _ if plain.starts_with_byte(ISO14443_3A_HALT[0]) && block == ISO14443_3A_HALT[1] => {
                self.reset();
                Ok(MfClassicAction::Halt)
            }
            _ => self.nack(),
        }
    }

    fn process_write_data(
        &mut self,
        frame: &BitBuffer,
        sector: u8,
        key_type: KeyType,
        block: u8,
    ) -> Result<MfClassicAction> {
        let Some(plain) = self.decrypt_command(frame, MF_CLASSIC_BLOCK_SIZE + 2)? else {
            return Ok(MfClassicAction::Abort(None));
        };
        let mut payload: Block = [0; MF_CLASSIC_BLOCK_SIZE];
        payload.copy_from_slice(&plain.raw_bytes()[..MF_CLASSIC_BLOCK_SIZE]);

        self.data.set_block_read(block, &payload)?;
        if is_trailer(block) {
            self.data
                .set_key_found(sector, KeyType::A, super::MfClassicKey::from_slice(&payload[..6])?)?;
            self.data
                .set_key_found(sector, KeyType::B, super::MfClassicKey::from_slice(&payload[10..])?)?;
        }
        debug!(block, "Block written");
        self.state = MfClassicListenerState::Authenticated { sector, key_type };
        self.ack(MF_CLASSIC_ACK)
    }

    /// Decrypt a command of `len` bytes and check its CRC. `None` means the
    /// frame was garbage and the authentication is dropped.
    fn decrypt_command(&mut self, frame: &BitBuffer, len: usize) -> Result<Option<BitBuffer>> {
        if frame.size_bits() != len * 8 {
            self.reset();
            return Ok(None);
        }
        let plain = self.cipher.decrypt(frame)?;
        if !check_crc_a(&plain) {
            self.reset();
            return Ok(None);
        }
        Ok(Some(plain))
    }

    fn is_permitted(&self, block: u8, sector: u8, key_type: KeyType, write: bool) -> bool {
        if usize::from(block) >= self.data.blocks_total() || sector_of(block) != sector {
            return false;
        }
        let access = self.access_conditions(sector);
        if write {
            block != 0 && access.can_write(block, key_type)
        } else {
            access.can_read(block, key_type)
        }
    }

    fn access_conditions(&self, sector: u8) -> AccessConditions {
        self.data
            .raw_block(trailer_of(sector))
            .and_then(|trailer| AccessConditions::parse(&trailer[6..10]).ok())
            .unwrap_or_default()
    }

    /// Block content as the card returns it: key A never readable, key B
    /// only when the access bits allow.
    fn read_response(&self, block: u8) -> Block {
        let mut data = self.data.raw_block(block).copied().unwrap_or_default();
        if is_trailer(block) {
            data[..6].fill(0);
            if !self.access_conditions(sector_of(block)).is_key_b_readable() {
                data[10..].fill(0);
            }
        }
        data
    }

    fn ack(&mut self, value: u8) -> Result<MfClassicAction> {
        let frame = self.cipher.encrypt(&ack_frame(value)?)?;
        Ok(MfClassicAction::Respond(frame))
    }

    fn nack(&mut self) -> Result<MfClassicAction> {
        let frame = self.cipher.encrypt(&ack_frame(MF_CLASSIC_NACK)?)?;
        self.reset();
        Ok(MfClassicAction::Abort(Some(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso14443_3a::Iso14443_3aData;
    use crate::mf_classic::{MfClassicKey, MfClassicType, auth_request, read_request};
    use tapkit_core::Uid;

    const KEY: MfClassicKey = MfClassicKey::DEFAULT;

    fn card() -> MfClassicListener {
        let base = Iso14443_3aData::new(Uid::new(&[0x11, 0x22, 0x33, 0x44]).unwrap(), [0x04, 0x00], 0x08);
        let mut data = MfClassicData::new(base, MfClassicType::Mini);
        for sector in 0..data.sectors_total() {
            let trailer = trailer_of(sector);
            let mut bytes = [0u8; 16];
            bytes[6..10].copy_from_slice(&crate::mf_classic::access::DEFAULT_ACCESS_BITS);
            data.set_block_read(trailer, &bytes).unwrap();
            data.set_key_found(sector, KeyType::A, KEY).unwrap();
            data.set_key_found(sector, KeyType::B, KEY).unwrap();
        }
        data.set_block_read(4, &[0x42; 16]).unwrap();
        MfClassicListener::new(data)
    }

    fn respond(action: MfClassicAction) -> BitBuffer {
        match action {
            MfClassicAction::Respond(frame) => frame,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    /// Reader side of the handshake; returns the reader cipher.
    fn authenticate(card: &mut MfClassicListener, block: u8, key: &MfClassicKey) -> (Crypto1, MfClassicAction) {
        let nt_frame = respond(card.process(&auth_request(block, KeyType::A).unwrap()).unwrap());
        let nt = u32::from_be_bytes(nt_frame.bytes().unwrap().try_into().unwrap());
        let mut reader = Crypto1::default();
        let answer = reader
            .encrypt_reader_nonce(key, 0x1122_3344, nt, [0xAA, 0xBB, 0xCC, 0xDD])
            .unwrap();
        let action = card.process(&answer).unwrap();
        if let MfClassicAction::Respond(at) = &action {
            let plain = reader.decrypt(at).unwrap();
            assert_eq!(plain.bytes().unwrap(), prng_successor(nt, 96).to_be_bytes());
        }
        (reader, action)
    }

    #[test]
    fn test_authenticate_and_read() {
        let mut card = card();
        let (mut reader, action) = authenticate(&mut card, 4, &KEY);
        assert!(matches!(action, MfClassicAction::Respond(_)));
        assert_eq!(
            card.state(),
            MfClassicListenerState::Authenticated {
                sector: 1,
                key_type: KeyType::A
            }
        );

        let request = reader.encrypt(&read_request(4).unwrap()).unwrap();
        let response = respond(card.process(&request).unwrap());
        let plain = reader.decrypt(&response).unwrap();
        assert!(check_crc_a(&plain));
        assert_eq!(&plain.bytes().unwrap()[..16], &[0x42; 16]);
    }

    #[test]
    fn test_wrong_key_is_silent() {
        let mut card = card();
        let wrong: MfClassicKey = "A0A1A2A3A4A5".parse().unwrap();
        let (_, action) = authenticate(&mut card, 4, &wrong);
        assert_eq!(action, MfClassicAction::Abort(None));
        assert_eq!(card.state(), MfClassicListenerState::Idle);
    }

    #[test]
    fn test_trailer_read_masks_key_a() {
        let mut card = card();
        let (mut reader, _) = authenticate(&mut card, 7, &KEY);
        let request = reader.encrypt(&read_request(7).unwrap()).unwrap();
        let plain = reader.decrypt(&respond(card.process(&request).unwrap())).unwrap();
        let bytes = plain.bytes().unwrap();
        assert_eq!(&bytes[..6], &[0; 6]);
        assert_eq!(&bytes[6..10], &crate::mf_classic::access::DEFAULT_ACCESS_BITS);
        assert_eq!(&bytes[10..16], KEY.as_bytes());
    }

    #[test]
    fn test_cross_sector_read_is_nacked() {
        let mut card = card();
        let (mut reader, _) = authenticate(&mut card, 4, &KEY);
        let request = reader.encrypt(&read_request(8).unwrap()).unwrap();
        let MfClassicAction::Abort(Some(nack)) = card.process(&request).unwrap() else {
            panic!("expected NACK");
        };
        let plain = reader.decrypt(&nack).unwrap();
        assert_eq!(plain.size_bits(), 4);
        assert_eq!(plain.raw_bytes()[0], MF_CLASSIC_NACK);
    }

    #[test]
    fn test_two_phase_write() {
        let mut card = card();
        let (mut reader, _) = authenticate(&mut card, 5, &KEY);

        let request = reader
            .encrypt(&crate::mf_classic::write_request(5).unwrap())
            .unwrap();
        let ack = reader.decrypt(&respond(card.process(&request).unwrap())).unwrap();
        assert_eq!(ack.raw_bytes()[0], MF_CLASSIC_ACK);

        let data = reader
            .encrypt(&crate::mf_classic::write_data_frame(&[0x99; 16]).unwrap())
            .unwrap();
        let ack = reader.decrypt(&respond(card.process(&data).unwrap())).unwrap();
        assert_eq!(ack.raw_bytes()[0], MF_CLASSIC_ACK);
        assert_eq!(card.data().block(5), Some(&[0x99; 16]));
    }

    #[test]
    fn test_encrypted_halt() {
        let mut card = card();
        let (mut reader, _) = authenticate(&mut card, 4, &KEY);
        let halt = reader
            .encrypt(&crate::iso14443_3a::halt_request().unwrap())
            .unwrap();
        assert_eq!(card.process(&halt).unwrap(), MfClassicAction::Halt);
        assert_eq!(card.state(), MfClassicListenerState::Idle);
    }

    #[test]
    fn test_non_auth_frames_are_unhandled() {
        let mut card = card();
        let mut rats = BitBuffer::from_bytes(&[0xE0, 0x80]);
        append_crc_a(&mut rats).unwrap();
        assert_eq!(card.process(&rats).unwrap(), MfClassicAction::Unhandled);
    }
}
