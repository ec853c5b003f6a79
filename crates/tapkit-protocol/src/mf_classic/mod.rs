//! Mifare Classic card model.
//!
//! Memory is split into sectors protected by two 6-byte keys stored in the
//! sector trailer (last block of each sector):
//!
//! ```text
//! | Key A (6) | Access bits (3) + GPB (1) | Key B (6) |
//! ```
//!
//! Mini and 1K cards have 4-block sectors. 4K cards have 32 sectors of 4
//! blocks followed by 8 sectors of 16 blocks.

pub mod access;
pub mod crypto1;
pub mod dictionary;
pub mod listener;

use crate::crc::append_crc_a;
use crate::iso14443_3a::Iso14443_3aData;
use serde::{Deserialize, Serialize};
use std::fmt;
use tapkit_core::constants::*;
use tapkit_core::format::{FormatReader, FormatWriter};
use tapkit_core::{BitBuffer, Error, Result};

/// Block payload.
pub type Block = [u8; MF_CLASSIC_BLOCK_SIZE];

const DATA_FORMAT_VERSION: u32 = 2;
const TRAILER_KEY_A_MASK: u16 = 0x003F;
const TRAILER_ACCESS_MASK: u16 = 0x03C0;
const TRAILER_KEY_B_MASK: u16 = 0xFC00;

/// Card capacity variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MfClassicType {
    Mini,
    Classic1k,
    Classic4k,
}

impl MfClassicType {
    pub fn sectors_total(&self) -> u8 {
        match self {
            Self::Mini => 5,
            Self::Classic1k => 16,
            Self::Classic4k => 40,
        }
    }

    pub fn blocks_total(&self) -> u16 {
        match self {
            Self::Mini => 20,
            Self::Classic1k => 64,
            Self::Classic4k => 256,
        }
    }

    /// Name used in device files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mini => "MINI",
            Self::Classic1k => "1K",
            Self::Classic4k => "4K",
        }
    }

    /// Detect the variant from activation data.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_protocol::mf_classic::MfClassicType;
    ///
    /// assert_eq!(MfClassicType::detect([0x04, 0x00], 0x08), Some(MfClassicType::Classic1k));
    /// assert_eq!(MfClassicType::detect([0x02, 0x00], 0x18), Some(MfClassicType::Classic4k));
    /// assert_eq!(MfClassicType::detect([0x44, 0x00], 0x00), None);
    /// ```
    pub fn detect(atqa: [u8; 2], sak: u8) -> Option<Self> {
        match (atqa, sak) {
            ([0x04 | 0x44, _], 0x08 | 0x88) => Some(Self::Classic1k),
            ([0x04 | 0x44, _], 0x09) => Some(Self::Mini),
            ([0x01, 0x0F], 0x01) => Some(Self::Classic1k),
            ([0x02 | 0x42, _], 0x18) => Some(Self::Classic4k),
            _ => None,
        }
    }
}

impl fmt::Display for MfClassicType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for MfClassicType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "MINI" => Ok(Self::Mini),
            "1K" => Ok(Self::Classic1k),
            "4K" => Ok(Self::Classic4k),
            other => Err(Error::format(format!("Unknown Mifare Classic type: {other}"))),
        }
    }
}

/// Sector holding `block`.
pub fn sector_of(block: u8) -> u8 {
    if block < 128 {
        block / 4
    } else {
        32 + (block - 128) / 16
    }
}

/// First block of `sector`.
pub fn first_block(sector: u8) -> u8 {
    if sector < 32 {
        sector * 4
    } else {
        128 + (sector - 32) * 16
    }
}

pub fn blocks_in_sector(sector: u8) -> u8 {
    if sector < 32 { 4 } else { 16 }
}

pub fn trailer_of(sector: u8) -> u8 {
    first_block(sector) + blocks_in_sector(sector) - 1
}

pub fn is_trailer(block: u8) -> bool {
    block == trailer_of(sector_of(block))
}

/// Which of the two sector keys is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    pub fn auth_command(&self) -> u8 {
        match self {
            Self::A => MF_CLASSIC_AUTH_KEY_A,
            Self::B => MF_CLASSIC_AUTH_KEY_B,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// 48-bit sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MfClassicKey([u8; MF_CLASSIC_KEY_SIZE]);

impl MfClassicKey {
    /// Transport configuration key.
    pub const DEFAULT: MfClassicKey = MfClassicKey([0xFF; MF_CLASSIC_KEY_SIZE]);

    pub const fn new(bytes: [u8; MF_CLASSIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from the first six bytes of `bytes`.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` if fewer than six bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; MF_CLASSIC_KEY_SIZE] = bytes
            .get(..MF_CLASSIC_KEY_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| Error::invalid_data("Key must be 6 bytes"))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; MF_CLASSIC_KEY_SIZE] {
        &self.0
    }

    /// Key as a big-endian 48-bit number.
    pub fn to_u64(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, &byte| acc << 8 | u64::from(byte))
    }
}

impl fmt::Display for MfClassicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for MfClassicKey {
    type Err = Error;

    /// Parse 12 hex digits, spaces allowed.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = tapkit_core::parse_hex(s)?;
        if bytes.len() != MF_CLASSIC_KEY_SIZE {
            return Err(Error::format(format!("Key must be 12 hex digits: {s}")));
        }
        Self::from_slice(&bytes)
    }
}

/// Full or partial dump of a Mifare Classic card.
///
/// Blocks that were never read are zero-filled and flagged unread. Keys are
/// recorded per sector once an authentication with them succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfClassicData {
    pub iso14443_3a: Iso14443_3aData,
    pub card_type: MfClassicType,
    blocks: Vec<Block>,
    block_read: Vec<bool>,
    key_a: Vec<Option<MfClassicKey>>,
    key_b: Vec<Option<MfClassicKey>>,
}

impl MfClassicData {
    /// Empty dump for a freshly detected card.
    pub fn new(iso14443_3a: Iso14443_3aData, card_type: MfClassicType) -> Self {
        let blocks = usize::from(card_type.blocks_total());
        let sectors = usize::from(card_type.sectors_total());
        Self {
            iso14443_3a,
            card_type,
            blocks: vec![[0; MF_CLASSIC_BLOCK_SIZE]; blocks],
            block_read: vec![false; blocks],
            key_a: vec![None; sectors],
            key_b: vec![None; sectors],
        }
    }

    pub fn blocks_total(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_read(&self) -> usize {
        self.block_read.iter().filter(|read| **read).count()
    }

    pub fn is_fully_read(&self) -> bool {
        self.blocks_read() == self.blocks_total()
    }

    pub fn is_block_read(&self, block: u8) -> bool {
        self.block_read
            .get(usize::from(block))
            .copied()
            .unwrap_or(false)
    }

    /// Content of a block that has been read.
    pub fn block(&self, block: u8) -> Option<&Block> {
        if self.is_block_read(block) {
            self.blocks.get(usize::from(block))
        } else {
            None
        }
    }

    /// Store a block's content and mark it read.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` for blocks past the card size.
    pub fn set_block_read(&mut self, block: u8, data: &Block) -> Result<()> {
        let index = self.check_block(block)?;
        self.blocks[index] = *data;
        self.block_read[index] = true;
        Ok(())
    }

    /// Forget a block's content.
    pub fn clear_block(&mut self, block: u8) -> Result<()> {
        let index = self.check_block(block)?;
        self.blocks[index] = [0; MF_CLASSIC_BLOCK_SIZE];
        self.block_read[index] = false;
        Ok(())
    }

    pub fn key(&self, sector: u8, key_type: KeyType) -> Option<MfClassicKey> {
        let keys = match key_type {
            KeyType::A => &self.key_a,
            KeyType::B => &self.key_b,
        };
        keys.get(usize::from(sector)).copied().flatten()
    }

    /// Record a working key and mirror it into the trailer bytes.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` for sectors past the card size.
    pub fn set_key_found(&mut self, sector: u8, key_type: KeyType, key: MfClassicKey) -> Result<()> {
        let index = usize::from(sector);
        if index >= self.key_a.len() {
            return Err(Error::OutOfBounds {
                index,
                len: self.key_a.len(),
            });
        }
        let trailer = usize::from(trailer_of(sector));
        let range = match key_type {
            KeyType::A => {
                self.key_a[index] = Some(key);
                0..MF_CLASSIC_KEY_SIZE
            }
            KeyType::B => {
                self.key_b[index] = Some(key);
                10..MF_CLASSIC_BLOCK_SIZE
            }
        };
        self.blocks[trailer][range].copy_from_slice(key.as_bytes());
        Ok(())
    }

    pub fn sectors_total(&self) -> u8 {
        self.card_type.sectors_total()
    }

    /// Whether at least one key of `sector` is known.
    pub fn is_sector_unlocked(&self, sector: u8) -> bool {
        self.key(sector, KeyType::A).is_some() || self.key(sector, KeyType::B).is_some()
    }

    pub fn is_sector_read(&self, sector: u8) -> bool {
        let first = first_block(sector);
        (first..first + blocks_in_sector(sector)).all(|block| self.is_block_read(block))
    }

    pub fn sectors_read(&self) -> usize {
        (0..self.sectors_total())
            .filter(|sector| self.is_sector_read(*sector))
            .count()
    }

    pub fn keys_found(&self) -> usize {
        self.key_a.iter().chain(&self.key_b).flatten().count()
    }

    /// Raw block content regardless of its read flag.
    pub fn raw_block(&self, block: u8) -> Option<&Block> {
        self.blocks.get(usize::from(block))
    }

    fn check_block(&self, block: u8) -> Result<usize> {
        let index = usize::from(block);
        if index >= self.blocks.len() {
            return Err(Error::OutOfBounds {
                index,
                len: self.blocks.len(),
            });
        }
        Ok(index)
    }

    /// Bit mask of the known bytes of `block` (bit `n` for byte `n`).
    fn known_mask(&self, block: u8) -> u16 {
        if !is_trailer(block) {
            return if self.is_block_read(block) { 0xFFFF } else { 0 };
        }
        let sector = sector_of(block);
        let mut mask = 0;
        if self.key(sector, KeyType::A).is_some() {
            mask |= TRAILER_KEY_A_MASK;
        }
        if self.is_block_read(block) {
            mask |= TRAILER_ACCESS_MASK;
        }
        if self.key(sector, KeyType::B).is_some() {
            mask |= TRAILER_KEY_B_MASK;
        }
        mask
    }

    /// Write the Mifare Classic fields. Unknown bytes are written as `??`.
    pub fn save(&self, writer: &mut impl FormatWriter) {
        self.iso14443_3a.save(writer);
        writer.write_comment("Mifare Classic specific data");
        writer.write_string("Mifare Classic type", self.card_type.name());
        writer.write_u32("Data format version", DATA_FORMAT_VERSION);
        writer.write_comment("Mifare Classic blocks, '??' means unknown data");

        for (index, data) in self.blocks.iter().enumerate() {
            // Block indices never exceed 255.
            let block = index as u8;
            let mask = self.known_mask(block);
            let text = data
                .iter()
                .enumerate()
                .map(|(byte_index, byte)| {
                    if mask & (1 << byte_index) != 0 {
                        format!("{byte:02X}")
                    } else {
                        "??".to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            writer.write_string(&format!("Block {block}"), &text);
        }
    }

    /// Read the fields written by [`save`](Self::save).
    ///
    /// Missing block lines leave the block unread. A data block with any
    /// unknown byte stays unread; trailer keys and access bits are restored
    /// independently.
    ///
    /// # Errors
    /// Returns `Error::Format` for malformed fields.
    pub fn load(reader: &mut impl FormatReader) -> Result<Self> {
        let iso14443_3a = Iso14443_3aData::load(reader)?;
        let card_type: MfClassicType = reader.read_string("Mifare Classic type")?.parse()?;
        let version = reader.read_u32("Data format version")?;
        if version != DATA_FORMAT_VERSION {
            return Err(Error::format(format!(
                "Unsupported data format version {version}"
            )));
        }

        let mut data = Self::new(iso14443_3a, card_type);
        for block in 0..card_type.blocks_total() {
            // Block indices never exceed 255.
            let block = block as u8;
            let key = format!("Block {block}");
            if !reader.key_exists(&key) {
                continue;
            }
            let (bytes, mask) = parse_block_line(&reader.read_string(&key)?)?;
            data.restore_block(block, &bytes, mask)?;
        }
        Ok(data)
    }

    fn restore_block(&mut self, block: u8, bytes: &Block, mask: u16) -> Result<()> {
        if !is_trailer(block) {
            if mask == 0xFFFF {
                self.set_block_read(block, bytes)?;
            }
            return Ok(());
        }

        let sector = sector_of(block);
        if mask & TRAILER_ACCESS_MASK == TRAILER_ACCESS_MASK {
            self.set_block_read(block, bytes)?;
        }
        if mask & TRAILER_KEY_A_MASK == TRAILER_KEY_A_MASK {
            self.set_key_found(sector, KeyType::A, MfClassicKey::from_slice(&bytes[..6])?)?;
        }
        if mask & TRAILER_KEY_B_MASK == TRAILER_KEY_B_MASK {
            self.set_key_found(sector, KeyType::B, MfClassicKey::from_slice(&bytes[10..])?)?;
        }
        Ok(())
    }
}

/// Parse `"01 02 ?? ..."` into bytes and a known-byte mask.
fn parse_block_line(text: &str) -> Result<(Block, u16)> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != MF_CLASSIC_BLOCK_SIZE {
        return Err(Error::format(format!(
            "Block must have 16 bytes, got {}",
            tokens.len()
        )));
    }
    let mut bytes = [0; MF_CLASSIC_BLOCK_SIZE];
    let mut mask = 0u16;
    for (index, token) in tokens.iter().enumerate() {
        if *token == "??" {
            continue;
        }
        bytes[index] = u8::from_str_radix(token, 16)
            .map_err(|_| Error::format(format!("Invalid block byte '{token}'")))?;
        mask |= 1 << index;
    }
    Ok((bytes, mask))
}

/// Plain AUTH frame with CRC.
pub fn auth_request(block: u8, key_type: KeyType) -> Result<BitBuffer> {
    command_frame(&[key_type.auth_command(), block])
}

/// Plain READ frame with CRC.
pub fn read_request(block: u8) -> Result<BitBuffer> {
    command_frame(&[MF_CLASSIC_READ, block])
}

/// Plain WRITE frame (first phase) with CRC.
pub fn write_request(block: u8) -> Result<BitBuffer> {
    command_frame(&[MF_CLASSIC_WRITE, block])
}

/// Plain WRITE data frame (second phase) with CRC.
pub fn write_data_frame(data: &Block) -> Result<BitBuffer> {
    command_frame(data)
}

/// 4-bit ACK/NACK answer.
pub fn ack_frame(value: u8) -> Result<BitBuffer> {
    let mut frame = BitBuffer::new();
    frame.append_bits(value, 4)?;
    Ok(frame)
}

fn command_frame(bytes: &[u8]) -> Result<BitBuffer> {
    let mut frame = BitBuffer::from_bytes(bytes);
    append_crc_a(&mut frame)?;
    Ok(frame)
}
