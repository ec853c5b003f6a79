//! ISO14443-3A framing: request, anticollision, select and halt.
//!
//! All functions here are pure. The poller crate sequences them against a
//! transceiver and [`listener`] plays the card side.
//!
//! # Activation
//!
//! ```text
//! PCD                                PICC
//!  REQA/WUPA (7 bits)        ──────►
//!                            ◄──────  ATQA (2 bytes)
//!  SEL CLn, NVB=0x20         ──────►
//!                            ◄──────  UID CLn + BCC (5 bytes)
//!  SEL CLn, NVB=0x70, UID, BCC, CRC ─►
//!                            ◄──────  SAK + CRC
//!  (repeat while SAK has the cascade bit)
//! ```

pub mod listener;

use crate::crc::{append_crc_a, bcc, check_crc_a};
use serde::{Deserialize, Serialize};
use tapkit_core::constants::*;
use tapkit_core::format::{FormatReader, FormatWriter};
use tapkit_core::{BitBuffer, Error, Result, Uid};

/// Identity of an activated ISO14443-3A card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso14443_3aData {
    pub uid: Uid,
    /// ATQA in reception order (`[0x04, 0x00]` for ATQA 0x0004).
    pub atqa: [u8; 2],
    pub sak: u8,
}

impl Iso14443_3aData {
    pub fn new(uid: Uid, atqa: [u8; 2], sak: u8) -> Self {
        Self { uid, atqa, sak }
    }

    pub fn cuid(&self) -> u32 {
        self.uid.cuid()
    }

    /// Whether the SAK announces ISO14443-4 support.
    pub fn supports_iso14443_4(&self) -> bool {
        self.sak & ISO14443_3A_SAK_ISO14443_4_BIT != 0
    }

    /// Write `UID`, `ATQA` and `SAK`. ATQA is written most significant byte
    /// first, as it is usually displayed.
    pub fn save(&self, writer: &mut impl FormatWriter) {
        writer.write_comment("UID, ATQA and SAK are common for all formats");
        writer.write_hex("UID", self.uid.as_bytes());
        writer.write_hex("ATQA", &[self.atqa[1], self.atqa[0]]);
        writer.write_hex("SAK", &[self.sak]);
    }

    /// Read the fields written by [`save`](Self::save).
    ///
    /// # Errors
    /// Returns `Error::Format` for missing or malformed fields and
    /// `Error::InvalidData` for an unsupported UID length.
    pub fn load(reader: &mut impl FormatReader) -> Result<Self> {
        let uid: Uid = reader.read_string("UID")?.parse()?;
        let atqa = reader.read_hex("ATQA", 2)?;
        let sak = reader.read_hex("SAK", 1)?;
        Ok(Self {
            uid,
            atqa: [atqa[1], atqa[0]],
            sak: sak[0],
        })
    }
}

/// Which short frame opens an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// REQA: only wakes cards in the Idle state.
    Reqa,
    /// WUPA: also wakes halted cards.
    #[default]
    Wupa,
}

impl RequestKind {
    pub fn command(&self) -> u8 {
        match self {
            Self::Reqa => ISO14443_3A_REQA,
            Self::Wupa => ISO14443_3A_WUPA,
        }
    }
}

/// Anticollision/select cascade level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeLevel {
    One,
    Two,
    Three,
}

impl CascadeLevel {
    pub const ALL: [CascadeLevel; 3] = [Self::One, Self::Two, Self::Three];

    pub fn sel_command(&self) -> u8 {
        match self {
            Self::One => ISO14443_3A_SEL_CL1,
            Self::Two => ISO14443_3A_SEL_CL2,
            Self::Three => ISO14443_3A_SEL_CL3,
        }
    }

    pub fn from_sel_command(command: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.sel_command() == command)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

/// Size in bits of one cascade level's UID part plus BCC.
pub const UID_CL_BITS: usize = 40;

/// REQA or WUPA short frame.
pub fn sens_request(kind: RequestKind) -> BitBuffer {
    BitBuffer::from_byte_bits(kind.command(), ISO14443_3A_SHORT_FRAME_BITS)
}

/// Anticollision request carrying the `known` UID bits of this level.
///
/// # Errors
/// Returns `Error::InvalidData` if more than 32 bits are known.
pub fn sdd_request(level: CascadeLevel, known: &BitBuffer) -> Result<BitBuffer> {
    let known_bits = known.size_bits();
    if known_bits > 32 {
        return Err(Error::invalid_data(format!(
            "Anticollision cannot carry {known_bits} known bits"
        )));
    }
    let total_bits = 16 + known_bits;
    let nvb = ((total_bits / 8) << 4 | total_bits % 8) as u8;

    let mut frame = BitBuffer::new();
    frame.append_bytes(&[level.sel_command(), nvb])?;
    frame.append_buffer(known)?;
    Ok(frame)
}

/// Number of UID bits an anticollision frame announces through its NVB.
///
/// # Errors
/// Returns `Error::Communication` for NVB values outside `0x20..=0x60`.
pub fn sdd_known_bits(nvb: u8) -> Result<usize> {
    let bytes = usize::from(nvb >> 4);
    let bits = usize::from(nvb & 0x0F);
    if !(2..=6).contains(&bytes) || bits > 7 || (bytes == 6 && bits != 0) {
        return Err(Error::communication(format!("Invalid NVB 0x{nvb:02X}")));
    }
    Ok((bytes - 2) * 8 + bits)
}

/// SELECT frame for a fully resolved UID part.
pub fn sel_request(level: CascadeLevel, uid_cl: &[u8; 4]) -> Result<BitBuffer> {
    let mut frame = BitBuffer::new();
    frame.append_bytes(&[level.sel_command(), ISO14443_3A_NVB_SELECT])?;
    frame.append_bytes(uid_cl)?;
    frame.append_byte(bcc(uid_cl))?;
    append_crc_a(&mut frame)?;
    Ok(frame)
}

/// HLTA frame.
pub fn halt_request() -> Result<BitBuffer> {
    let mut frame = BitBuffer::from_bytes(&ISO14443_3A_HALT);
    append_crc_a(&mut frame)?;
    Ok(frame)
}

/// Whether `frame` is a complete HLTA.
pub fn is_halt_request(frame: &BitBuffer) -> bool {
    check_crc_a(frame)
        && frame
            .bytes()
            .is_ok_and(|bytes| bytes.len() == 4 && bytes[..2] == ISO14443_3A_HALT)
}

/// Parse an ATQA answer.
///
/// # Errors
/// Returns `Error::Communication` unless the answer is exactly 16 bits.
pub fn parse_atqa(rx: &BitBuffer) -> Result<[u8; 2]> {
    if rx.size_bits() != 16 {
        return Err(Error::communication(format!(
            "ATQA must be 16 bits, got {}",
            rx.size_bits()
        )));
    }
    Ok([rx.byte(0)?, rx.byte(1)?])
}

/// Validate a resolved UID part (4 bytes + BCC).
///
/// # Errors
/// Returns `Error::Communication` on a wrong length and
/// `Error::ColResFailed` when the BCC does not match.
pub fn parse_sdd_response(uid_cl: &BitBuffer) -> Result<[u8; 4]> {
    if uid_cl.size_bits() != UID_CL_BITS {
        return Err(Error::communication(format!(
            "UID part must be {UID_CL_BITS} bits, got {}",
            uid_cl.size_bits()
        )));
    }
    let bytes = uid_cl.bytes()?;
    let part = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if bcc(&part) != bytes[4] {
        return Err(Error::col_res(format!(
            "BCC mismatch: computed 0x{:02X}, received 0x{:02X}",
            bcc(&part),
            bytes[4]
        )));
    }
    Ok(part)
}

/// Parse a SAK answer.
///
/// # Errors
/// Returns `Error::Communication` unless the answer is 3 bytes and
/// `Error::WrongCrc` when its CRC is invalid.
pub fn parse_sak(rx: &BitBuffer) -> Result<u8> {
    if rx.size_bits() != 24 {
        return Err(Error::communication(format!(
            "SAK must be 24 bits with CRC, got {}",
            rx.size_bits()
        )));
    }
    if !check_crc_a(rx) {
        return Err(Error::WrongCrc);
    }
    rx.byte(0)
}

/// Frames received for one cascade level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeFrames {
    /// Resolved UID part with BCC (40 bits).
    pub uid_cl: BitBuffer,
    /// SAK with CRC (24 bits).
    pub sak: BitBuffer,
}

/// Every frame a card sent during one activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationFrames {
    pub atqa: BitBuffer,
    pub levels: Vec<CascadeFrames>,
}

/// Build card identity from the frames of a complete activation.
///
/// Validates the whole cascade chain before returning anything: the UID is
/// never partially populated.
///
/// # Errors
/// Returns `Error::Communication` for malformed frames or a broken cascade
/// chain, `Error::ColResFailed` for a BCC mismatch and `Error::WrongCrc` for
/// a corrupted SAK.
///
/// # Examples
///
/// ```
/// use tapkit_core::BitBuffer;
/// use tapkit_protocol::crc::append_crc_a;
/// use tapkit_protocol::iso14443_3a::{ActivationFrames, CascadeFrames, activate_parse};
///
/// let mut sak = BitBuffer::from_bytes(&[0x08]);
/// append_crc_a(&mut sak).unwrap();
/// let frames = ActivationFrames {
///     atqa: BitBuffer::from_bytes(&[0x04, 0x00]),
///     levels: vec![CascadeFrames {
///         uid_cl: BitBuffer::from_bytes(&[0x01, 0x02, 0x03, 0x04, 0x04]),
///         sak,
///     }],
/// };
///
/// let data = activate_parse(&frames).unwrap();
/// assert_eq!(data.uid.as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
/// assert_eq!(data.sak, 0x08);
/// ```
pub fn activate_parse(frames: &ActivationFrames) -> Result<Iso14443_3aData> {
    let atqa = parse_atqa(&frames.atqa)?;
    let level_count = frames.levels.len();
    if !(1..=CascadeLevel::ALL.len()).contains(&level_count) {
        return Err(Error::communication(format!(
            "Activation needs 1 to 3 cascade levels, got {level_count}"
        )));
    }

    let mut uid = Vec::with_capacity(Uid::TRIPLE);
    let mut final_sak = 0;
    for (index, level) in frames.levels.iter().enumerate() {
        let part = parse_sdd_response(&level.uid_cl)?;
        let sak = parse_sak(&level.sak)?;
        let cascades = sak & ISO14443_3A_SAK_CASCADE_BIT != 0;

        if index + 1 < level_count {
            if !cascades || part[0] != ISO14443_3A_CASCADE_TAG {
                return Err(Error::communication(format!(
                    "Cascade level {} does not announce a further level",
                    index + 1
                )));
            }
            uid.extend_from_slice(&part[1..]);
        } else {
            if cascades {
                return Err(Error::communication(
                    "Final SAK still has the cascade bit set",
                ));
            }
            uid.extend_from_slice(&part);
            final_sak = sak;
        }
    }

    Ok(Iso14443_3aData {
        uid: Uid::new(&uid)?,
        atqa,
        sak: final_sak,
    })
}

/// UID part (without BCC) a card sends at `level`, if it has that level.
pub fn uid_part(uid: &Uid, level: CascadeLevel) -> Option<[u8; 4]> {
    let bytes = uid.as_bytes();
    let levels = uid.cascade_levels();
    let index = level.index();
    if index >= levels {
        return None;
    }
    let part = if index + 1 == levels {
        let start = bytes.len() - 4;
        [bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]
    } else {
        let start = index * 3;
        [
            ISO14443_3A_CASCADE_TAG,
            bytes[start],
            bytes[start + 1],
            bytes[start + 2],
        ]
    };
    Some(part)
}
