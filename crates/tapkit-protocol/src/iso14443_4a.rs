//! ISO14443-4A activation (RATS/ATS) and block framing.

use crate::crc::{append_crc_a, check_crc_a, trim_crc_a};
use crate::iso14443_3a::Iso14443_3aData;
use serde::{Deserialize, Serialize};
use tapkit_core::constants::*;
use tapkit_core::format::{FormatReader, FormatWriter};
use tapkit_core::{BitBuffer, Error, Result};

const T0_TA1_PRESENT: u8 = 0x10;
const T0_TB1_PRESENT: u8 = 0x20;
const T0_TC1_PRESENT: u8 = 0x40;

/// Frame sizes indexed by FSDI/FSCI.
const FRAME_SIZES: [usize; 9] = [16, 24, 32, 40, 48, 64, 96, 128, 256];

/// Maximum frame size for an FSDI/FSCI code; codes above 8 mean 256 bytes.
pub fn frame_size(code: u8) -> usize {
    FRAME_SIZES
        .get(usize::from(code))
        .copied()
        .unwrap_or(256)
}

/// Answer To Select.
///
/// The length byte (TL) and format byte (T0) are derived from the fields.
/// TL is one byte, so at most 250 historical bytes fit next to all three
/// interface bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtsData {
    /// Low nibble of T0: maximum frame size the card accepts.
    pub fsci: u8,
    pub ta_1: Option<u8>,
    pub tb_1: Option<u8>,
    pub tc_1: Option<u8>,
    pub historical: Vec<u8>,
}

impl AtsData {
    /// TL: length of the ATS including TL itself, excluding CRC.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` when the fields do not fit one TL byte.
    pub fn tl(&self) -> Result<u8> {
        let len = 2
            + usize::from(self.ta_1.is_some())
            + usize::from(self.tb_1.is_some())
            + usize::from(self.tc_1.is_some())
            + self.historical.len();
        u8::try_from(len)
            .map_err(|_| Error::invalid_data(format!("ATS of {len} bytes does not fit TL")))
    }

    pub fn t0(&self) -> u8 {
        let mut t0 = self.fsci & 0x0F;
        if self.ta_1.is_some() {
            t0 |= T0_TA1_PRESENT;
        }
        if self.tb_1.is_some() {
            t0 |= T0_TB1_PRESENT;
        }
        if self.tc_1.is_some() {
            t0 |= T0_TC1_PRESENT;
        }
        t0
    }

    /// Serialized ATS without CRC.
    ///
    /// # Errors
    /// See [`tl`](Self::tl).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![self.tl()?, self.t0()];
        bytes.extend(self.ta_1);
        bytes.extend(self.tb_1);
        bytes.extend(self.tc_1);
        bytes.extend_from_slice(&self.historical);
        Ok(bytes)
    }

    pub fn frame_size(&self) -> usize {
        frame_size(self.fsci)
    }

    /// Frame waiting integer from TB(1), 4 when absent.
    pub fn fwi(&self) -> u8 {
        self.tb_1.map_or(4, |tb| tb >> 4)
    }

    /// Frame waiting time in carrier cycles: `256 * 16 * 2^FWI`.
    pub fn fwt_fc(&self) -> u32 {
        (256 * 16) << u32::from(self.fwi().min(14))
    }

    pub fn supports_cid(&self) -> bool {
        self.tc_1.is_some_and(|tc| tc & 0x02 != 0)
    }

    pub fn supports_nad(&self) -> bool {
        self.tc_1.is_some_and(|tc| tc & 0x01 != 0)
    }
}

/// Parse an ATS with its CRC already removed.
///
/// Returns `Ok(None)` for an empty answer or one made of TL alone: the card
/// simply has no extended capabilities.
///
/// # Errors
/// Returns `Error::Communication` when TL disagrees with the received length
/// or T0 announces interface bytes that are missing.
///
/// # Examples
///
/// ```
/// use tapkit_core::BitBuffer;
/// use tapkit_protocol::iso14443_4a::ats_parse;
///
/// let ats = ats_parse(&BitBuffer::from_bytes(&[0x05, 0x78, 0x80, 0x70, 0x02]))
///     .unwrap()
///     .unwrap();
/// assert_eq!(ats.fsci, 8);
/// assert_eq!(ats.tb_1, Some(0x70));
///
/// assert!(ats_parse(&BitBuffer::from_bytes(&[0x01])).unwrap().is_none());
/// assert!(ats_parse(&BitBuffer::from_bytes(&[0x05, 0x78])).is_err());
/// ```
pub fn ats_parse(buffer: &BitBuffer) -> Result<Option<AtsData>> {
    let bytes = buffer
        .bytes()
        .map_err(|_| Error::communication("ATS is not byte aligned"))?;

    let Some(&tl) = bytes.first() else {
        return Ok(None);
    };
    if usize::from(tl) != bytes.len() {
        return Err(Error::communication(format!(
            "ATS length byte says {tl}, received {}",
            bytes.len()
        )));
    }
    if tl == 1 {
        return Ok(None);
    }

    let t0 = bytes[1];
    let mut index = 2;
    let mut interface_byte = |present: u8| -> Result<Option<u8>> {
        if t0 & present == 0 {
            return Ok(None);
        }
        let byte = *bytes
            .get(index)
            .ok_or_else(|| Error::communication("ATS truncated before interface bytes"))?;
        index += 1;
        Ok(Some(byte))
    };
    let ta_1 = interface_byte(T0_TA1_PRESENT)?;
    let tb_1 = interface_byte(T0_TB1_PRESENT)?;
    let tc_1 = interface_byte(T0_TC1_PRESENT)?;

    Ok(Some(AtsData {
        fsci: t0 & 0x0F,
        ta_1,
        tb_1,
        tc_1,
        historical: bytes[index..].to_vec(),
    }))
}

/// ATS presented when emulating a card: `05 78 80 70 02`.
pub fn ats_fill_default() -> AtsData {
    AtsData {
        fsci: 0x08,
        ta_1: Some(0x80),
        tb_1: Some(0x70),
        tc_1: Some(0x02),
        historical: Vec::new(),
    }
}

/// RATS frame with CRC.
///
/// # Errors
/// Returns `Error::InvalidData` for FSDI above 0x0F or CID above 14.
pub fn rats_request(fsdi: u8, cid: u8) -> Result<BitBuffer> {
    if fsdi > 0x0F || cid > 14 {
        return Err(Error::invalid_data(format!(
            "Invalid RATS parameters FSDI={fsdi} CID={cid}"
        )));
    }
    let mut frame = BitBuffer::from_bytes(&[ISO14443_4A_RATS, fsdi << 4 | cid]);
    append_crc_a(&mut frame)?;
    Ok(frame)
}

/// Whether `frame` is a RATS with valid CRC.
pub fn is_rats_request(frame: &BitBuffer) -> bool {
    frame.size_bits() == 32 && frame.starts_with_byte(ISO14443_4A_RATS) && check_crc_a(frame)
}

/// Identity of an ISO14443-4A card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso14443_4aData {
    pub iso14443_3a: Iso14443_3aData,
    pub ats: Option<AtsData>,
}

impl Iso14443_4aData {
    /// # Errors
    /// Returns `Error::InvalidData` for an ATS too long to encode.
    pub fn save(&self, writer: &mut impl FormatWriter) -> Result<()> {
        let ats = self.ats.as_ref().map(AtsData::to_bytes).transpose()?;
        self.iso14443_3a.save(writer);
        writer.write_comment("ISO14443-4A specific data");
        writer.write_hex("ATS", &ats.unwrap_or_default());
        Ok(())
    }

    /// # Errors
    /// Returns `Error::Format` or `Error::Communication` for malformed fields.
    pub fn load(reader: &mut impl FormatReader) -> Result<Self> {
        let iso14443_3a = Iso14443_3aData::load(reader)?;
        let raw = tapkit_core::parse_hex(&reader.read_string("ATS")?)?;
        let ats = ats_parse(&BitBuffer::from_bytes(&raw))?;
        Ok(Self { iso14443_3a, ats })
    }
}

/// ISO14443-4 half-duplex block state for the reader side.
#[derive(Debug, Clone, Default)]
pub struct BlockProtocol {
    block_number: u8,
}

impl BlockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// PCB of the next I-block.
    pub fn i_block_pcb(&self) -> u8 {
        ISO14443_4A_PCB_I_BLOCK | self.block_number
    }

    /// Frame `payload` as an I-block with CRC.
    pub fn encode_i_block(&self, payload: &[u8]) -> Result<BitBuffer> {
        let mut frame = BitBuffer::from_bytes(&[self.i_block_pcb()]);
        frame.append_bytes(payload)?;
        append_crc_a(&mut frame)?;
        Ok(frame)
    }

    /// Validate the card's answer to the last I-block and return its payload.
    ///
    /// # Errors
    /// Returns `Error::WrongCrc` for a corrupted frame and
    /// `Error::Communication` when the PCB does not match the block sent.
    pub fn decode_i_block(&mut self, rx: &BitBuffer) -> Result<Vec<u8>> {
        if !check_crc_a(rx) {
            return Err(Error::WrongCrc);
        }
        let expected = self.i_block_pcb();
        if !rx.starts_with_byte(expected) {
            return Err(Error::communication(format!(
                "Expected I-block PCB 0x{expected:02X}, got {rx}"
            )));
        }
        self.block_number ^= 1;

        let mut payload = rx.clone();
        trim_crc_a(&mut payload)?;
        Ok(payload.bytes()?[1..].to_vec())
    }

    pub fn reset(&mut self) {
        self.block_number = 0;
    }
}

/// Whether a PCB denotes an I-block.
pub fn is_i_block(pcb: u8) -> bool {
    pcb & 0xE2 == ISO14443_4A_PCB_I_BLOCK
}
