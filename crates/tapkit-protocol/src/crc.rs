//! CRC_A and block check character helpers.
//!
//! CRC_A is CRC-16/ISO-IEC-14443-3-A (polynomial 0x1021, reflected, preset
//! 0x6363), transmitted least significant byte first.

use crc::{CRC_16_ISO_IEC_14443_3_A, Crc};
use tapkit_core::{BitBuffer, Result};

const CRC_A: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);

/// Number of bytes CRC_A adds to a frame.
pub const CRC_A_SIZE: usize = 2;

/// Compute CRC_A over `data`.
///
/// # Examples
///
/// ```
/// use tapkit_protocol::crc::crc_a;
///
/// assert_eq!(crc_a(b"123456789"), 0xBF05);
/// assert_eq!(crc_a(&[0x50, 0x00]).to_le_bytes(), [0x57, 0xCD]);
/// ```
pub fn crc_a(data: &[u8]) -> u16 {
    CRC_A.checksum(data)
}

/// Append CRC_A (LSB first, odd parity) to a byte-aligned frame.
///
/// # Errors
/// Returns `Error::NotByteAligned` for partial frames and
/// `Error::CapacityExceeded` when the buffer is full.
pub fn append_crc_a(buffer: &mut BitBuffer) -> Result<()> {
    let crc = crc_a(buffer.bytes()?);
    buffer.append_bytes(&crc.to_le_bytes())
}

/// Whether a frame ends with a valid CRC_A over at least one payload byte.
pub fn check_crc_a(buffer: &BitBuffer) -> bool {
    let Ok(bytes) = buffer.bytes() else {
        return false;
    };
    if bytes.len() <= CRC_A_SIZE {
        return false;
    }
    let (payload, crc) = bytes.split_at(bytes.len() - CRC_A_SIZE);
    crc_a(payload).to_le_bytes() == crc
}

/// Remove the trailing CRC_A bytes.
///
/// # Errors
/// Returns `Error::NotByteAligned` or `Error::OutOfBounds` for frames that
/// cannot carry a CRC.
pub fn trim_crc_a(buffer: &mut BitBuffer) -> Result<()> {
    buffer.trim_end_bytes(CRC_A_SIZE)
}

/// Block check character: XOR of the UID bytes of one cascade level.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0x50, 0x00], [0x57, 0xCD])]
    #[case(&[0xE0, 0x80], [0x31, 0x73])]
    #[case(&[0x30, 0x00], [0x02, 0xA8])]
    #[case(&[0x60, 0x00], [0xF5, 0x7B])]
    fn test_known_frames(#[case] payload: &[u8], #[case] expected: [u8; 2]) {
        assert_eq!(crc_a(payload).to_le_bytes(), expected);
    }

    #[test]
    fn test_append_and_check() {
        let mut frame = BitBuffer::from_bytes(&[0x93, 0x70, 0x01, 0x02, 0x03, 0x04, 0x04]);
        append_crc_a(&mut frame).unwrap();
        assert_eq!(frame.size_bytes(), 9);
        assert!(check_crc_a(&frame));

        trim_crc_a(&mut frame).unwrap();
        assert_eq!(frame.size_bytes(), 7);
    }

    #[test]
    fn test_check_rejects_corruption() {
        let mut frame = BitBuffer::from_bytes(&[0x08]);
        append_crc_a(&mut frame).unwrap();
        frame.set_byte(2, frame.byte(2).unwrap() ^ 0x01).unwrap();
        assert!(!check_crc_a(&frame));
    }

    #[test]
    fn test_check_rejects_short_and_partial_frames() {
        assert!(!check_crc_a(&BitBuffer::from_bytes(&[0x63, 0x63])));
        assert!(!check_crc_a(&BitBuffer::from_bits(&[0x26], 7).unwrap()));
    }

    #[test]
    fn test_append_requires_alignment() {
        let mut frame = BitBuffer::from_bits(&[0x26], 7).unwrap();
        assert!(append_crc_a(&mut frame).is_err());
    }

    #[test]
    fn test_bcc() {
        assert_eq!(bcc(&[0x88, 0x04, 0x01, 0x23]), 0x88 ^ 0x04 ^ 0x01 ^ 0x23);
        assert_eq!(bcc(&[0x01, 0x02, 0x03, 0x04]), 0x04);
    }
}
