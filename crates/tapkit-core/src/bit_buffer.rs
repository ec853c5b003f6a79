//! Bit-oriented frame buffer with per-byte parity.
//!
//! ISO14443-3A transmits every byte as 8 data bits (LSB first) followed by an
//! odd parity bit, and some frames (REQA, WUPA, anticollision requests) are
//! not a whole number of bytes long. [`BitBuffer`] keeps the exact bit length
//! and one parity bit per byte so that codecs never have to do index
//! arithmetic themselves.
//!
//! Bit `n` of the buffer is bit `n % 8` (LSB first) of byte `n / 8`.
//!
//! # Examples
//!
//! ```
//! use tapkit_core::bit_buffer::{BitBuffer, odd_parity};
//!
//! // A 7-bit REQA short frame.
//! let mut reqa = BitBuffer::new();
//! reqa.append_bits(0x26, 7).unwrap();
//! assert_eq!(reqa.size_bits(), 7);
//! assert!(reqa.bytes().is_err());
//!
//! // Whole bytes carry odd parity.
//! let mut frame = BitBuffer::new();
//! frame.append_bytes(&[0x50, 0x00]).unwrap();
//! assert_eq!(frame.parity(0).unwrap(), odd_parity(0x50));
//! assert!(frame.has_valid_parity());
//! ```

use crate::{Result, error::Error, types::format_hex};
use std::fmt;

/// Odd parity bit for `byte`: set when the byte has an even number of ones.
#[must_use]
pub fn odd_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Owned, resizable bit sequence with an explicit bit length.
///
/// Invariants:
/// - `size_bits <= max_bits` when a maximum is configured
/// - one data byte and one parity bit per started byte
/// - bits past `size_bits` in the last byte are zero
#[derive(Debug, Clone, Default)]
pub struct BitBuffer {
    data: Vec<u8>,
    parity: Vec<bool>,
    size_bits: usize,
    max_bits: Option<usize>,
}

impl BitBuffer {
    /// Create an empty buffer that grows without limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer holding at most `max_bytes` bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_core::bit_buffer::BitBuffer;
    ///
    /// let mut buffer = BitBuffer::with_max_bytes(2);
    /// buffer.append_bytes(&[0x01, 0x02]).unwrap();
    /// assert!(buffer.append_bit(true).is_err());
    /// ```
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_bytes),
            parity: Vec::with_capacity(max_bytes),
            size_bits: 0,
            max_bits: Some(max_bytes * 8),
        }
    }

    /// Create an unbounded buffer holding `bytes` with odd parity.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::new();
        for &byte in bytes {
            buffer.push_aligned(byte, odd_parity(byte));
        }
        buffer
    }

    /// Create an unbounded buffer from the low `size_bits` bits of `byte`,
    /// at most 8.
    pub fn from_byte_bits(byte: u8, size_bits: usize) -> Self {
        let mut buffer = Self::new();
        for index in 0..size_bits.min(8) {
            buffer.push_bit(byte >> index & 1 == 1);
        }
        buffer
    }

    /// Create an unbounded buffer from the first `size_bits` bits of `bytes`.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` if `bytes` holds fewer than `size_bits` bits.
    pub fn from_bits(bytes: &[u8], size_bits: usize) -> Result<Self> {
        if size_bits > bytes.len() * 8 {
            return Err(Error::OutOfBounds {
                index: size_bits,
                len: bytes.len() * 8,
            });
        }
        let mut buffer = Self::new();
        for index in 0..size_bits {
            buffer.push_bit(bytes[index / 8] >> (index % 8) & 1 == 1);
        }
        Ok(buffer)
    }

    /// Drop all content, keeping allocation and the configured maximum.
    pub fn reset(&mut self) {
        self.data.clear();
        self.parity.clear();
        self.size_bits = 0;
    }

    #[must_use]
    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    /// Number of started bytes (a trailing partial byte counts).
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bits == 0
    }

    #[must_use]
    pub fn is_byte_aligned(&self) -> bool {
        self.size_bits % 8 == 0
    }

    #[must_use]
    pub fn max_bits(&self) -> Option<usize> {
        self.max_bits
    }

    /// Append one bit.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when the buffer is full.
    pub fn append_bit(&mut self, bit: bool) -> Result<()> {
        self.ensure_capacity(1)?;
        self.push_bit(bit);
        Ok(())
    }

    /// Append the `count` low bits of `value`, LSB first.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` if `count > 8`, or
    /// `Error::CapacityExceeded` when the bits do not fit.
    pub fn append_bits(&mut self, value: u8, count: usize) -> Result<()> {
        if count > 8 {
            return Err(Error::invalid_data(format!(
                "Cannot append {count} bits from a byte"
            )));
        }
        self.ensure_capacity(count)?;
        for index in 0..count {
            self.push_bit(value >> index & 1 == 1);
        }
        Ok(())
    }

    /// Append a byte with odd parity.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when the byte does not fit.
    pub fn append_byte(&mut self, byte: u8) -> Result<()> {
        self.append_byte_with_parity(byte, odd_parity(byte))
    }

    /// Append a byte with an explicit parity bit.
    ///
    /// On an unaligned buffer the byte straddles two storage bytes; parity is
    /// then recomputed per storage byte and `parity` is ignored.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when the byte does not fit.
    pub fn append_byte_with_parity(&mut self, byte: u8, parity: bool) -> Result<()> {
        self.ensure_capacity(8)?;
        if self.is_byte_aligned() {
            self.push_aligned(byte, parity);
        } else {
            for index in 0..8 {
                self.push_bit(byte >> index & 1 == 1);
            }
        }
        Ok(())
    }

    /// Append bytes with odd parity. Nothing is appended if they do not fit.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when the bytes do not fit.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_capacity(bytes.len() * 8)?;
        for &byte in bytes {
            self.append_byte(byte)?;
        }
        Ok(())
    }

    /// Append every bit of `other`, keeping its parity bits when aligned.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when `other` does not fit.
    pub fn append_buffer(&mut self, other: &BitBuffer) -> Result<()> {
        self.ensure_capacity(other.size_bits)?;
        if self.is_byte_aligned() {
            self.data.extend_from_slice(&other.data);
            self.parity.extend_from_slice(&other.parity);
            self.size_bits += other.size_bits;
        } else {
            for index in 0..other.size_bits {
                self.push_bit(other.data[index / 8] >> (index % 8) & 1 == 1);
            }
        }
        Ok(())
    }

    /// Replace the content with `bytes`.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when `bytes` do not fit; the buffer
    /// is left untouched in that case.
    pub fn copy_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_total(bytes.len() * 8)?;
        self.reset();
        self.append_bytes(bytes)
    }

    /// Replace the content with a copy of `other`, parity included.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` when `other` does not fit.
    pub fn copy_from(&mut self, other: &BitBuffer) -> Result<()> {
        self.check_total(other.size_bits)?;
        self.reset();
        self.append_buffer(other)
    }

    /// Truncate or zero-extend the buffer to exactly `size_bits` bits.
    ///
    /// # Errors
    /// Returns `Error::CapacityExceeded` above the configured maximum.
    pub fn set_size_bits(&mut self, size_bits: usize) -> Result<()> {
        self.check_total(size_bits)?;
        if size_bits >= self.size_bits {
            while self.size_bits < size_bits {
                self.push_bit(false);
            }
            return Ok(());
        }

        let bytes = size_bits.div_ceil(8);
        self.data.truncate(bytes);
        self.parity.truncate(bytes);
        let tail = size_bits % 8;
        if tail != 0
            && let Some(last) = self.data.last_mut()
        {
            *last &= (1u8 << tail) - 1;
        }
        self.size_bits = size_bits;
        Ok(())
    }

    /// Drop `count` whole bytes from the end of an aligned buffer.
    ///
    /// # Errors
    /// Returns `Error::NotByteAligned` or `Error::OutOfBounds`.
    pub fn trim_end_bytes(&mut self, count: usize) -> Result<()> {
        self.require_aligned()?;
        let remaining = self
            .size_bytes()
            .checked_sub(count)
            .ok_or(Error::OutOfBounds {
                index: count,
                len: self.size_bytes(),
            })?;
        self.set_size_bits(remaining * 8)
    }

    /// Read the complete byte at `index`.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` past the end and `Error::NotByteAligned`
    /// for a trailing partial byte.
    pub fn byte(&self, index: usize) -> Result<u8> {
        self.check_complete_byte(index)?;
        Ok(self.data[index])
    }

    /// All bytes of an aligned buffer.
    ///
    /// # Errors
    /// Returns `Error::NotByteAligned` if the last byte is partial.
    pub fn bytes(&self) -> Result<&[u8]> {
        self.require_aligned()?;
        Ok(&self.data)
    }

    /// All started bytes, a trailing partial byte included.
    #[must_use]
    pub fn raw_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read bit `index`.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` past `size_bits`.
    pub fn bit(&self, index: usize) -> Result<bool> {
        if index >= self.size_bits {
            return Err(Error::OutOfBounds {
                index,
                len: self.size_bits,
            });
        }
        Ok(self.data[index / 8] >> (index % 8) & 1 == 1)
    }

    /// Overwrite bit `index`. A complete byte gets its odd parity back.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` past `size_bits`.
    pub fn set_bit(&mut self, index: usize, bit: bool) -> Result<()> {
        if index >= self.size_bits {
            return Err(Error::OutOfBounds {
                index,
                len: self.size_bits,
            });
        }
        let position = index / 8;
        let byte = &mut self.data[position];
        if bit {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }
        if position < self.size_bits / 8 {
            self.parity[position] = odd_parity(*byte);
        }
        Ok(())
    }

    /// Overwrite (or append at `index == size_bytes`) a byte with odd parity.
    ///
    /// # Errors
    /// See [`set_byte_with_parity`](Self::set_byte_with_parity).
    pub fn set_byte(&mut self, index: usize, byte: u8) -> Result<()> {
        self.set_byte_with_parity(index, byte, odd_parity(byte))
    }

    /// Overwrite a byte and its parity bit, or append when `index` equals the
    /// current byte length.
    ///
    /// # Errors
    /// Returns `Error::NotByteAligned` on partial buffers,
    /// `Error::OutOfBounds` past the append position and
    /// `Error::CapacityExceeded` when an append does not fit.
    pub fn set_byte_with_parity(&mut self, index: usize, byte: u8, parity: bool) -> Result<()> {
        self.require_aligned()?;
        match index.cmp(&self.data.len()) {
            std::cmp::Ordering::Less => {
                self.data[index] = byte;
                self.parity[index] = parity;
                Ok(())
            }
            std::cmp::Ordering::Equal => self.append_byte_with_parity(byte, parity),
            std::cmp::Ordering::Greater => Err(Error::OutOfBounds {
                index,
                len: self.data.len(),
            }),
        }
    }

    /// Parity bit stored for the complete byte at `index`.
    ///
    /// # Errors
    /// Same as [`byte`](Self::byte).
    pub fn parity(&self, index: usize) -> Result<bool> {
        self.check_complete_byte(index)?;
        Ok(self.parity[index])
    }

    /// Whether every complete byte carries its odd parity bit.
    #[must_use]
    pub fn has_valid_parity(&self) -> bool {
        let complete = self.size_bits / 8;
        self.data[..complete]
            .iter()
            .zip(&self.parity[..complete])
            .all(|(&byte, &parity)| odd_parity(byte) == parity)
    }

    /// Whether the first complete byte equals `byte` (block PCB check).
    #[must_use]
    pub fn starts_with_byte(&self, byte: u8) -> bool {
        self.size_bits >= 8 && self.data.first() == Some(&byte)
    }

    fn push_aligned(&mut self, byte: u8, parity: bool) {
        self.data.push(byte);
        self.parity.push(parity);
        self.size_bits += 8;
    }

    fn push_bit(&mut self, bit: bool) {
        let offset = self.size_bits % 8;
        if offset == 0 {
            self.data.push(0);
            self.parity.push(false);
        }
        if let (Some(byte), Some(parity)) = (self.data.last_mut(), self.parity.last_mut()) {
            if bit {
                *byte |= 1 << offset;
            }
            if offset == 7 {
                *parity = odd_parity(*byte);
            }
        }
        self.size_bits += 1;
    }

    fn ensure_capacity(&self, additional_bits: usize) -> Result<()> {
        self.check_total(self.size_bits + additional_bits)
    }

    fn check_total(&self, total_bits: usize) -> Result<()> {
        match self.max_bits {
            Some(max_bits) if total_bits > max_bits => Err(Error::CapacityExceeded {
                requested_bits: total_bits,
                max_bits,
            }),
            _ => Ok(()),
        }
    }

    fn require_aligned(&self) -> Result<()> {
        if self.is_byte_aligned() {
            Ok(())
        } else {
            Err(Error::NotByteAligned {
                size_bits: self.size_bits,
            })
        }
    }

    fn check_complete_byte(&self, index: usize) -> Result<()> {
        if index >= self.data.len() {
            return Err(Error::OutOfBounds {
                index,
                len: self.data.len(),
            });
        }
        if (index + 1) * 8 > self.size_bits {
            return Err(Error::NotByteAligned {
                size_bits: self.size_bits,
            });
        }
        Ok(())
    }
}

impl PartialEq for BitBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.size_bits == other.size_bits && self.data == other.data && self.parity == other.parity
    }
}

impl Eq for BitBuffer {}

impl fmt::Display for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&format_hex(&self.data))?;
        if !self.is_byte_aligned() {
            write!(f, " ({} bits)", self.size_bits)?;
        }
        Ok(())
    }
}
