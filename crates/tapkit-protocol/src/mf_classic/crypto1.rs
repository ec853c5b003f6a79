//! Crypto1 stream cipher.
//!
//! A 48-bit LFSR split into odd and even bit halves, a non-linear filter
//! producing one keystream bit per clock, and the 16-bit card nonce PRNG.
//! Encrypted frames carry encrypted parity: each parity bit is XORed with the
//! keystream bit that follows its byte.

use super::MfClassicKey;
use tapkit_core::bit_buffer::odd_parity;
use tapkit_core::{BitBuffer, Result};

const LF_POLY_ODD: u32 = 0x29CE5C;
const LF_POLY_EVEN: u32 = 0x870804;

fn filter(x: u32) -> u32 {
    let mut f = (0xf22c0 >> (x & 0xf)) & 16;
    f |= (0x6c9c0 >> ((x >> 4) & 0xf)) & 8;
    f |= (0x3c8b0 >> ((x >> 8) & 0xf)) & 4;
    f |= (0x1e458 >> ((x >> 12) & 0xf)) & 2;
    f |= (0x0d938 >> ((x >> 16) & 0xf)) & 1;
    (0xEC57E80A >> f) & 1
}

fn parity32(x: u32) -> u32 {
    x.count_ones() & 1
}

/// Advance the card PRNG by `n` steps.
///
/// # Examples
///
/// ```
/// use tapkit_protocol::mf_classic::crypto1::prng_successor;
///
/// let nt = 0x0123_4567;
/// assert_eq!(prng_successor(prng_successor(nt, 32), 32), prng_successor(nt, 64));
/// ```
pub fn prng_successor(x: u32, n: u32) -> u32 {
    let mut x = x.swap_bytes();
    for _ in 0..n {
        x = x >> 1 | (x >> 16 ^ x >> 18 ^ x >> 19 ^ x >> 21) << 31;
    }
    x.swap_bytes()
}

/// Cipher state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Crypto1 {
    odd: u32,
    even: u32,
}

impl Crypto1 {
    /// Load `key` into a fresh state.
    pub fn new(key: &MfClassicKey) -> Self {
        let mut cipher = Self::default();
        cipher.init(key);
        cipher
    }

    /// Reload the LFSR with `key`.
    pub fn init(&mut self, key: &MfClassicKey) {
        let key = key.to_u64();
        self.odd = 0;
        self.even = 0;
        for i in (1..=47u32).rev().step_by(2) {
            self.odd = self.odd << 1 | (key >> ((i - 1) ^ 7) & 1) as u32;
            self.even = self.even << 1 | (key >> (i ^ 7) & 1) as u32;
        }
    }

    /// Clear the state (no key loaded).
    pub fn reset(&mut self) {
        self.odd = 0;
        self.even = 0;
    }

    /// Keystream bit the next clock will produce.
    pub fn peek(&self) -> bool {
        filter(self.odd) == 1
    }

    /// Clock once, feeding `input` (XORed with the output when `encrypted`).
    pub fn bit(&mut self, input: bool, encrypted: bool) -> u8 {
        let out = filter(self.odd);
        let mut feedin = out & u32::from(encrypted);
        feedin ^= u32::from(input);
        feedin ^= LF_POLY_ODD & self.odd;
        feedin ^= LF_POLY_EVEN & self.even;
        self.even = self.even << 1 | parity32(feedin);
        std::mem::swap(&mut self.odd, &mut self.even);
        out as u8
    }

    /// Clock eight times, LSB first.
    pub fn byte(&mut self, input: u8, encrypted: bool) -> u8 {
        (0..8).fold(0, |out, i| {
            out | self.bit(input >> i & 1 == 1, encrypted) << i
        })
    }

    /// Clock 32 times over a big-endian word, LSB of each byte first.
    pub fn word(&mut self, input: u32, encrypted: bool) -> u32 {
        (0..32).fold(0, |out, i| {
            let bit = input >> (i ^ 24) & 1 == 1;
            out | u32::from(self.bit(bit, encrypted)) << (i ^ 24)
        })
    }

    /// Encrypt a frame. Whole bytes get encrypted parity; frames shorter
    /// than a byte (ACK/NACK) are encrypted bit by bit.
    pub fn encrypt(&mut self, plain: &BitBuffer) -> Result<BitBuffer> {
        let mut out = BitBuffer::new();
        if plain.size_bits() < 8 {
            for index in 0..plain.size_bits() {
                let keystream = self.bit(false, false) == 1;
                out.append_bit(keystream ^ plain.bit(index)?)?;
            }
            return Ok(out);
        }
        for (index, &byte) in plain.bytes()?.iter().enumerate() {
            let encrypted = self.byte(0, false) ^ byte;
            let parity = self.peek() ^ odd_parity(byte);
            out.set_byte_with_parity(index, encrypted, parity)?;
        }
        Ok(out)
    }

    /// Decrypt a frame produced by [`encrypt`](Self::encrypt) on the peer.
    pub fn decrypt(&mut self, encrypted: &BitBuffer) -> Result<BitBuffer> {
        let mut out = BitBuffer::new();
        if encrypted.size_bits() < 8 {
            for index in 0..encrypted.size_bits() {
                let keystream = self.bit(false, false) == 1;
                out.append_bit(keystream ^ encrypted.bit(index)?)?;
            }
            return Ok(out);
        }
        for &byte in encrypted.bytes()? {
            out.append_byte(self.byte(0, false) ^ byte)?;
        }
        Ok(out)
    }

    /// Reader side of a first (non-nested) authentication.
    ///
    /// Loads `key`, mixes in `nt ^ cuid` and returns the 8-byte answer
    /// `{nr}{ar}` where `ar = suc64(nt)`.
    pub fn encrypt_reader_nonce(
        &mut self,
        key: &MfClassicKey,
        cuid: u32,
        nt: u32,
        nr: [u8; 4],
    ) -> Result<BitBuffer> {
        self.init(key);
        self.word(nt ^ cuid, false);

        let mut out = BitBuffer::with_max_bytes(8);
        for (index, &byte) in nr.iter().enumerate() {
            let encrypted = self.byte(byte, false) ^ byte;
            let parity = self.peek() ^ odd_parity(byte);
            out.set_byte_with_parity(index, encrypted, parity)?;
        }

        let mut successor = prng_successor(nt, 32);
        for index in 4..8 {
            successor = prng_successor(successor, 8);
            // Low byte of each 8-step successor is the next big-endian byte.
            let plain = successor as u8;
            let encrypted = self.byte(0, false) ^ plain;
            let parity = self.peek() ^ odd_parity(plain);
            out.set_byte_with_parity(index, encrypted, parity)?;
        }
        Ok(out)
    }
}
