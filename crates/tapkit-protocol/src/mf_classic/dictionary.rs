//! Key dictionary for brute-force authentication.
//!
//! Dictionary files hold one 12-hex-digit key per line. Blank lines and lines
//! starting with `#` are skipped, as are malformed lines (with a warning).
//! Readers consume keys sequentially through [`MfClassicDict::next_key`] and
//! start over with [`MfClassicDict::rewind`].
//!
//! # Examples
//!
//! ```
//! use tapkit_protocol::mf_classic::dictionary::MfClassicDict;
//!
//! let mut dict = MfClassicDict::parse("# transport\nFFFFFFFFFFFF\nA0A1A2A3A4A5\n");
//! assert_eq!(dict.total_keys(), 2);
//! assert_eq!(dict.next_key().unwrap().to_string(), "FFFFFFFFFFFF");
//! assert_eq!(dict.next_key().unwrap().to_string(), "A0A1A2A3A4A5");
//! assert!(dict.next_key().is_none());
//! ```

use super::MfClassicKey;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::Path;
use tapkit_core::{Error, Result};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Longest line accepted from a dictionary file.
const MAX_LINE_LENGTH: usize = 256;

/// Keys shipped with the firmware's default dictionary head.
const BUILTIN_KEYS: [[u8; 6]; 12] = [
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5],
    [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5],
    [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x4D, 0x3A, 0x99, 0xC3, 0x51, 0xDD],
    [0x1A, 0x98, 0x2C, 0x7E, 0x45, 0x9A],
    [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
    [0x71, 0x4C, 0x5C, 0x88, 0x6E, 0x97],
    [0x58, 0x7E, 0xE5, 0xF9, 0x35, 0x0F],
    [0xA0, 0x47, 0x8C, 0xC3, 0x90, 0x91],
    [0x53, 0x3C, 0xB6, 0xC7, 0x23, 0xF6],
];

/// Ordered, duplicate-free list of keys with a read cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MfClassicDict {
    keys: Vec<MfClassicKey>,
    index: HashSet<MfClassicKey>,
    cursor: usize,
}

impl MfClassicDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Well-known transport and vendor default keys.
    pub fn builtin() -> Self {
        let mut dict = Self::new();
        for key in BUILTIN_KEYS {
            dict.add_key(MfClassicKey::new(key));
        }
        dict
    }

    /// Parse dictionary text, skipping comments and malformed lines.
    pub fn parse(text: &str) -> Self {
        let mut dict = Self::new();
        for (number, line) in text.lines().enumerate() {
            dict.add_line(number + 1, line);
        }
        dict
    }

    /// Stream a dictionary file line by line.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file cannot be opened or read. Lines
    /// longer than 256 characters are skipped like any malformed line.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let mut lines = FramedRead::new(file, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let mut dict = Self::new();
        let mut number = 0;
        while let Some(line) = lines.next().await {
            number += 1;
            match line {
                Ok(line) => dict.add_line(number, &line),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(line = number, "Skipping over-long dictionary line");
                }
                Err(LinesCodecError::Io(error)) => return Err(Error::Io(error)),
            }
        }
        debug!(path = %path.display(), keys = dict.total_keys(), "Dictionary loaded");
        Ok(dict)
    }

    /// Write all keys, one per line.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path).await?;
        file.write_all(self.to_text().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub fn to_text(&self) -> String {
        self.keys.iter().map(|key| format!("{key}\n")).collect()
    }

    fn add_line(&mut self, number: usize, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match line.parse::<MfClassicKey>() {
            Ok(key) => {
                self.add_key(key);
            }
            Err(error) => warn!(line = number, %error, "Skipping dictionary line"),
        }
    }

    /// Next key after the cursor, or `None` at the end.
    pub fn next_key(&mut self) -> Option<MfClassicKey> {
        let key = self.keys.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(key)
    }

    /// Move the cursor back to the first key.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn total_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_at(&self, index: usize) -> Option<MfClassicKey> {
        self.keys.get(index).copied()
    }

    pub fn contains(&self, key: &MfClassicKey) -> bool {
        self.index.contains(key)
    }

    /// Append `key` unless present. Returns whether it was added.
    pub fn add_key(&mut self, key: MfClassicKey) -> bool {
        if !self.index.insert(key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    /// Parse and append a key given as hex text.
    ///
    /// # Errors
    /// Returns `Error::Format` for anything but 12 hex digits.
    pub fn add_key_str(&mut self, key: &str) -> Result<bool> {
        Ok(self.add_key(key.parse()?))
    }

    /// Remove the key at `index`, keeping the cursor on the same next key.
    ///
    /// # Errors
    /// Returns `Error::OutOfBounds` past the end.
    pub fn delete_index(&mut self, index: usize) -> Result<MfClassicKey> {
        if index >= self.keys.len() {
            return Err(Error::OutOfBounds {
                index,
                len: self.keys.len(),
            });
        }
        if index < self.cursor {
            self.cursor -= 1;
        }
        let key = self.keys.remove(index);
        self.index.remove(&key);
        Ok(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MfClassicKey> {
        self.keys.iter()
    }
}
