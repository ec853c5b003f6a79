//! Named key-value persistence.
//!
//! Device records and dictionaries are stored as line-oriented text:
//!
//! ```text
//! Filetype: Flipper NFC device
//! Version: 4
//! # Device type can be ISO14443-3A, ISO14443-4A, Mifare Classic
//! Device type: ISO14443-3A
//! UID: 04 01 23 45 67 89 00
//! ```
//!
//! Protocol code only talks to the [`FormatWriter`] and [`FormatReader`]
//! traits; [`KeyValueFile`] is the in-memory implementation backed by a file.

use crate::{
    Result,
    error::Error,
    types::{format_hex, parse_hex},
};
use std::path::Path;

const FILETYPE_KEY: &str = "Filetype";
const VERSION_KEY: &str = "Version";

/// Sink for named fields.
pub trait FormatWriter {
    fn write_header(&mut self, filetype: &str, version: u32);
    fn write_comment(&mut self, comment: &str);
    fn write_string(&mut self, key: &str, value: &str);
    fn write_hex(&mut self, key: &str, bytes: &[u8]);
    fn write_u32(&mut self, key: &str, value: u32);
}

/// Source of named fields.
///
/// Lookups start at the current read position and wrap around once, so
/// reading fields in file order is linear while out-of-order reads still work.
pub trait FormatReader {
    /// Read and return `(filetype, version)`.
    fn read_header(&mut self) -> Result<(String, u32)>;
    fn read_string(&mut self, key: &str) -> Result<String>;
    fn read_hex(&mut self, key: &str, len: usize) -> Result<Vec<u8>>;
    fn read_u32(&mut self, key: &str) -> Result<u32>;
    fn key_exists(&mut self, key: &str) -> bool;
    /// Move the read position back to the first line.
    fn rewind(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Comment(String),
    Field { key: String, value: String },
}

/// Ordered text key-value file.
///
/// # Examples
///
/// ```
/// use tapkit_core::format::{FormatReader, FormatWriter, KeyValueFile};
///
/// let mut file = KeyValueFile::new();
/// file.write_header("Flipper NFC device", 4);
/// file.write_hex("UID", &[0x04, 0xA1]);
///
/// let mut parsed = KeyValueFile::parse(&file.to_text()).unwrap();
/// assert_eq!(parsed.read_header().unwrap().1, 4);
/// assert_eq!(parsed.read_hex("UID", 2).unwrap(), vec![0x04, 0xA1]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueFile {
    lines: Vec<Line>,
    position: usize,
}

impl KeyValueFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse text content. Blank lines are dropped.
    ///
    /// # Errors
    /// Returns `Error::Format` for a non-comment line without `": "`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                lines.push(Line::Comment(comment.trim_start().to_string()));
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::format(format!("Line {}: expected 'Key: Value'", number + 1))
            })?;
            lines.push(Line::Field {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
        Ok(Self { lines, position: 0 })
    }

    /// Serialize to text, one line per entry.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            match line {
                Line::Comment(comment) => {
                    text.push_str("# ");
                    text.push_str(comment);
                }
                Line::Field { key, value } => {
                    text.push_str(key);
                    text.push_str(": ");
                    text.push_str(value);
                }
            }
            text.push('\n');
        }
        text
    }

    /// Load and parse a file.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file cannot be read, `Error::Format` if it
    /// cannot be parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    /// Write the file, replacing any existing content.
    ///
    /// # Errors
    /// Returns `Error::Io` on write failure.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_text()).await?;
        Ok(())
    }

    /// Number of fields (comments excluded).
    pub fn field_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, Line::Field { .. }))
            .count()
    }

    fn push_field(&mut self, key: &str, value: String) {
        self.lines.push(Line::Field {
            key: key.to_string(),
            value,
        });
    }

    fn seek(&mut self, key: &str) -> Option<&str> {
        let len = self.lines.len();
        let found = (0..len)
            .map(|offset| (self.position + offset) % len)
            .find(|&index| matches!(&self.lines[index], Line::Field { key: k, .. } if k == key))?;
        self.position = (found + 1) % len;
        match &self.lines[found] {
            Line::Field { value, .. } => Some(value),
            Line::Comment(_) => None,
        }
    }

    fn require(&mut self, key: &str) -> Result<String> {
        self.seek(key)
            .map(str::to_string)
            .ok_or_else(|| Error::format(format!("Missing key: {key}")))
    }
}

impl FormatWriter for KeyValueFile {
    fn write_header(&mut self, filetype: &str, version: u32) {
        self.push_field(FILETYPE_KEY, filetype.to_string());
        self.push_field(VERSION_KEY, version.to_string());
    }

    fn write_comment(&mut self, comment: &str) {
        self.lines.push(Line::Comment(comment.to_string()));
    }

    fn write_string(&mut self, key: &str, value: &str) {
        self.push_field(key, value.to_string());
    }

    fn write_hex(&mut self, key: &str, bytes: &[u8]) {
        self.push_field(key, format_hex(bytes));
    }

    fn write_u32(&mut self, key: &str, value: u32) {
        self.push_field(key, value.to_string());
    }
}

impl FormatReader for KeyValueFile {
    fn read_header(&mut self) -> Result<(String, u32)> {
        let filetype = self.require(FILETYPE_KEY)?;
        let version = self.read_u32(VERSION_KEY)?;
        Ok((filetype, version))
    }

    fn read_string(&mut self, key: &str) -> Result<String> {
        self.require(key)
    }

    fn read_hex(&mut self, key: &str, len: usize) -> Result<Vec<u8>> {
        let bytes = parse_hex(&self.require(key)?)?;
        if bytes.len() != len {
            return Err(Error::format(format!(
                "{key}: expected {len} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn read_u32(&mut self, key: &str) -> Result<u32> {
        let value = self.require(key)?;
        value
            .parse()
            .map_err(|_| Error::format(format!("{key}: invalid number '{value}'")))
    }

    fn key_exists(&mut self, key: &str) -> bool {
        self.seek(key).is_some()
    }

    fn rewind(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyValueFile {
        KeyValueFile::parse(
            "Filetype: Flipper NFC device\n\
             Version: 4\n\
             # comment line\n\
             \n\
             Device type: ISO14443-3A\n\
             UID: 04 01 23 45 67 89 00\n\
             SAK: 08\n",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_fields_and_comments() {
        let file = sample();
        assert_eq!(file.field_count(), 5);
        assert!(file.to_text().contains("# comment line\n"));
    }

    #[test]
    fn test_read_in_order() {
        let mut file = sample();
        assert_eq!(
            file.read_header().unwrap(),
            ("Flipper NFC device".to_string(), 4)
        );
        assert_eq!(file.read_string("Device type").unwrap(), "ISO14443-3A");
        assert_eq!(file.read_hex("UID", 7).unwrap()[6], 0x00);
    }

    #[test]
    fn test_lookup_wraps_around() {
        let mut file = sample();
        assert_eq!(file.read_hex("SAK", 1).unwrap(), vec![0x08]);
        assert_eq!(file.read_string("Device type").unwrap(), "ISO14443-3A");
    }

    #[test]
    fn test_missing_key_and_bad_values() {
        let mut file = sample();
        assert!(matches!(file.read_string("ATQA"), Err(Error::Format(_))));
        assert!(file.read_hex("UID", 4).is_err());
        assert!(file.read_u32("Device type").is_err());
        assert!(!file.key_exists("ATQA"));
        assert!(file.key_exists("UID"));
    }

    #[test]
    fn test_rejects_line_without_separator() {
        assert!(KeyValueFile::parse("Filetype Flipper").is_err());
    }

    #[test]
    fn test_empty_file_lookup() {
        let mut file = KeyValueFile::new();
        assert!(!file.key_exists("UID"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.nfc");

        let mut file = KeyValueFile::new();
        file.write_header("Flipper NFC device", 4);
        file.write_comment("UID is common for all formats");
        file.write_hex("UID", &[0xDE, 0xAD, 0xBE, 0xEF]);
        file.write_u32("Data format version", 2);
        file.save(&path).await.unwrap();

        let loaded = KeyValueFile::load(&path).await.unwrap();
        assert_eq!(loaded, file);
    }
}
