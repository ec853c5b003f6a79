//! Device record: what was read from a card, and where it is stored.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tapkit_core::format::{FormatReader, FormatWriter, KeyValueFile};
use tapkit_core::{Error, Result};
use tapkit_protocol::ProtocolData;
use tracing::{debug, info};

pub const DEVICE_FILETYPE: &str = "Flipper NFC device";
pub const DEVICE_FILE_VERSION: u32 = 4;

const READ_TIME_KEY: &str = "Read time";

/// A card as the application knows it.
///
/// The worker owns the record while it runs and hands it back from
/// [`Worker::stop`](crate::Worker::stop).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfcDevice {
    data: Option<ProtocolData>,
    load_path: Option<PathBuf>,
    read_at: Option<DateTime<Utc>>,
}

impl NfcDevice {
    /// Empty record, ready to be filled by a read.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: impl Into<ProtocolData>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn data(&self) -> Option<&ProtocolData> {
        self.data.as_ref()
    }

    pub fn take_data(&mut self) -> Option<ProtocolData> {
        self.data.take()
    }

    /// Store freshly read data and stamp the read time.
    pub fn set_data(&mut self, data: ProtocolData) {
        self.data = Some(data);
        self.read_at = Some(Utc::now());
    }

    /// Replace the data without touching the read time, e.g. after an
    /// emulated card was written to by a reader.
    pub fn update_data(&mut self, data: ProtocolData) {
        self.data = Some(data);
    }

    pub fn load_path(&self) -> Option<&Path> {
        self.load_path.as_deref()
    }

    pub fn read_at(&self) -> Option<DateTime<Utc>> {
        self.read_at
    }

    /// Serialize into the key-value text format.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` for a record without data.
    pub fn to_text(&self) -> Result<String> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| Error::invalid_data("Device has no data"))?;

        let mut file = KeyValueFile::new();
        file.write_header(DEVICE_FILETYPE, DEVICE_FILE_VERSION);
        data.save(&mut file)?;
        if let Some(read_at) = self.read_at {
            file.write_string(READ_TIME_KEY, &read_at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        Ok(file.to_text())
    }

    /// Parse a record written by [`to_text`](Self::to_text).
    ///
    /// # Errors
    /// Returns `Error::Format` for a foreign file type, an unsupported
    /// version or malformed fields.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut file = KeyValueFile::parse(text)?;
        let (filetype, version) = file.read_header()?;
        if filetype != DEVICE_FILETYPE {
            return Err(Error::format(format!("Not an NFC device file: {filetype}")));
        }
        if version != DEVICE_FILE_VERSION {
            return Err(Error::format(format!("Unsupported device file version {version}")));
        }

        let data = ProtocolData::load(&mut file)?;
        let read_at = if file.key_exists(READ_TIME_KEY) {
            let value = file.read_string(READ_TIME_KEY)?;
            let read_at = DateTime::parse_from_rfc3339(&value)
                .map_err(|e| Error::format(format!("{READ_TIME_KEY}: {e}")))?;
            Some(read_at.with_timezone(&Utc))
        } else {
            None
        };

        Ok(Self {
            data: Some(data),
            load_path: None,
            read_at,
        })
    }

    /// Write the record to `path` and remember it as the load path.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` for a record without data and
    /// `Error::Io` on write failure.
    pub async fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::write(path, self.to_text()?).await?;
        self.load_path = Some(path.to_path_buf());
        info!(path = %path.display(), "Device saved");
        Ok(())
    }

    /// Load a record from `path`.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file cannot be read and `Error::Format`
    /// if it is not a valid device file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let mut device = Self::from_text(&text)?;
        device.load_path = Some(path.to_path_buf());
        debug!(path = %path.display(), "Device loaded");
        Ok(device)
    }
}
