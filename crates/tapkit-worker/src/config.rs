//! Worker configuration.
//!
//! Every field has a default, so a JSON file only needs the settings it
//! changes:
//!
//! ```
//! use tapkit_worker::WorkerConfig;
//!
//! let config = WorkerConfig::from_json(r#"{ "read_attempts": 5, "poller": { "request": "reqa" } }"#).unwrap();
//! assert_eq!(config.read_attempts, 5);
//! assert_eq!(config.event_queue_capacity, 32);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tapkit_core::{Error, Result};
use tapkit_poller::PollerConfig;
use tapkit_protocol::MfClassicDict;
use tracing::debug;

/// Configuration of a [`Worker`](crate::Worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause between two polling cycles without a card.
    pub poll_interval_ms: u64,

    /// Events buffered before the worker waits for the consumer.
    pub event_queue_capacity: usize,

    /// Failed reads of a present card before `Fail` is reported.
    pub read_attempts: u32,

    pub poller: PollerConfig,

    pub mf_classic: MfClassicConfig,

    pub listener: ListenerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            event_queue_capacity: 32,
            read_attempts: 3,
            poller: PollerConfig::default(),
            mf_classic: MfClassicConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_dictionary(mut self, path: impl Into<PathBuf>) -> Self {
        self.mf_classic.dictionary_path = Some(path.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Parse a JSON configuration.
    ///
    /// # Errors
    /// Returns `Error::Format` for invalid JSON or wrongly typed fields.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::format(format!("Worker config: {e}")))
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file cannot be read and `Error::Format`
    /// if it is not a valid configuration.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&json)?;
        debug!(path = %path.display(), "Worker config loaded");
        Ok(config)
    }
}

/// Mifare Classic reading options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MfClassicConfig {
    /// User dictionary, tried after the built-in keys.
    pub dictionary_path: Option<PathBuf>,

    /// Start from the well-known default keys.
    pub builtin_dictionary: bool,
}

impl Default for MfClassicConfig {
    fn default() -> Self {
        Self {
            dictionary_path: None,
            builtin_dictionary: true,
        }
    }
}

impl MfClassicConfig {
    /// Built-in keys (if enabled) followed by the user dictionary.
    ///
    /// # Errors
    /// Returns `Error::Io` when the user dictionary cannot be read.
    pub async fn dictionary(&self) -> Result<MfClassicDict> {
        let mut dictionary = if self.builtin_dictionary {
            MfClassicDict::builtin()
        } else {
            MfClassicDict::new()
        };
        if let Some(path) = &self.dictionary_path {
            for key in MfClassicDict::load(path).await?.iter() {
                dictionary.add_key(*key);
            }
        }
        Ok(dictionary)
    }
}

/// Card emulation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Report `ReaderActivity` when a reader starts talking to the card.
    pub notify_reader_activity: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            notify_reader_activity: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.read_attempts, 3);
        assert!(config.mf_classic.builtin_dictionary);
        assert!(config.listener.notify_reader_activity);
    }

    #[test]
    fn test_invalid_json() {
        let error = WorkerConfig::from_json(r#"{ "read_attempts": "many" }"#).unwrap_err();
        assert!(matches!(error, Error::Format(_)));
    }

    #[tokio::test]
    async fn test_dictionary_merges_user_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# site keys\nFFFFFFFFFFFF\n0123456789AB").unwrap();

        let config = WorkerConfig::default().with_dictionary(file.path());
        let dictionary = config.mf_classic.dictionary().await.unwrap();
        assert_eq!(dictionary.total_keys(), MfClassicDict::builtin().total_keys() + 1);
        assert!(dictionary.contains(&"0123456789AB".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "poll_interval_ms": 250, "listener": {{ "notify_reader_activity": false }} }}"#)
            .unwrap();

        let config = WorkerConfig::load(file.path()).await.unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(!config.listener.notify_reader_activity);
        assert!(matches!(
            WorkerConfig::load("/nonexistent/tapkit.json").await,
            Err(Error::Io(_))
        ));
    }
}
