//! Poller configuration.
//!
//! Timing is given in carrier cycles (`fc`) like the ISO14443 standard does;
//! the pollers convert to [`Duration`] right before waiting.
//!
//! ```
//! use tapkit_poller::PollerConfig;
//! use tapkit_protocol::RequestKind;
//!
//! let config: PollerConfig = serde_json::from_str(r#"{ "request": "reqa" }"#).unwrap();
//! assert_eq!(config.request, RequestKind::Reqa);
//! assert_eq!(config.max_anticollision_iterations, 32);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tapkit_core::constants::*;
use tapkit_protocol::RequestKind;

/// Configuration shared by the ISO14443-3A family of pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Short frame opening each activation.
    pub request: RequestKind,

    /// Frame wait time for ISO14443-3A exchanges.
    pub fwt_fc: u32,

    /// Frame wait time for the answer to RATS.
    pub ats_fwt_fc: u32,

    /// Frame wait time for Mifare Classic exchanges.
    pub mf_classic_fwt_fc: u32,

    /// Anticollision rounds allowed per cascade level. Each round resolves
    /// at least one UID bit, so 32 always suffices for a well-behaved field.
    pub max_anticollision_iterations: usize,

    /// Frame size the reader accepts, sent in RATS.
    pub rats_fsdi: u8,

    /// Card identifier assigned in RATS.
    pub rats_cid: u8,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            request: RequestKind::Wupa,
            fwt_fc: ISO14443_3A_POLLER_MAX_FWT_FC,
            ats_fwt_fc: ISO14443_4A_POLLER_ATS_FWT_FC,
            mf_classic_fwt_fc: MF_CLASSIC_FWT_FC,
            max_anticollision_iterations: 32,
            rats_fsdi: 0x08,
            rats_cid: 0,
        }
    }
}

impl PollerConfig {
    pub fn with_request(mut self, request: RequestKind) -> Self {
        self.request = request;
        self
    }

    /// Use one frame wait time for every exchange.
    pub fn with_fwt_fc(mut self, fwt_fc: u32) -> Self {
        self.fwt_fc = fwt_fc;
        self.ats_fwt_fc = fwt_fc;
        self.mf_classic_fwt_fc = fwt_fc;
        self
    }

    pub fn with_max_anticollision_iterations(mut self, iterations: usize) -> Self {
        self.max_anticollision_iterations = iterations;
        self
    }

    pub fn fwt(&self) -> Duration {
        fc_to_duration(self.fwt_fc)
    }

    pub fn ats_fwt(&self) -> Duration {
        fc_to_duration(self.ats_fwt_fc)
    }

    pub fn mf_classic_fwt(&self) -> Duration {
        fc_to_duration(self.mf_classic_fwt_fc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.request, RequestKind::Wupa);
        assert_eq!(config.fwt().as_micros(), 4424);
        assert_eq!(config.rats_fsdi, 8);
    }

    #[test]
    fn test_builder() {
        let config = PollerConfig::default()
            .with_request(RequestKind::Reqa)
            .with_fwt_fc(13_560)
            .with_max_anticollision_iterations(4);
        assert_eq!(config.fwt(), Duration::from_millis(1));
        assert_eq!(config.ats_fwt(), Duration::from_millis(1));
        assert_eq!(config.mf_classic_fwt(), Duration::from_millis(1));
        assert_eq!(config.max_anticollision_iterations, 4);
    }

    #[test]
    fn test_json_round_trip() {
        let config = PollerConfig::default().with_request(RequestKind::Reqa);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PollerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
