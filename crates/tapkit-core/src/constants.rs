//! RF timing and command constants shared across the protocol stack.
//!
//! ISO14443 timing is expressed in carrier cycles (`fc`, 1/13.56 MHz). The
//! helpers here convert those to [`Duration`]s for the async runtime.
//!
//! ```
//! use tapkit_core::constants::*;
//!
//! let fwt = fc_to_duration(ISO14443_3A_POLLER_MAX_FWT_FC);
//! assert_eq!(fwt.as_micros(), 4424);
//! ```

use std::time::Duration;

/// Carrier frequency of the RF field.
pub const CARRIER_FREQUENCY_HZ: u64 = 13_560_000;

// ISO14443-3A timing
pub const ISO14443_3A_FDT_LISTEN_FC: u32 = 1172;
pub const ISO14443_3A_FDT_POLL_FC: u32 = 6780;
pub const ISO14443_3A_POLLER_MAX_FWT_FC: u32 = 60_000;
pub const ISO14443_3A_GUARD_TIME_US: u64 = 5000;

// ISO14443-4A timing
pub const ISO14443_4A_POLLER_ATS_FWT_FC: u32 = 40_000;
pub const ISO14443_4A_DEFAULT_FWT_FC: u32 = 65_536;

// Mifare Classic timing
pub const MF_CLASSIC_FWT_FC: u32 = 60_000;

// ISO14443-3A commands
pub const ISO14443_3A_REQA: u8 = 0x26;
pub const ISO14443_3A_WUPA: u8 = 0x52;
pub const ISO14443_3A_HALT: [u8; 2] = [0x50, 0x00];
pub const ISO14443_3A_SEL_CL1: u8 = 0x93;
pub const ISO14443_3A_SEL_CL2: u8 = 0x95;
pub const ISO14443_3A_SEL_CL3: u8 = 0x97;
pub const ISO14443_3A_CASCADE_TAG: u8 = 0x88;
pub const ISO14443_3A_NVB_SELECT: u8 = 0x70;
pub const ISO14443_3A_SAK_CASCADE_BIT: u8 = 0x04;
pub const ISO14443_3A_SAK_ISO14443_4_BIT: u8 = 0x20;
pub const ISO14443_3A_SHORT_FRAME_BITS: usize = 7;

// ISO14443-4A commands
pub const ISO14443_4A_RATS: u8 = 0xE0;
pub const ISO14443_4A_PCB_I_BLOCK: u8 = 0x02;
pub const ISO14443_4A_PCB_R_ACK: u8 = 0xA2;

// Mifare Classic commands
pub const MF_CLASSIC_AUTH_KEY_A: u8 = 0x60;
pub const MF_CLASSIC_AUTH_KEY_B: u8 = 0x61;
pub const MF_CLASSIC_READ: u8 = 0x30;
pub const MF_CLASSIC_WRITE: u8 = 0xA0;
pub const MF_CLASSIC_ACK: u8 = 0x0A;
pub const MF_CLASSIC_NACK: u8 = 0x04;
pub const MF_CLASSIC_BLOCK_SIZE: usize = 16;
pub const MF_CLASSIC_KEY_SIZE: usize = 6;

/// Convert carrier cycles to wall-clock time, rounding down to nanoseconds.
pub fn fc_to_duration(fc: u32) -> Duration {
    Duration::from_nanos(u64::from(fc) * 1_000_000_000 / CARRIER_FREQUENCY_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fc_conversion() {
        assert_eq!(fc_to_duration(0), Duration::ZERO);
        assert_eq!(fc_to_duration(ISO14443_3A_FDT_LISTEN_FC).as_nanos(), 86_430);
        assert_eq!(fc_to_duration(13_560_000), Duration::from_secs(1));
    }
}
