//! Complete emulated card.
//!
//! [`CardListener`] stacks the ISO14443-3A listener with the optional upper
//! layers a card may speak: Mifare Classic, or ISO14443-4A (RATS/ATS and
//! I-blocks answered with status word `90 00`). Simulated cards in the
//! hardware crate and the worker's emulate mode both drive one of these.

use crate::crc::{append_crc_a, check_crc_a};
use crate::iso14443_3a::Iso14443_3aData;
use crate::iso14443_3a::listener::{Iso14443_3aListener, ListenerAction};
use crate::iso14443_4a::{AtsData, Iso14443_4aData, ats_fill_default, is_i_block, is_rats_request};
use crate::mf_classic::MfClassicData;
use crate::mf_classic::listener::{MfClassicAction, MfClassicListener};
use tapkit_core::constants::*;
use tapkit_core::{BitBuffer, Result, Uid};
use tracing::trace;

const S_BLOCK_DESELECT: u8 = 0xC2;
const STATUS_OK: [u8; 2] = [0x90, 0x00];

/// Card-side protocol stack.
#[derive(Debug, Clone)]
pub struct CardListener {
    iso14443_3a: Iso14443_3aListener,
    ats: Option<AtsData>,
    iso14443_4_active: bool,
    mf_classic: Option<MfClassicListener>,
}

impl CardListener {
    /// Plain ISO14443-3A card.
    pub fn iso14443_3a(data: Iso14443_3aData) -> Self {
        Self {
            iso14443_3a: Iso14443_3aListener::new(data),
            ats: None,
            iso14443_4_active: false,
            mf_classic: None,
        }
    }

    /// ISO14443-4A card. A missing ATS is replaced by the default one and
    /// the SAK is forced to announce ISO14443-4.
    pub fn iso14443_4a(data: Iso14443_4aData) -> Self {
        let mut base = data.iso14443_3a;
        base.sak |= ISO14443_3A_SAK_ISO14443_4_BIT;
        Self {
            ats: Some(data.ats.unwrap_or_else(ats_fill_default)),
            ..Self::iso14443_3a(base)
        }
    }

    /// Mifare Classic card backed by `data`.
    pub fn mf_classic(data: MfClassicData) -> Self {
        Self {
            mf_classic: Some(MfClassicListener::new(data.clone())),
            ..Self::iso14443_3a(data.iso14443_3a)
        }
    }

    pub fn iso14443_3a_data(&self) -> &Iso14443_3aData {
        self.iso14443_3a.data()
    }

    pub fn uid(&self) -> &Uid {
        &self.iso14443_3a.data().uid
    }

    /// Current Mifare Classic memory, including blocks written by readers.
    pub fn mf_classic_data(&self) -> Option<&MfClassicData> {
        self.mf_classic.as_ref().map(MfClassicListener::data)
    }

    /// Field loss resets every layer.
    pub fn field_off(&mut self) {
        self.iso14443_3a.field_off();
        self.reset_upper();
    }

    /// Process one reader frame; `Some` is the card's answer.
    pub fn process(&mut self, frame: &BitBuffer) -> Result<Option<BitBuffer>> {
        match self.iso14443_3a.process(frame)? {
            ListenerAction::Respond(response) => Ok(Some(response)),
            ListenerAction::Ignore => Ok(None),
            ListenerAction::Halted => {
                self.reset_upper();
                Ok(None)
            }
            ListenerAction::Forward(frame) => self.process_upper(&frame),
        }
    }

    fn reset_upper(&mut self) {
        self.iso14443_4_active = false;
        if let Some(mf_classic) = &mut self.mf_classic {
            mf_classic.reset();
        }
    }

    fn process_upper(&mut self, frame: &BitBuffer) -> Result<Option<BitBuffer>> {
        if let Some(mf_classic) = &mut self.mf_classic {
            match mf_classic.process(frame)? {
                MfClassicAction::Respond(response) => return Ok(Some(response)),
                MfClassicAction::Halt => {
                    self.iso14443_3a.halt();
                    return Ok(None);
                }
                MfClassicAction::Abort(response) => {
                    self.iso14443_3a.deselect();
                    return Ok(response);
                }
                MfClassicAction::Unhandled => {}
            }
        }

        let Some(ats) = &self.ats else {
            return Ok(None);
        };
        if !self.iso14443_4_active {
            if !is_rats_request(frame) {
                return Ok(None);
            }
            trace!("RATS received");
            self.iso14443_4_active = true;
            let mut response = BitBuffer::from_bytes(&ats.to_bytes()?);
            append_crc_a(&mut response)?;
            return Ok(Some(response));
        }

        if !check_crc_a(frame) {
            return Ok(None);
        }
        let pcb = frame.raw_bytes()[0];
        let mut response = if pcb == S_BLOCK_DESELECT {
            trace!("DESELECT received");
            self.iso14443_3a.halt();
            self.iso14443_4_active = false;
            BitBuffer::from_bytes(&[S_BLOCK_DESELECT])
        } else if is_i_block(pcb) {
            let mut response = BitBuffer::from_bytes(&[pcb]);
            response.append_bytes(&STATUS_OK)?;
            response
        } else {
            return Ok(None);
        };
        append_crc_a(&mut response)?;
        Ok(Some(response))
    }
}
