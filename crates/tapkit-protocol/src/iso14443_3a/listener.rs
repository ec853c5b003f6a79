//! Card-side ISO14443-3A state machine.
//!
//! Answers REQA/WUPA, bit-oriented anticollision, SELECT and HLTA for one
//! card. Any other frame received while the card is selected is handed to the
//! layer above through [`ListenerAction::Forward`].

use super::{CascadeLevel, Iso14443_3aData, UID_CL_BITS, is_halt_request, sdd_known_bits, uid_part};
use crate::crc::{append_crc_a, bcc, check_crc_a};
use tapkit_core::constants::*;
use tapkit_core::{BitBuffer, Result};
use tracing::trace;

/// ISO14443-3A card states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iso14443_3aListenerState {
    Idle,
    Ready(CascadeLevel),
    Active,
    Halted,
}

/// What the card does with a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    /// Send this frame back.
    Respond(BitBuffer),
    /// Stay silent.
    Ignore,
    /// The card was halted by HLTA.
    Halted,
    /// Active-state frame for the upper protocol layer, untouched.
    Forward(BitBuffer),
}

/// Card side of ISO14443-3A.
#[derive(Debug, Clone)]
pub struct Iso14443_3aListener {
    data: Iso14443_3aData,
    state: Iso14443_3aListenerState,
    halted_before: bool,
}

impl Iso14443_3aListener {
    pub fn new(data: Iso14443_3aData) -> Self {
        Self {
            data,
            state: Iso14443_3aListenerState::Idle,
            halted_before: false,
        }
    }

    pub fn data(&self) -> &Iso14443_3aData {
        &self.data
    }

    pub fn state(&self) -> Iso14443_3aListenerState {
        self.state
    }

    /// Field loss: the card powers down and forgets the halted state.
    pub fn field_off(&mut self) {
        self.state = Iso14443_3aListenerState::Idle;
        self.halted_before = false;
    }

    /// Enter the halted state on behalf of an upper layer (encrypted HALT,
    /// ISO14443-4 DESELECT).
    pub fn halt(&mut self) {
        self.state = Iso14443_3aListenerState::Halted;
        self.halted_before = true;
    }

    /// Leave the selected state after an upper-layer protocol error.
    pub fn deselect(&mut self) {
        self.state = if self.halted_before {
            Iso14443_3aListenerState::Halted
        } else {
            Iso14443_3aListenerState::Idle
        };
    }

    /// Process one frame from the reader.
    pub fn process(&mut self, frame: &BitBuffer) -> Result<ListenerAction> {
        if frame.size_bits() == ISO14443_3A_SHORT_FRAME_BITS {
            return self.process_short_frame(frame.raw_bytes()[0]);
        }

        match self.state {
            Iso14443_3aListenerState::Idle | Iso14443_3aListenerState::Halted => {
                Ok(ListenerAction::Ignore)
            }
            Iso14443_3aListenerState::Ready(level) => self.process_ready(level, frame),
            Iso14443_3aListenerState::Active => {
                if is_halt_request(frame) {
                    trace!("Card halted");
                    self.halt();
                    Ok(ListenerAction::Halted)
                } else {
                    Ok(ListenerAction::Forward(frame.clone()))
                }
            }
        }
    }

    fn process_short_frame(&mut self, command: u8) -> Result<ListenerAction> {
        let wakes = match command {
            ISO14443_3A_WUPA => true,
            ISO14443_3A_REQA => self.state != Iso14443_3aListenerState::Halted,
            _ => false,
        };
        if !wakes {
            return Ok(ListenerAction::Ignore);
        }
        self.state = Iso14443_3aListenerState::Ready(CascadeLevel::One);
        Ok(ListenerAction::Respond(BitBuffer::from_bytes(&self.data.atqa)))
    }

    fn process_ready(&mut self, level: CascadeLevel, frame: &BitBuffer) -> Result<ListenerAction> {
        let bytes = frame.raw_bytes();
        let Some(part) = uid_part(&self.data.uid, level) else {
            self.deselect();
            return Ok(ListenerAction::Ignore);
        };
        if frame.size_bits() < 16 || bytes[0] != level.sel_command() {
            self.deselect();
            return Ok(ListenerAction::Ignore);
        }

        let mut uid_cl = BitBuffer::from_bytes(&part);
        uid_cl.append_byte(bcc(&part))?;

        if bytes[1] == ISO14443_3A_NVB_SELECT {
            if frame.size_bits() != 72
                || !check_crc_a(frame)
                || bytes[2..7] != *uid_cl.raw_bytes()
            {
                return Ok(ListenerAction::Ignore);
            }
            return self.select(level);
        }

        let Ok(known_bits) = sdd_known_bits(bytes[1]) else {
            return Ok(ListenerAction::Ignore);
        };
        if frame.size_bits() != 16 + known_bits {
            return Ok(ListenerAction::Ignore);
        }
        for index in 0..known_bits {
            if frame.bit(16 + index)? != uid_cl.bit(index)? {
                // Another card won this bit.
                return Ok(ListenerAction::Ignore);
            }
        }

        let mut response = BitBuffer::new();
        for index in known_bits..UID_CL_BITS {
            response.append_bit(uid_cl.bit(index)?)?;
        }
        Ok(ListenerAction::Respond(response))
    }

    fn select(&mut self, level: CascadeLevel) -> Result<ListenerAction> {
        let last_level = level.index() + 1 == self.data.uid.cascade_levels();
        let sak = if last_level {
            self.state = Iso14443_3aListenerState::Active;
            self.data.sak & !ISO14443_3A_SAK_CASCADE_BIT
        } else {
            // uid_part only yields levels the UID has, so a next level exists.
            self.state = Iso14443_3aListenerState::Ready(level.next().unwrap_or(level));
            ISO14443_3A_SAK_CASCADE_BIT
        };
        trace!(?level, sak, "Card selected");

        let mut response = BitBuffer::from_bytes(&[sak]);
        append_crc_a(&mut response)?;
        Ok(ListenerAction::Respond(response))
    }
}
