//! ISO14443-3A poller.
//!
//! Drives REQA/WUPA, bit-oriented anticollision and SELECT against a
//! transceiver, and offers the framed exchanges the layers above it build
//! on. Every frame goes through [`Iso14443_3aPoller::txrx`], which bounds
//! the wait for an answer with the frame wait time and never retries.
//!
//! # Examples
//!
//! ```
//! use tapkit_core::Uid;
//! use tapkit_hardware::mock::MockTransceiver;
//! use tapkit_poller::{Iso14443_3aPoller, PollerConfig};
//! use tapkit_protocol::{CardListener, Iso14443_3aData};
//!
//! #[tokio::main]
//! async fn main() -> tapkit_core::Result<()> {
//!     let (transceiver, handle) = MockTransceiver::new();
//!     let uid = Uid::new(&[0x04, 0x5A, 0x3B, 0x12, 0x6C, 0x80, 0x01])?;
//!     handle.add_card(CardListener::iso14443_3a(Iso14443_3aData::new(uid.clone(), [0x44, 0x00], 0x00)));
//!
//!     let mut poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
//!     let data = poller.activate().await?;
//!     assert_eq!(data.uid, uid);
//!
//!     poller.halt().await;
//!     Ok(())
//! }
//! ```

use crate::config::PollerConfig;
use crate::state::{PollerState, PollerStateMachine};
use std::time::Duration;
use tapkit_core::constants::{ISO14443_3A_GUARD_TIME_US, ISO14443_3A_SAK_CASCADE_BIT};
use tapkit_core::{BitBuffer, Error, Result, Uid};
use tapkit_hardware::{RxStatus, Transceiver};
use tapkit_protocol::crc::{append_crc_a, check_crc_a, trim_crc_a};
use tapkit_protocol::iso14443_3a::{
    self, ActivationFrames, CascadeFrames, CascadeLevel, Iso14443_3aData, RequestKind, UID_CL_BITS,
};
use tracing::{debug, trace, warn};

/// Highest UID bit a collision may be resolved at. The remaining bits of a
/// cascade level are the BCC, which is never ambiguous for distinct parts.
const MAX_RESOLVABLE_BIT: usize = 32;

/// Reader side of ISO14443-3A.
#[derive(Debug)]
pub struct Iso14443_3aPoller<T> {
    transceiver: T,
    config: PollerConfig,
    machine: PollerStateMachine,
    data: Option<Iso14443_3aData>,
    session_uid: Option<Uid>,
}

impl<T: Transceiver> Iso14443_3aPoller<T> {
    pub fn new(transceiver: T, config: PollerConfig) -> Self {
        Self {
            transceiver,
            config,
            machine: PollerStateMachine::new(),
            data: None,
            session_uid: None,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn state(&self) -> PollerState {
        *self.machine.current_state()
    }

    pub fn state_machine(&self) -> &PollerStateMachine {
        &self.machine
    }

    /// Identity of the currently selected card.
    pub fn data(&self) -> Option<&Iso14443_3aData> {
        self.data.as_ref()
    }

    /// UID the session is locked to, if any card was resolved.
    pub fn session_uid(&self) -> Option<&Uid> {
        self.session_uid.as_ref()
    }

    /// Unlock the session so that the next activation may resolve any card.
    pub fn reset_session(&mut self) {
        if let Some(uid) = self.session_uid.take() {
            debug!(uid = %uid, "Session released");
        }
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    pub fn transceiver_mut(&mut self) -> &mut T {
        &mut self.transceiver
    }

    pub fn into_transceiver(self) -> T {
        self.transceiver
    }

    /// Send one frame and wait at most `fwt` for the answer.
    ///
    /// This is the only path from the pollers to the transceiver. It
    /// performs no retries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when nothing answers within `fwt` and the
    /// converted hardware error when the transceiver fails.
    pub async fn txrx(&mut self, tx: &BitBuffer, fwt: Duration) -> Result<(BitBuffer, RxStatus)> {
        self.exchange(tx, fwt).await?.ok_or(Error::Timeout)
    }

    async fn exchange(
        &mut self,
        tx: &BitBuffer,
        fwt: Duration,
    ) -> Result<Option<(BitBuffer, RxStatus)>> {
        trace!(tx = %tx, "PCD");
        self.transceiver.tx(tx).await?;

        let mut rx = BitBuffer::new();
        match tokio::time::timeout(fwt, self.transceiver.rx(&mut rx)).await {
            Ok(status) => {
                let status = status?;
                trace!(rx = %rx, ?status, "PICC");
                Ok(Some((rx, status)))
            }
            Err(_) => {
                trace!(fwt_us = fwt.as_micros() as u64, "No answer");
                Ok(None)
            }
        }
    }

    /// Exchange a frame with CRC: the CRC is appended to `tx`, checked on
    /// the answer and removed from it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Nack` for a 4-bit answer, `Error::Communication` for
    /// collisions and parity errors and `Error::WrongCrc` for a corrupted
    /// answer.
    pub async fn send_standard_frame(&mut self, tx: &BitBuffer, fwt: Duration) -> Result<BitBuffer> {
        let mut frame = tx.clone();
        append_crc_a(&mut frame)?;
        let (mut rx, status) = self.txrx(&frame, fwt).await?;

        if let RxStatus::Collision { first_bit } = status {
            return Err(Error::communication(format!(
                "Collision at bit {first_bit} in a standard frame"
            )));
        }
        if rx.size_bits() == 4 {
            return Err(Error::Nack(rx.raw_bytes()[0] & 0x0F));
        }
        if !rx.has_valid_parity() {
            return Err(Error::communication("Parity error"));
        }
        if !check_crc_a(&rx) {
            return Err(Error::WrongCrc);
        }
        trim_crc_a(&mut rx)?;
        Ok(rx)
    }

    /// Exchange a frame whose parity bits are set by the caller (encrypted
    /// frames). Neither CRC nor parity is checked on the answer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when nothing answers and
    /// `Error::Communication` on a collision.
    pub async fn send_custom_parity_frame(&mut self, tx: &BitBuffer, fwt: Duration) -> Result<BitBuffer> {
        let (rx, status) = self.txrx(tx, fwt).await?;
        if let RxStatus::Collision { first_bit } = status {
            return Err(Error::communication(format!(
                "Collision at bit {first_bit} in an encrypted frame"
            )));
        }
        Ok(rx)
    }

    /// Check that a card still answers in the field.
    ///
    /// Sends WUPA and puts the card back to sleep with HLTA. The selected
    /// card's data is left untouched; the poller itself ends up Idle since
    /// the card no longer is selected.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotPresent` when nothing answers, `Error::Timeout`
    /// when the front-end itself times out and `Error::Communication` for a
    /// malformed ATQA.
    pub async fn check_presence(&mut self) -> Result<()> {
        self.ensure_field_on().await?;
        let wupa = iso14443_3a::sens_request(RequestKind::Wupa);
        let fwt = self.config.fwt();

        let result = match self.exchange(&wupa, fwt).await {
            Ok(Some((atqa, _))) => iso14443_3a::parse_atqa(&atqa).map(|_| ()),
            Ok(None) => Err(Error::NotPresent),
            Err(error) => Err(error),
        };
        if result.is_ok() {
            self.send_hlta().await;
        }
        if self.state() != PollerState::Idle {
            self.machine.reset();
        }
        trace!(present = result.is_ok(), "Presence check");
        result
    }

    /// Activate a card with the configured request.
    ///
    /// On success the card is selected and the poller is `Active`. On
    /// failure the poller goes through `Error` back to `Idle` and the most
    /// specific error kind is returned.
    ///
    /// When several cards answer, anticollision takes the `1` branch at
    /// every collision. The first UID resolved locks the session: resolving
    /// a different UID later fails with `Error::ColResFailed` until
    /// [`reset_session`](Self::reset_session).
    ///
    /// # Errors
    ///
    /// `Error::Timeout` when no card answers, `Error::ColResFailed` when
    /// anticollision fails or another card is resolved, `Error::WrongCrc`
    /// for a corrupted SAK and `Error::Communication` for malformed frames.
    pub async fn activate(&mut self) -> Result<Iso14443_3aData> {
        self.activate_with(self.config.request).await
    }

    /// Activate with WUPA regardless of the configured request, so that a
    /// card halted by a previous step wakes up again.
    ///
    /// # Errors
    ///
    /// Same as [`activate`](Self::activate).
    pub async fn reactivate(&mut self) -> Result<Iso14443_3aData> {
        self.activate_with(RequestKind::Wupa).await
    }

    async fn activate_with(&mut self, request: RequestKind) -> Result<Iso14443_3aData> {
        if self.state() != PollerState::Idle {
            self.machine.reset();
        }
        self.data = None;

        match self.run_activation(request).await {
            Ok(data) => {
                debug!(uid = %data.uid, sak = data.sak, "Card activated");
                self.data = Some(data.clone());
                Ok(data)
            }
            Err(error) => {
                self.abort(&error);
                Err(error)
            }
        }
    }

    async fn run_activation(&mut self, request: RequestKind) -> Result<Iso14443_3aData> {
        self.enter(PollerState::Reset)?;
        self.ensure_field_on().await?;

        self.enter(PollerState::Request)?;
        let fwt = self.config.fwt();
        let (atqa, status) = self.txrx(&iso14443_3a::sens_request(request), fwt).await?;
        if let RxStatus::Collision { first_bit } = status {
            debug!(first_bit, "ATQA collision, several cards in field");
        }
        iso14443_3a::parse_atqa(&atqa)?;

        let mut frames = ActivationFrames {
            atqa,
            levels: Vec::new(),
        };
        let mut level = CascadeLevel::One;
        loop {
            self.enter(PollerState::Collision(level))?;
            let uid_cl = self.resolve_uid_part(level).await?;
            let part = iso14443_3a::parse_sdd_response(&uid_cl)?;

            self.enter(PollerState::Select(level))?;
            let (sak, status) = self.txrx(&iso14443_3a::sel_request(level, &part)?, fwt).await?;
            if status.is_collision() || !sak.has_valid_parity() {
                return Err(Error::communication("Malformed SAK"));
            }
            let cascades = iso14443_3a::parse_sak(&sak)? & ISO14443_3A_SAK_CASCADE_BIT != 0;
            frames.levels.push(CascadeFrames { uid_cl, sak });

            if !cascades {
                break;
            }
            level = level
                .next()
                .ok_or_else(|| Error::communication("SAK announces a fourth cascade level"))?;
        }

        let data = iso14443_3a::activate_parse(&frames)?;
        if let Err(error) = self.lock_session(&data) {
            self.send_hlta().await;
            return Err(error);
        }
        self.enter(PollerState::Active)?;
        Ok(data)
    }

    /// Bit-oriented anticollision for one cascade level. Returns the 40 bits
    /// of UID part and BCC.
    async fn resolve_uid_part(&mut self, level: CascadeLevel) -> Result<BitBuffer> {
        let fwt = self.config.fwt();
        let mut known = BitBuffer::new();

        for round in 0..self.config.max_anticollision_iterations {
            let request = iso14443_3a::sdd_request(level, &known)?;
            let (answer, status) = self.txrx(&request, fwt).await?;

            match status {
                RxStatus::Complete => {
                    known.append_buffer(&answer)?;
                    if known.size_bits() != UID_CL_BITS {
                        return Err(Error::communication(format!(
                            "Anticollision ended with {} of {UID_CL_BITS} bits",
                            known.size_bits()
                        )));
                    }
                    return Ok(known);
                }
                RxStatus::Collision { first_bit } => {
                    let bit = known.size_bits() + first_bit;
                    if first_bit >= answer.size_bits() || bit >= MAX_RESOLVABLE_BIT {
                        return Err(Error::col_res(format!(
                            "Collision at UID bit {bit} cannot be resolved"
                        )));
                    }
                    for index in 0..first_bit {
                        known.append_bit(answer.bit(index)?)?;
                    }
                    known.append_bit(true)?;
                    debug!(?level, round, bit, "Collision, taking the 1 branch");
                }
            }
        }

        Err(Error::col_res(format!(
            "Anticollision did not converge in {} rounds",
            self.config.max_anticollision_iterations
        )))
    }

    fn lock_session(&mut self, data: &Iso14443_3aData) -> Result<()> {
        match &self.session_uid {
            Some(uid) if *uid != data.uid => Err(Error::col_res(format!(
                "Resolved {} while the session is locked to {uid}",
                data.uid
            ))),
            Some(_) => Ok(()),
            None => {
                self.session_uid = Some(data.uid.clone());
                Ok(())
            }
        }
    }

    /// Halt the selected card.
    ///
    /// Best effort: the card may already have left the field, so failures
    /// are logged and otherwise ignored.
    pub async fn halt(&mut self) {
        if self.enter(PollerState::Halt).is_err() {
            trace!(state = %self.state(), "Halt without a selected card");
        }
        self.send_hlta().await;
        self.machine.reset();
        self.data = None;
    }

    async fn send_hlta(&mut self) {
        let frame = match iso14443_3a::halt_request() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "Cannot build HLTA");
                return;
            }
        };
        match self.exchange(&frame, self.config.fwt()).await {
            Ok(None) => trace!("Card halted"),
            Ok(Some((answer, _))) => warn!(answer = %answer, "Card answered HLTA"),
            Err(error) => warn!(%error, "HLTA failed"),
        }
    }

    /// Switch the field off. Every card in it is reset.
    ///
    /// # Errors
    ///
    /// Returns the converted hardware error.
    pub async fn field_off(&mut self) -> Result<()> {
        self.machine.reset();
        self.data = None;
        self.transceiver.field_off().await?;
        Ok(())
    }

    async fn ensure_field_on(&mut self) -> Result<()> {
        if !self.transceiver.is_field_on() {
            self.transceiver.field_on().await?;
            // Cards need the guard time to power up before the first frame.
            tokio::time::sleep(Duration::from_micros(ISO14443_3A_GUARD_TIME_US)).await;
            debug!("Field on");
        }
        Ok(())
    }

    /// Record a state change made by this or a layered poller.
    pub(crate) fn enter(&mut self, state: PollerState) -> Result<()> {
        let transition = self.machine.transition_to(state)?;
        trace!(from = %transition.from, to = %transition.to, "Poller state");
        Ok(())
    }

    /// Unwind to `Idle` through `Error` after a failed exchange.
    pub(crate) fn abort(&mut self, error: &Error) {
        debug!(state = %self.state(), %error, "Poller aborted");
        if self.enter(PollerState::Error).is_err() {
            trace!("Abort from Idle");
        }
        self.machine.reset();
        self.data = None;
    }

    /// The card dropped its selection on its own (failed authentication,
    /// protocol error) and needs a new activation.
    pub(crate) fn mark_deselected(&mut self) {
        self.machine.reset();
        self.data = None;
    }
}
