//! ISO14443-4A poller: RATS/ATS on top of an activated 3A card, then
//! I-block exchanges.

use crate::iso14443_3a::Iso14443_3aPoller;
use crate::state::PollerState;
use std::time::Duration;
use tapkit_core::constants::{ISO14443_4A_DEFAULT_FWT_FC, fc_to_duration};
use tapkit_core::{BitBuffer, Error, Result};
use tapkit_hardware::Transceiver;
use tapkit_protocol::crc::check_crc_a;
use tapkit_protocol::iso14443_4a::{self, AtsData, BlockProtocol, Iso14443_4aData};
use tracing::{debug, trace, warn};

const PCB_DESELECT: u8 = 0xC2;

/// Reader side of ISO14443-4A.
#[derive(Debug)]
pub struct Iso14443_4aPoller<T> {
    iso14443_3a: Iso14443_3aPoller<T>,
    block: BlockProtocol,
    data: Option<Iso14443_4aData>,
}

impl<T: Transceiver> Iso14443_4aPoller<T> {
    /// Layer over a 3A poller. A card it already activated can go straight
    /// to [`read_ats`](Self::read_ats).
    pub fn new(iso14443_3a: Iso14443_3aPoller<T>) -> Self {
        Self {
            iso14443_3a,
            block: BlockProtocol::new(),
            data: None,
        }
    }

    pub fn iso14443_3a(&self) -> &Iso14443_3aPoller<T> {
        &self.iso14443_3a
    }

    pub fn iso14443_3a_mut(&mut self) -> &mut Iso14443_3aPoller<T> {
        &mut self.iso14443_3a
    }

    pub fn into_iso14443_3a(self) -> Iso14443_3aPoller<T> {
        self.iso14443_3a
    }

    pub fn data(&self) -> Option<&Iso14443_4aData> {
        self.data.as_ref()
    }

    /// Activate the card and, when its SAK announces ISO14443-4, read the
    /// ATS.
    ///
    /// # Errors
    ///
    /// Any activation error of the 3A layer, plus the errors of
    /// [`read_ats`](Self::read_ats).
    pub async fn activate(&mut self) -> Result<Iso14443_4aData> {
        self.data = None;
        let base = self.iso14443_3a.activate().await?;
        self.complete_activation(base).await
    }

    /// Finish an activation already done by the 3A layer.
    pub(crate) async fn complete_activation(
        &mut self,
        base: tapkit_protocol::Iso14443_3aData,
    ) -> Result<Iso14443_4aData> {
        let ats = if base.supports_iso14443_4() {
            self.read_ats().await?
        } else {
            trace!(sak = base.sak, "SAK without ISO14443-4 support, skipping RATS");
            None
        };
        let data = Iso14443_4aData {
            iso14443_3a: base,
            ats,
        };
        self.data = Some(data.clone());
        Ok(data)
    }

    /// Send RATS and parse the answer.
    ///
    /// An ATS made of TL alone is a valid answer without extended
    /// capabilities and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` when the card stays silent, `Error::WrongCrc` for a
    /// corrupted ATS and `Error::Communication` for a malformed one. The
    /// poller is back in `Idle` after any error.
    pub async fn read_ats(&mut self) -> Result<Option<AtsData>> {
        self.iso14443_3a.enter(PollerState::ReadAts)?;
        match self.exchange_rats().await {
            Ok(ats) => {
                self.iso14443_3a.enter(PollerState::Active)?;
                self.block.reset();
                debug!(ats = ?ats, "ATS received");
                Ok(ats)
            }
            Err(error) => {
                self.iso14443_3a.abort(&error);
                Err(error)
            }
        }
    }

    async fn exchange_rats(&mut self) -> Result<Option<AtsData>> {
        let config = self.iso14443_3a.config();
        let rats = iso14443_4a::rats_request(config.rats_fsdi, config.rats_cid)?;
        let fwt = config.ats_fwt();
        let (mut answer, _) = self.iso14443_3a.txrx(&rats, fwt).await?;

        if answer.is_empty() {
            return Ok(None);
        }
        if !check_crc_a(&answer) {
            return Err(Error::WrongCrc);
        }
        tapkit_protocol::trim_crc_a(&mut answer)?;
        iso14443_4a::ats_parse(&answer)
    }

    fn fwt(&self) -> Duration {
        let fwt_fc = self
            .data
            .as_ref()
            .and_then(|data| data.ats.as_ref())
            .map_or(ISO14443_4A_DEFAULT_FWT_FC, AtsData::fwt_fc);
        fc_to_duration(fwt_fc)
    }

    /// Exchange one I-block and return the card's payload.
    ///
    /// # Errors
    ///
    /// `Error::Communication` when no card is active or the answer does not
    /// match the block sent, `Error::WrongCrc` for a corrupted answer and
    /// `Error::Timeout` when the card stays silent.
    pub async fn send_block(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.iso14443_3a.state().is_active() {
            return Err(Error::communication("No ISO14443-4 card is active"));
        }
        let frame = self.block.encode_i_block(payload)?;
        let fwt = self.fwt();
        let (answer, _) = self.iso14443_3a.txrx(&frame, fwt).await?;
        self.block.decode_i_block(&answer)
    }

    /// Send DESELECT and leave the card halted. Best effort, like HLTA.
    pub async fn halt(&mut self) {
        let mut frame = BitBuffer::from_bytes(&[PCB_DESELECT]);
        if let Err(error) = tapkit_protocol::append_crc_a(&mut frame) {
            warn!(%error, "Cannot build DESELECT");
            return;
        }
        let fwt = self.fwt();
        match self.iso14443_3a.txrx(&frame, fwt).await {
            Ok((answer, _)) if answer.starts_with_byte(PCB_DESELECT) => trace!("Card deselected"),
            Ok((answer, _)) => warn!(answer = %answer, "Unexpected answer to DESELECT"),
            Err(error) => warn!(%error, "DESELECT failed"),
        }
        self.iso14443_3a.mark_deselected();
        self.block.reset();
        self.data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PollerConfig;
    use tapkit_core::Uid;
    use tapkit_hardware::mock::{Fault, MockTransceiver, MockTransceiverHandle};
    use tapkit_protocol::{CardListener, Iso14443_3aData, ats_fill_default};

    fn setup(sak: u8) -> (Iso14443_4aPoller<MockTransceiver>, MockTransceiverHandle) {
        let (transceiver, handle) = MockTransceiver::new();
        let base = Iso14443_3aData::new(Uid::new(&[0x08, 0x21, 0x43, 0x65]).unwrap(), [0x04, 0x00], sak);
        let card = if sak & 0x20 != 0 {
            CardListener::iso14443_4a(Iso14443_4aData {
                iso14443_3a: base,
                ats: None,
            })
        } else {
            CardListener::iso14443_3a(base)
        };
        handle.add_card(card);
        let poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
        (Iso14443_4aPoller::new(poller), handle)
    }

    #[tokio::test]
    async fn test_activate_reads_default_ats() {
        let (mut poller, _handle) = setup(0x20);
        let data = poller.activate().await.unwrap();
        assert_eq!(data.ats, Some(ats_fill_default()));
        assert_eq!(poller.iso14443_3a().state(), PollerState::Active);
    }

    #[tokio::test]
    async fn test_no_rats_without_sak_bit() {
        let (mut poller, handle) = setup(0x00);
        let data = poller.activate().await.unwrap();
        assert!(data.ats.is_none());
        // WUPA, anticollision, SELECT: no RATS went out.
        assert_eq!(handle.counters().tx_frames, 3);
    }

    #[tokio::test]
    async fn test_corrupted_ats_is_wrong_crc() {
        let (mut poller, handle) = setup(0x20);
        poller.iso14443_3a_mut().activate().await.unwrap();
        handle.set_fault(Some(Fault::CorruptCrc));

        let error = poller.read_ats().await.unwrap_err();
        assert!(matches!(error, Error::WrongCrc));
        assert_eq!(poller.iso14443_3a().state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_i_block_exchange() {
        let (mut poller, _handle) = setup(0x20);
        poller.activate().await.unwrap();

        let answer = poller.send_block(&[0x00, 0xA4, 0x04, 0x00]).await.unwrap();
        assert_eq!(answer, vec![0x90, 0x00]);
        // The block number toggles; the card mirrors it.
        let answer = poller.send_block(&[0x00, 0xB0, 0x00, 0x00]).await.unwrap();
        assert_eq!(answer, vec![0x90, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deselect_halts_card() {
        let (mut poller, _handle) = setup(0x20);
        poller.activate().await.unwrap();
        poller.halt().await;
        assert!(poller.data().is_none());
        assert!(poller.send_block(&[0x00]).await.is_err());

        let mut reqa = Iso14443_3aPoller::new(
            poller.into_iso14443_3a().into_transceiver(),
            PollerConfig::default().with_request(tapkit_protocol::RequestKind::Reqa),
        );
        assert!(matches!(reqa.activate().await, Err(Error::Timeout)));
    }
}
