//! Mock transceiver for testing and development.
//!
//! In poller mode the mock carries frames to the simulated cards held by its
//! [`MockTransceiverHandle`] and returns their (possibly colliding) answers.
//! In listener mode it plays a card: reader frames are injected through the
//! handle and the local answers come back out of it.

use super::field::{CardId, ExchangeCounters, Fault, Field};
use crate::error::{HardwareError, Result};
use crate::traits::Transceiver;
use crate::types::{RxStatus, TransceiverInfo, TransceiverMode};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tapkit_core::{BitBuffer, ProtocolType};
use tapkit_protocol::CardListener;
use tokio::sync::mpsc;
use tracing::trace;

/// Reader-side stimulus in listener mode.
#[derive(Debug, Clone)]
enum ReaderEvent {
    Frame(BitBuffer),
    FieldOff,
}

#[derive(Debug, Default)]
struct Shared {
    field: Field,
    delay: Duration,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock RF front-end.
///
/// # Examples
///
/// ```
/// use tapkit_core::{BitBuffer, Uid};
/// use tapkit_hardware::mock::MockTransceiver;
/// use tapkit_hardware::traits::Transceiver;
/// use tapkit_protocol::{CardListener, Iso14443_3aData};
///
/// #[tokio::main]
/// async fn main() -> tapkit_hardware::Result<()> {
///     let (mut transceiver, handle) = MockTransceiver::new();
///     let uid = Uid::new(&[0x04, 0xAB, 0xCD, 0xEF])?;
///     handle.add_card(CardListener::iso14443_3a(Iso14443_3aData::new(uid, [0x44, 0x00], 0x00)));
///
///     transceiver.field_on().await?;
///     let mut wupa = BitBuffer::new();
///     wupa.append_bits(0x52, 7)?;
///     transceiver.tx(&wupa).await?;
///
///     let mut atqa = BitBuffer::new();
///     transceiver.rx(&mut atqa).await?;
///     assert_eq!(atqa.bytes()?, &[0x44, 0x00]);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockTransceiver {
    shared: Arc<Mutex<Shared>>,
    reader_rx: mpsc::Receiver<ReaderEvent>,
    response_tx: mpsc::UnboundedSender<BitBuffer>,
    mode: TransceiverMode,
    name: String,
}

impl MockTransceiver {
    /// Create a mock with the default name.
    ///
    /// Returns a tuple of (MockTransceiver, MockTransceiverHandle) where the
    /// handle controls the simulated environment.
    pub fn new() -> (Self, MockTransceiverHandle) {
        Self::with_name("Mock Transceiver")
    }

    /// Create a mock with a custom name.
    pub fn with_name(name: impl Into<String>) -> (Self, MockTransceiverHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (reader_tx, reader_rx) = mpsc::channel(32);
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let transceiver = Self {
            shared: Arc::clone(&shared),
            reader_rx,
            response_tx,
            mode: TransceiverMode::Poller,
            name: name.into(),
        };
        let handle = MockTransceiverHandle {
            shared,
            reader_tx,
            response_rx,
        };
        (transceiver, handle)
    }

    async fn rx_poller(&mut self, frame: &mut BitBuffer) -> Result<RxStatus> {
        let (pending, delay) = {
            let mut shared = lock(&self.shared);
            if !shared.field.field_on {
                return Err(HardwareError::FieldOff);
            }
            (shared.field.pending.take(), shared.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some((response, status)) = pending else {
            // Nobody answered: wait until the caller gives up.
            return std::future::pending().await;
        };
        frame.copy_from(&response)?;

        let mut shared = lock(&self.shared);
        shared.field.counters.rx_frames += 1;
        if status.is_collision() {
            shared.field.counters.collisions += 1;
        }
        trace!(rx = %frame, ?status, "Mock rx");
        Ok(status)
    }

    async fn rx_listener(&mut self, frame: &mut BitBuffer) -> Result<RxStatus> {
        match self.reader_rx.recv().await {
            Some(ReaderEvent::Frame(received)) => {
                frame.copy_from(&received)?;
                lock(&self.shared).field.counters.rx_frames += 1;
                Ok(RxStatus::Complete)
            }
            Some(ReaderEvent::FieldOff) => Err(HardwareError::FieldOff),
            None => Err(HardwareError::disconnected(self.name.clone())),
        }
    }
}

impl Transceiver for MockTransceiver {
    async fn field_on(&mut self) -> Result<()> {
        lock(&self.shared).field.field_on = true;
        Ok(())
    }

    async fn field_off(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.field.field_on = false;
        shared.field.power_down();
        Ok(())
    }

    fn is_field_on(&self) -> bool {
        lock(&self.shared).field.field_on
    }

    async fn set_mode(&mut self, mode: TransceiverMode) -> Result<()> {
        if mode == TransceiverMode::Listener {
            let mut shared = lock(&self.shared);
            shared.field.field_on = false;
            shared.field.power_down();
        }
        self.mode = mode;
        Ok(())
    }

    fn mode(&self) -> TransceiverMode {
        self.mode
    }

    async fn tx(&mut self, frame: &BitBuffer) -> Result<()> {
        trace!(tx = %frame, mode = ?self.mode, "Mock tx");
        match self.mode {
            TransceiverMode::Poller => {
                let mut shared = lock(&self.shared);
                if !shared.field.field_on {
                    return Err(HardwareError::FieldOff);
                }
                shared.field.transmit(frame);
                Ok(())
            }
            TransceiverMode::Listener => {
                lock(&self.shared).field.counters.tx_frames += 1;
                self.response_tx
                    .send(frame.clone())
                    .map_err(|_| HardwareError::disconnected(self.name.clone()))
            }
        }
    }

    async fn rx(&mut self, frame: &mut BitBuffer) -> Result<RxStatus> {
        match self.mode {
            TransceiverMode::Poller => self.rx_poller(frame).await,
            TransceiverMode::Listener => self.rx_listener(frame).await,
        }
    }

    async fn info(&self) -> Result<TransceiverInfo> {
        Ok(TransceiverInfo::new(self.name.clone(), ProtocolType::ALL.to_vec()).with_listener())
    }
}

/// Handle controlling a mock transceiver's environment.
///
/// Card operations take effect immediately, also while the transceiver is
/// leased and in use by a worker task.
#[derive(Debug)]
pub struct MockTransceiverHandle {
    shared: Arc<Mutex<Shared>>,
    reader_tx: mpsc::Sender<ReaderEvent>,
    response_rx: mpsc::UnboundedReceiver<BitBuffer>,
}

impl MockTransceiverHandle {
    /// Place a card in the field.
    pub fn add_card(&self, listener: CardListener) -> CardId {
        lock(&self.shared).field.add_card(listener)
    }

    /// Take a card out of the field. It loses power and keeps its memory.
    pub fn remove_card(&self, id: CardId) {
        if let Some(card) = lock(&self.shared).field.card_mut(id) {
            card.present = false;
            card.listener.field_off();
        }
    }

    /// Put a removed card back.
    pub fn present_card(&self, id: CardId) {
        if let Some(card) = lock(&self.shared).field.card_mut(id) {
            card.present = true;
        }
    }

    /// Forget every card.
    pub fn clear_cards(&self) {
        lock(&self.shared).field.cards.clear();
    }

    /// Number of cards currently in the field.
    pub fn card_count(&self) -> usize {
        lock(&self.shared)
            .field
            .cards
            .iter()
            .filter(|card| card.present)
            .count()
    }

    /// Snapshot of a card's state, including memory written by a reader.
    pub fn card(&self, id: CardId) -> Option<CardListener> {
        lock(&self.shared)
            .field
            .card_mut(id)
            .map(|card| card.listener.clone())
    }

    /// Apply `fault` to every answer until cleared with `None`.
    pub fn set_fault(&self, fault: Option<Fault>) {
        lock(&self.shared).field.fault = fault;
    }

    /// Delay every answer by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.shared).delay = delay;
    }

    pub fn is_field_on(&self) -> bool {
        lock(&self.shared).field.field_on
    }

    pub fn counters(&self) -> ExchangeCounters {
        lock(&self.shared).field.counters
    }

    pub fn reset_counters(&self) {
        lock(&self.shared).field.counters = ExchangeCounters::default();
    }

    /// Listener mode: deliver a reader frame.
    ///
    /// # Errors
    /// Returns `HardwareError::Disconnected` once the transceiver is gone.
    pub async fn send_reader_frame(&self, frame: BitBuffer) -> Result<()> {
        self.reader_tx
            .send(ReaderEvent::Frame(frame))
            .await
            .map_err(|_| HardwareError::disconnected("mock reader channel closed"))
    }

    /// Listener mode: the reader switched its field off.
    pub async fn reader_field_off(&self) -> Result<()> {
        self.reader_tx
            .send(ReaderEvent::FieldOff)
            .await
            .map_err(|_| HardwareError::disconnected("mock reader channel closed"))
    }

    /// Listener mode: next frame the local side transmitted.
    pub async fn recv_response(&mut self) -> Option<BitBuffer> {
        self.response_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapkit_core::Uid;
    use tapkit_protocol::Iso14443_3aData;
    use tapkit_protocol::iso14443_3a::{CascadeLevel, RequestKind, sdd_request, sens_request};

    fn card(uid: &[u8]) -> CardListener {
        CardListener::iso14443_3a(Iso14443_3aData::new(Uid::new(uid).unwrap(), [0x04, 0x00], 0x08))
    }

    #[tokio::test]
    async fn test_tx_requires_field() {
        let (mut transceiver, _handle) = MockTransceiver::new();
        let result = transceiver.tx(&sens_request(RequestKind::Wupa)).await;
        assert!(matches!(result, Err(HardwareError::FieldOff)));
    }

    #[tokio::test]
    async fn test_single_card_answers() {
        let (mut transceiver, handle) = MockTransceiver::new();
        handle.add_card(card(&[0x01, 0x02, 0x03, 0x04]));
        transceiver.field_on().await.unwrap();

        transceiver.tx(&sens_request(RequestKind::Wupa)).await.unwrap();
        let mut rx = BitBuffer::new();
        let status = transceiver.rx(&mut rx).await.unwrap();
        assert_eq!(status, RxStatus::Complete);
        assert_eq!(rx.bytes().unwrap(), &[0x04, 0x00]);
        assert_eq!(handle.counters().tx_frames, 1);
        assert_eq!(handle.counters().rx_frames, 1);
    }

    #[tokio::test]
    async fn test_two_cards_collide_during_anticollision() {
        let (mut transceiver, handle) = MockTransceiver::new();
        handle.add_card(card(&[0x01, 0x02, 0x03, 0x04]));
        handle.add_card(card(&[0x03, 0x02, 0x03, 0x04]));
        transceiver.field_on().await.unwrap();

        let mut rx = BitBuffer::new();
        transceiver.tx(&sens_request(RequestKind::Wupa)).await.unwrap();
        assert_eq!(transceiver.rx(&mut rx).await.unwrap(), RxStatus::Complete);

        let request = sdd_request(CascadeLevel::One, &BitBuffer::new()).unwrap();
        transceiver.tx(&request).await.unwrap();
        let status = transceiver.rx(&mut rx).await.unwrap();
        assert_eq!(status, RxStatus::Collision { first_bit: 1 });
        assert_eq!(handle.counters().collisions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_never_completes() {
        let (mut transceiver, handle) = MockTransceiver::new();
        handle.add_card(card(&[0x01, 0x02, 0x03, 0x04]));
        handle.set_fault(Some(Fault::Mute));
        transceiver.field_on().await.unwrap();
        transceiver.tx(&sens_request(RequestKind::Wupa)).await.unwrap();

        let mut rx = BitBuffer::new();
        let result =
            tokio::time::timeout(Duration::from_millis(5), transceiver.rx(&mut rx)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_removed_card_is_silent() {
        let (mut transceiver, handle) = MockTransceiver::new();
        let id = handle.add_card(card(&[0x01, 0x02, 0x03, 0x04]));
        handle.remove_card(id);
        assert_eq!(handle.card_count(), 0);

        transceiver.field_on().await.unwrap();
        transceiver.tx(&sens_request(RequestKind::Wupa)).await.unwrap();
        let mut rx = BitBuffer::new();
        let result =
            tokio::time::timeout(Duration::from_millis(5), transceiver.rx(&mut rx)).await;
        assert!(result.is_err());

        handle.present_card(id);
        transceiver.tx(&sens_request(RequestKind::Wupa)).await.unwrap();
        assert!(transceiver.rx(&mut rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_listener_mode_round_trip() {
        let (mut transceiver, mut handle) = MockTransceiver::new();
        transceiver.set_mode(TransceiverMode::Listener).await.unwrap();

        handle
            .send_reader_frame(sens_request(RequestKind::Reqa))
            .await
            .unwrap();
        let mut rx = BitBuffer::new();
        transceiver.rx(&mut rx).await.unwrap();
        assert_eq!(rx.size_bits(), 7);

        transceiver
            .tx(&BitBuffer::from_bytes(&[0x04, 0x00]))
            .await
            .unwrap();
        let response = handle.recv_response().await.unwrap();
        assert_eq!(response.bytes().unwrap(), &[0x04, 0x00]);

        handle.reader_field_off().await.unwrap();
        assert!(matches!(
            transceiver.rx(&mut rx).await,
            Err(HardwareError::FieldOff)
        ));
    }
}
