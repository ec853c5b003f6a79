//! The worker: one background task driving the transceiver in a mode.
//!
//! # Architecture
//!
//! ```text
//!              start(mode, device)
//!  Application ───────────────────►  Worker ── spawn ──►  task (owns lease)
//!       ▲                              │                       │
//!       │        WorkerEventReceiver   │ CancellationToken     │ polling loop
//!       └──────────────────────────────┼───────────────────────┘
//!                                      │
//!              stop() ──► cancel, join, field off, release lease
//! ```
//!
//! The task owns the [`TransceiverLease`] and the [`NfcDevice`] while it
//! runs and gives both back when it is joined. Cancellation is cooperative:
//! the loop checks it between exchanges, so an exchange in flight finishes
//! or times out first.

use crate::config::WorkerConfig;
use crate::device::NfcDevice;
use crate::event::{EventSender, WorkerEvent, WorkerEventReceiver};
use crate::state::{WorkerMode, WorkerState};
use tapkit_core::{BitBuffer, Error, ProtocolType, Uid};
use tapkit_hardware::{
    AnyTransceiver, HardwareContext, HardwareError, Transceiver, TransceiverLease,
    TransceiverMode,
};
use tapkit_poller::{
    CardReader, Iso14443_3aPoller, MfClassicEvent, MfClassicPoller, ProtocolRegistry, ReadRequest,
};
use tapkit_protocol::{CardListener, Iso14443_3aData, ProtocolData};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type Lease = TransceiverLease<AnyTransceiver>;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<(NfcDevice, Lease)>,
}

/// Runs one mode at a time against the shared transceiver.
///
/// # Examples
///
/// ```no_run
/// use tapkit_hardware::{AnyTransceiver, HardwareContext};
/// use tapkit_hardware::mock::MockTransceiver;
/// use tapkit_worker::{NfcDevice, Worker, WorkerConfig, WorkerMode};
///
/// #[tokio::main]
/// async fn main() {
///     let (transceiver, _handle) = MockTransceiver::new();
///     let context = HardwareContext::new(AnyTransceiver::from(transceiver));
///     let mut worker = Worker::new(context, WorkerConfig::default());
///
///     let mut events = worker.start(WorkerMode::Read { expected: None }, NfcDevice::new());
///     while let Some(event) = events.recv().await {
///         if event.is_terminal() {
///             break;
///         }
///     }
///     let device = worker.stop().await;
///     println!("{:?}", device.and_then(|mut device| device.take_data()));
/// }
/// ```
pub struct Worker {
    context: HardwareContext<AnyTransceiver>,
    config: WorkerConfig,
    registry: ProtocolRegistry,
    state: watch::Sender<WorkerState>,
    running: Option<Running>,
}

impl Worker {
    pub fn new(context: HardwareContext<AnyTransceiver>, config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(WorkerState::None);
        Self {
            context,
            config,
            registry: ProtocolRegistry::default(),
            state,
            running: None,
        }
    }

    /// Use `registry` to detect and read card families.
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Whether a mode was started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether the started mode has ended on its own. The worker still
    /// holds the transceiver until [`stop`](Self::stop).
    pub fn is_finished(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.task.is_finished())
    }

    /// Start `mode` on a background task and return its events.
    ///
    /// # Panics
    ///
    /// Panics if the worker is already running, if another owner holds the
    /// transceiver, or when called outside a tokio runtime. These are
    /// caller bugs, not runtime conditions.
    pub fn start(&mut self, mode: WorkerMode, device: NfcDevice) -> WorkerEventReceiver {
        assert!(self.running.is_none(), "Worker already running");
        let lease = match self.context.try_acquire() {
            Ok(lease) => lease,
            Err(error) => panic!("Worker cannot take the transceiver: {error}"),
        };
        self.set_state(WorkerState::Ready);

        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let job = Job {
            config: self.config.clone(),
            registry: self.registry.clone(),
            events: EventSender::new(tx, cancel.clone()),
            cancel: cancel.clone(),
        };

        self.set_state(mode.state());
        info!(?mode, "Worker started");
        let task = tokio::spawn(job.run(mode, device, lease));
        self.running = Some(Running { cancel, task });
        WorkerEventReceiver::new(rx)
    }

    /// Stop the running mode, wait for its task, switch the field off and
    /// release the transceiver. Returns the device record with whatever was
    /// read; `None` if the worker was not running.
    pub async fn stop(&mut self) -> Option<NfcDevice> {
        let running = self.running.take()?;
        self.set_state(WorkerState::Stop);
        running.cancel.cancel();

        let device = match running.task.await {
            Ok((device, mut lease)) => {
                release_field(&mut lease).await;
                lease.release();
                Some(device)
            }
            Err(join_error) => {
                error!(error = %join_error, "Worker task ended abnormally");
                // The lease went back to the context while unwinding.
                if let Ok(mut lease) = self.context.try_acquire() {
                    release_field(&mut lease).await;
                }
                None
            }
        };

        self.set_state(WorkerState::None);
        info!("Worker stopped");
        device
    }

    fn set_state(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "Unexpected worker state change");
        }
        debug!(from = %previous, to = %next, "Worker state");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn release_field(transceiver: &mut AnyTransceiver) {
    if transceiver.mode() == TransceiverMode::Listener
        && let Err(error) = transceiver.set_mode(TransceiverMode::Poller).await
    {
        warn!(%error, "Cannot leave listener mode");
    }
    if let Err(error) = transceiver.field_off().await {
        warn!(%error, "Cannot switch the field off");
    }
}

/// How a mode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// A terminal event was delivered.
    Finished,
    /// The worker was stopped first.
    Stopped,
}

/// Everything the task needs besides the hardware and the device.
struct Job {
    config: WorkerConfig,
    registry: ProtocolRegistry,
    events: EventSender,
    cancel: CancellationToken,
}

impl Job {
    async fn run(self, mode: WorkerMode, mut device: NfcDevice, mut lease: Lease) -> (NfcDevice, Lease) {
        let outcome = match mode {
            WorkerMode::Detect => self.detect(&mut lease).await,
            WorkerMode::Read { expected } => self.read(&mut lease, expected, &mut device).await,
            WorkerMode::Write => self.write(&mut lease, &device).await,
            WorkerMode::Emulate => self.emulate(&mut lease, &mut device).await,
        };
        match outcome {
            Outcome::Finished => debug!(?mode, "Worker mode finished"),
            Outcome::Stopped => {
                debug!(?mode, "Worker mode stopped");
                self.events.emit(WorkerEvent::Aborted);
            }
        }
        (device, lease)
    }

    /// Wait one poll interval. `false` when stopped meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.config.poll_interval()) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    fn poller<'a>(&self, transceiver: &'a mut AnyTransceiver) -> Iso14443_3aPoller<&'a mut AnyTransceiver> {
        Iso14443_3aPoller::new(transceiver, self.config.poller.clone())
    }

    fn card_detected(&self, data: &Iso14443_3aData, last: &mut Option<Uid>) -> ProtocolType {
        let protocol = self.registry.resolve(data);
        if last.as_ref() != Some(&data.uid) {
            info!(uid = %data.uid, %protocol, "Card detected");
            self.events.emit(WorkerEvent::CardDetected {
                protocol,
                uid: data.uid.clone(),
            });
            *last = Some(data.uid.clone());
        }
        protocol
    }

    fn wrong_card(&self, uid: &Uid, expected: String, found: String, last: &mut Option<Uid>) {
        if last.as_ref() != Some(uid) {
            info!(%uid, %expected, %found, "Wrong card");
            self.events
                .emit(WorkerEvent::WrongCardDetected { expected, found });
            *last = Some(uid.clone());
        }
    }

    fn read_attempts(&self) -> u32 {
        self.config.read_attempts.max(1)
    }

    async fn detect(&self, transceiver: &mut AnyTransceiver) -> Outcome {
        let mut poller = self.poller(transceiver);
        let mut present = None;

        while !self.cancel.is_cancelled() {
            poller.reset_session();
            match poller.activate().await {
                Ok(data) => {
                    self.card_detected(&data, &mut present);
                    poller.halt().await;
                }
                Err(error) if error.is_transport() => {
                    present = None;
                    self.events.emit(WorkerEvent::NoCardDetected);
                }
                Err(error) => debug!(%error, "Activation failed"),
            }
            if !self.pause().await {
                break;
            }
        }
        Outcome::Stopped
    }

    /// Read one card. A read that fails part way keeps what it got, locks
    /// the session to that card and continues from there on the next
    /// attempt.
    async fn read(
        &self,
        transceiver: &mut AnyTransceiver,
        expected: Option<ProtocolType>,
        device: &mut NfcDevice,
    ) -> Outcome {
        let mut dictionary = match self.config.mf_classic.dictionary().await {
            Ok(dictionary) => dictionary,
            Err(error) => {
                self.events
                    .deliver(WorkerEvent::Fail {
                        reason: format!("Cannot load key dictionary: {error}"),
                    })
                    .await;
                return Outcome::Finished;
            }
        };

        let mut poller = self.poller(transceiver);
        let mut partial: Option<ProtocolData> = None;
        let mut detected = None;
        let mut wrong = None;
        let mut failures = 0;

        while !self.cancel.is_cancelled() {
            if partial.is_none() {
                poller.reset_session();
            }
            let data = match poller.activate().await {
                Ok(data) => data,
                Err(error) => {
                    if error.is_transport() {
                        detected = None;
                        wrong = None;
                        self.events.emit(WorkerEvent::NoCardDetected);
                    } else {
                        debug!(%error, "Activation failed");
                    }
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            let protocol = self.registry.resolve(&data);
            if let Some(expected) = expected
                && !protocol.is_kind_of(expected)
            {
                self.wrong_card(&data.uid, expected.to_string(), protocol.to_string(), &mut wrong);
                poller.halt().await;
                if !self.pause().await {
                    break;
                }
                continue;
            }
            self.card_detected(&data, &mut detected);

            let mut reader = self.registry.reader(protocol, poller);
            if let Some(previous) = &partial {
                reader.resume(previous);
            }
            let mut on_event = |event: MfClassicEvent| self.events.emit(event.into());
            let mut request = ReadRequest {
                dictionary: &mut dictionary,
                cancel: &self.cancel,
                on_event: &mut on_event,
            };
            let result = reader.read(&mut request).await;
            let snapshot = reader.partial_data();
            poller = reader.into_iso14443_3a();

            match result {
                Ok(data) => {
                    let incomplete = !data.is_complete();
                    info!(uid = %data.uid(), protocol = %data.protocol(), partial = incomplete, "Card read");
                    device.set_data(data);
                    self.events
                        .deliver(WorkerEvent::Success { partial: incomplete })
                        .await;
                    return Outcome::Finished;
                }
                Err(Error::Cancelled) => {
                    partial = snapshot.or(partial);
                    break;
                }
                Err(error) if error.is_transport() => {
                    debug!(%error, "Card lost during read");
                    partial = snapshot.or(partial);
                }
                Err(error) => {
                    partial = snapshot.or(partial);
                    failures += 1;
                    warn!(%error, failures, "Read failed");
                    if failures >= self.read_attempts() {
                        if let Some(data) = partial.take() {
                            device.set_data(data);
                        }
                        self.events
                            .deliver(WorkerEvent::Fail {
                                reason: error.to_string(),
                            })
                            .await;
                        return Outcome::Finished;
                    }
                }
            }
            if !self.pause().await {
                break;
            }
        }

        if let Some(data) = partial {
            device.set_data(data);
        }
        Outcome::Stopped
    }

    async fn write(&self, transceiver: &mut AnyTransceiver, device: &NfcDevice) -> Outcome {
        let Some(ProtocolData::MfClassic(source)) = device.data() else {
            self.events
                .deliver(WorkerEvent::Fail {
                    reason: "Device holds no Mifare Classic dump".to_string(),
                })
                .await;
            return Outcome::Finished;
        };

        let mut poller = self.poller(transceiver);
        let mut detected = None;
        let mut wrong = None;
        let mut failures = 0;

        while !self.cancel.is_cancelled() {
            poller.reset_session();
            match poller.activate().await {
                Ok(data) => {
                    let protocol = self.card_detected(&data, &mut detected);
                    if protocol == ProtocolType::MfClassic {
                        let mut writer = MfClassicPoller::new(poller);
                        let result = writer
                            .write(source, &self.cancel, |event| self.events.emit(event.into()))
                            .await;
                        poller = writer.into_iso14443_3a();

                        match result {
                            Ok(summary) => {
                                self.events
                                    .deliver(WorkerEvent::Success {
                                        partial: summary.blocks_skipped > 0,
                                    })
                                    .await;
                                return Outcome::Finished;
                            }
                            Err(Error::Cancelled) => break,
                            Err(Error::WrongCard { expected, found }) => {
                                self.wrong_card(&data.uid, expected, found, &mut wrong);
                            }
                            Err(error) if error.is_transport() => {
                                debug!(%error, "Card lost during write");
                            }
                            Err(error) => {
                                failures += 1;
                                warn!(%error, failures, "Write failed");
                                if failures >= self.read_attempts() {
                                    self.events
                                        .deliver(WorkerEvent::Fail {
                                            reason: error.to_string(),
                                        })
                                        .await;
                                    return Outcome::Finished;
                                }
                            }
                        }
                    } else {
                        self.wrong_card(
                            &data.uid,
                            ProtocolType::MfClassic.to_string(),
                            protocol.to_string(),
                            &mut wrong,
                        );
                        poller.halt().await;
                    }
                }
                Err(error) if error.is_transport() => {
                    detected = None;
                    wrong = None;
                    self.events.emit(WorkerEvent::NoCardDetected);
                }
                Err(error) => debug!(%error, "Activation failed"),
            }
            if !self.pause().await {
                break;
            }
        }
        Outcome::Stopped
    }

    /// Answer reader frames as the device's card until stopped. Writes a
    /// reader makes to an emulated Mifare Classic end up in the device.
    async fn emulate(&self, transceiver: &mut AnyTransceiver, device: &mut NfcDevice) -> Outcome {
        let mut listener = match device.data() {
            Some(ProtocolData::Iso14443_3a(data)) => CardListener::iso14443_3a(data.clone()),
            Some(ProtocolData::Iso14443_4a(data)) => CardListener::iso14443_4a(data.clone()),
            Some(ProtocolData::MfClassic(data)) => CardListener::mf_classic(data.clone()),
            None => {
                self.events
                    .deliver(WorkerEvent::Fail {
                        reason: "Device has no data to emulate".to_string(),
                    })
                    .await;
                return Outcome::Finished;
            }
        };
        if let Err(error) = transceiver.set_mode(TransceiverMode::Listener).await {
            self.events
                .deliver(WorkerEvent::Fail {
                    reason: error.to_string(),
                })
                .await;
            return Outcome::Finished;
        }
        info!(uid = %listener.uid(), "Emulating card");

        let mut frame = BitBuffer::new();
        let mut reader_present = false;
        let outcome = loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => None,
                result = transceiver.rx(&mut frame) => Some(result),
            };
            let Some(result) = received else {
                break Outcome::Stopped;
            };

            match result {
                Ok(_) => {
                    if !reader_present {
                        reader_present = true;
                        debug!("Reader field on");
                        if self.config.listener.notify_reader_activity {
                            self.events.emit(WorkerEvent::ReaderActivity);
                        }
                    }
                    match listener.process(&frame) {
                        Ok(Some(answer)) => {
                            if let Err(error) = transceiver.tx(&answer).await {
                                warn!(%error, "Answer not sent");
                            }
                        }
                        Ok(None) => {}
                        Err(error) => trace!(%error, rx = %frame, "Reader frame ignored"),
                    }
                }
                Err(HardwareError::FieldOff) => {
                    debug!("Reader field off");
                    reader_present = false;
                    listener.field_off();
                }
                Err(error) => {
                    self.events
                        .deliver(WorkerEvent::Fail {
                            reason: error.to_string(),
                        })
                        .await;
                    break Outcome::Finished;
                }
            }
        };

        if let Some(dump) = listener.mf_classic_data() {
            device.update_data(dump.clone().into());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapkit_hardware::mock::{MockTransceiver, MockTransceiverHandle};
    use std::time::Duration;
    use tapkit_protocol::Iso14443_4aData;

    fn worker() -> (Worker, MockTransceiverHandle) {
        let (transceiver, handle) = MockTransceiver::new();
        let context = HardwareContext::new(AnyTransceiver::from(transceiver));
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
        (Worker::new(context, config), handle)
    }

    fn iso14443_4a_card() -> CardListener {
        CardListener::iso14443_4a(Iso14443_4aData {
            iso14443_3a: Iso14443_3aData::new(
                Uid::new(&[0x04, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60]).unwrap(),
                [0x44, 0x03],
                0x20,
            ),
            ats: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_follows_lifecycle() {
        let (mut worker, _handle) = worker();
        let mut states = worker.subscribe();
        assert_eq!(worker.state(), WorkerState::None);
        assert!(worker.stop().await.is_none());

        let _events = worker.start(WorkerMode::Detect, NfcDevice::new());
        assert_eq!(worker.state(), WorkerState::Detect);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), WorkerState::Detect);

        assert!(worker.stop().await.is_some());
        assert_eq!(worker.state(), WorkerState::None);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_plain_card() {
        let (mut worker, handle) = worker();
        handle.add_card(iso14443_4a_card());

        let mut events = worker.start(WorkerMode::Read { expected: None }, NfcDevice::new());
        let mut seen = Vec::new();
        events
            .dispatch(|event| {
                let more = !event.is_terminal();
                seen.push(event);
                more
            })
            .await;
        assert!(matches!(
            seen.first(),
            Some(WorkerEvent::CardDetected {
                protocol: ProtocolType::Iso14443_4a,
                ..
            })
        ));
        assert_eq!(seen.last(), Some(&WorkerEvent::Success { partial: false }));
        assert!(worker.is_finished());

        let mut device = worker.stop().await.unwrap();
        assert!(device.read_at().is_some());
        let data = device.take_data().unwrap();
        assert_eq!(data.protocol(), ProtocolType::Iso14443_4a);
        assert!(!handle.is_field_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emulate_without_data_fails() {
        let (mut worker, _handle) = worker();
        let mut events = worker.start(WorkerMode::Emulate, NfcDevice::new());
        assert!(matches!(events.recv().await, Some(WorkerEvent::Fail { .. })));
        worker.stop().await;
    }
}
