//! Events reported by a running worker.
//!
//! The worker task is the producer of a bounded channel and the application
//! consumes it through a [`WorkerEventReceiver`]. Progress events are best
//! effort: when the consumer falls behind they are dropped rather than
//! slowing down the RF exchanges. Terminal events are always delivered.

use std::fmt;
use tapkit_core::{ProtocolType, Uid};
use tapkit_poller::MfClassicEvent;
use tapkit_protocol::KeyType;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Something the worker wants the application to know.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkerEvent {
    /// A card was activated. Sent once per card.
    CardDetected { protocol: ProtocolType, uid: Uid },

    /// A polling cycle found no card.
    NoCardDetected,

    /// A card answered but is not what the mode needs.
    WrongCardDetected { expected: String, found: String },

    /// Blocks of the card read so far.
    ReadProgress { blocks_read: usize, blocks_total: usize },

    /// A sector key was found.
    KeyFound { sector: u8, key_type: KeyType },

    /// A block was written to the card.
    BlockWritten { block: u8 },

    /// A reader started talking to the emulated card.
    ReaderActivity,

    /// The mode finished. `partial` is set when some of the card could not
    /// be read or written.
    Success { partial: bool },

    /// The card was there but the operation failed.
    Fail { reason: String },

    /// The worker was stopped before the mode finished.
    Aborted,
}

impl WorkerEvent {
    /// Whether the event ends the mode.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Fail { .. } | Self::Aborted)
    }
}

impl From<MfClassicEvent> for WorkerEvent {
    fn from(event: MfClassicEvent) -> Self {
        match event {
            MfClassicEvent::KeyFound { sector, key_type } => Self::KeyFound { sector, key_type },
            MfClassicEvent::BlockRead {
                blocks_read,
                blocks_total,
            } => Self::ReadProgress {
                blocks_read,
                blocks_total,
            },
            MfClassicEvent::BlockWritten { block } => Self::BlockWritten { block },
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardDetected { protocol, uid } => write!(f, "{protocol} card {uid} detected"),
            Self::NoCardDetected => write!(f, "No card"),
            Self::WrongCardDetected { expected, found } => {
                write!(f, "Wrong card: expected {expected}, found {found}")
            }
            Self::ReadProgress {
                blocks_read,
                blocks_total,
            } => write!(f, "Read {blocks_read}/{blocks_total} blocks"),
            Self::KeyFound { sector, key_type } => {
                write!(f, "Found key {key_type:?} for sector {sector}")
            }
            Self::BlockWritten { block } => write!(f, "Wrote block {block}"),
            Self::ReaderActivity => write!(f, "Reader activity"),
            Self::Success { partial: false } => write!(f, "Success"),
            Self::Success { partial: true } => write!(f, "Success (partial)"),
            Self::Fail { reason } => write!(f, "Failed: {reason}"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Producer side, owned by the worker task.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<WorkerEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queue `event` if there is room.
    pub(crate) fn emit(&self, event: WorkerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => trace!(%event, "Event queue full, event dropped"),
            Err(TrySendError::Closed(_)) => trace!("Event receiver gone"),
        }
    }

    /// Wait for room and queue `event`. Gives up when the worker is stopped
    /// so that a consumer calling `stop` is never waited on.
    pub(crate) async fn deliver(&self, event: WorkerEvent) {
        tokio::select! {
            result = self.tx.send(event) => {
                if result.is_err() {
                    trace!("Event receiver gone");
                }
            }
            () = self.cancel.cancelled() => trace!("Worker stopped, event not delivered"),
        }
    }
}

/// Consumer side of the worker's events.
///
/// # Examples
///
/// ```no_run
/// use tapkit_worker::{WorkerEvent, WorkerEventReceiver};
///
/// # async fn example(mut events: WorkerEventReceiver) {
/// // Callback shape: return `false` to stop listening.
/// let handled = events
///     .dispatch(|event| {
///         println!("{event}");
///         !event.is_terminal()
///     })
///     .await;
/// println!("{handled} events");
/// # }
/// ```
#[derive(Debug)]
pub struct WorkerEventReceiver {
    rx: mpsc::Receiver<WorkerEvent>,
}

impl WorkerEventReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<WorkerEvent>) -> Self {
        Self { rx }
    }

    /// Next event. `None` once the worker task has ended and every queued
    /// event was received.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.rx.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<WorkerEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Hand events to `callback` until it returns `false` or the worker
    /// task ends. Returns how many events were handed over.
    pub async fn dispatch<F>(&mut self, mut callback: F) -> usize
    where
        F: FnMut(WorkerEvent) -> bool,
    {
        let mut count = 0;
        while let Some(event) = self.rx.recv().await {
            count += 1;
            if !callback(event) {
                break;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> (EventSender, WorkerEventReceiver, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (
            EventSender::new(tx, cancel.clone()),
            WorkerEventReceiver::new(rx),
            cancel,
        )
    }

    #[test]
    fn test_progress_is_dropped_when_full() {
        let (sender, mut events, _cancel) = channel(1);
        sender.emit(WorkerEvent::NoCardDetected);
        sender.emit(WorkerEvent::ReaderActivity);

        assert_eq!(events.try_recv(), Some(WorkerEvent::NoCardDetected));
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_on_stop() {
        let (sender, mut events, cancel) = channel(1);
        sender.emit(WorkerEvent::NoCardDetected);
        cancel.cancel();

        // Queue is full and nobody reads; this must not hang.
        sender.deliver(WorkerEvent::Aborted).await;
        assert_eq!(events.recv().await, Some(WorkerEvent::NoCardDetected));
    }

    #[tokio::test]
    async fn test_dispatch_stops_at_callback_request() {
        let (sender, mut events, _cancel) = channel(8);
        sender.emit(WorkerEvent::NoCardDetected);
        sender.deliver(WorkerEvent::Success { partial: false }).await;
        sender.emit(WorkerEvent::NoCardDetected);

        let mut seen = Vec::new();
        let count = events
            .dispatch(|event| {
                let more = !event.is_terminal();
                seen.push(event);
                more
            })
            .await;
        assert_eq!(count, 2);
        assert_eq!(seen.last(), Some(&WorkerEvent::Success { partial: false }));

        drop(sender);
        assert_eq!(events.dispatch(|_| true).await, 1);
    }

    #[test]
    fn test_mf_classic_events_map() {
        let event = WorkerEvent::from(MfClassicEvent::BlockRead {
            blocks_read: 4,
            blocks_total: 64,
        });
        assert_eq!(event.to_string(), "Read 4/64 blocks");
        assert!(!event.is_terminal());
    }
}
