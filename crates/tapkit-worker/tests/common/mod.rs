//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::time::Duration;
use tapkit_core::Uid;
use tapkit_hardware::mock::{MockTransceiver, MockTransceiverHandle};
use tapkit_hardware::{AnyTransceiver, HardwareContext};
use tapkit_protocol::mf_classic::access::DEFAULT_ACCESS_BITS;
use tapkit_protocol::mf_classic::{blocks_in_sector, first_block, trailer_of};
use tapkit_protocol::{CardListener, Iso14443_3aData, KeyType, MfClassicData, MfClassicKey, MfClassicType};
use tapkit_worker::{Worker, WorkerConfig, WorkerEvent, WorkerEventReceiver};

pub const UID: [u8; 4] = [0xDE, 0xAD, 0x10, 0x01];
pub const OTHER_UID: [u8; 4] = [0x5A, 0x5A, 0x20, 0x02];
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Key found in no dictionary the tests use.
pub const SECRET_KEY: MfClassicKey = MfClassicKey::new([0x0B, 0xAD, 0xC0, 0xFF, 0xEE, 0x00]);

pub fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(POLL_INTERVAL)
        .with_event_queue_capacity(256)
}

pub fn context() -> (HardwareContext<AnyTransceiver>, MockTransceiverHandle) {
    let (transceiver, handle) = MockTransceiver::new();
    (HardwareContext::new(AnyTransceiver::from(transceiver)), handle)
}

pub fn worker() -> (Worker, MockTransceiverHandle) {
    let (context, handle) = context();
    (Worker::new(context, config()), handle)
}

pub fn plain_card(uid: &[u8]) -> CardListener {
    CardListener::iso14443_3a(Iso14443_3aData::new(Uid::new(uid).unwrap(), [0x44, 0x00], 0x00))
}

/// Mifare Classic dump where every block holds its own number and each
/// sector's keys come from `key_of(sector)`.
pub fn mf_classic_dump(card_type: MfClassicType, key_of: impl Fn(u8) -> MfClassicKey) -> MfClassicData {
    let (atqa, sak) = match card_type {
        MfClassicType::Mini => ([0x04, 0x00], 0x09),
        MfClassicType::Classic1k => ([0x04, 0x00], 0x08),
        MfClassicType::Classic4k => ([0x02, 0x00], 0x18),
    };
    let base = Iso14443_3aData::new(Uid::new(&UID).unwrap(), atqa, sak);
    let mut data = MfClassicData::new(base, card_type);
    for sector in 0..card_type.sectors_total() {
        let first = first_block(sector);
        for block in first..first + blocks_in_sector(sector) {
            data.set_block_read(block, &[block; 16]).unwrap();
        }
        let mut trailer = [0u8; 16];
        trailer[6..10].copy_from_slice(&DEFAULT_ACCESS_BITS);
        data.set_block_read(trailer_of(sector), &trailer).unwrap();
        data.set_key_found(sector, KeyType::A, key_of(sector)).unwrap();
        data.set_key_found(sector, KeyType::B, key_of(sector)).unwrap();
    }
    data
}

/// Receive events up to and including the first terminal one.
pub async fn until_terminal(events: &mut WorkerEventReceiver) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    events
        .dispatch(|event| {
            let more = !event.is_terminal();
            seen.push(event);
            more
        })
        .await;
    seen
}

/// Receive events until `matches` accepts one. Panics if the worker ends
/// first.
pub async fn wait_for(
    events: &mut WorkerEventReceiver,
    matches: impl Fn(&WorkerEvent) -> bool,
) -> WorkerEvent {
    loop {
        match events.recv().await {
            Some(event) if matches(&event) => return event,
            Some(_) => {}
            None => panic!("worker ended before the expected event"),
        }
    }
}
