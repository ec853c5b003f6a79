mod common;

use common::*;
use tapkit_core::Uid;
use tapkit_protocol::iso14443_3a::sens_request;
use tapkit_protocol::mf_classic::is_trailer;
use tapkit_protocol::{
    CardListener, Iso14443_3aData, MfClassicKey, MfClassicType, ProtocolData, RequestKind,
};
use tapkit_worker::{NfcDevice, WorkerEvent, WorkerMode};

#[tokio::test(start_paused = true)]
async fn test_write_dump_onto_blank_card() {
    let blank = mf_classic_dump(MfClassicType::Mini, |_| MfClassicKey::DEFAULT);
    let mut source = blank.clone();
    for block in 1..20u8 {
        if !is_trailer(block) {
            source.set_block_read(block, &[0x5C; 16]).unwrap();
        }
    }

    let (mut worker, handle) = worker();
    let card = handle.add_card(CardListener::mf_classic(blank.clone()));
    let mut events = worker.start(WorkerMode::Write, NfcDevice::from_data(source.clone()));
    let seen = until_terminal(&mut events).await;

    let written: Vec<u8> = seen
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::BlockWritten { block } => Some(*block),
            _ => None,
        })
        .collect();
    assert_eq!(written.len(), 14);
    assert!(!written.contains(&0));
    assert_eq!(seen.last(), Some(&WorkerEvent::Success { partial: false }));

    let device = worker.stop().await.unwrap();
    assert_eq!(device.data(), Some(&ProtocolData::from(source)));
    let on_card = handle.card(card).unwrap();
    let on_card = on_card.mf_classic_data().unwrap();
    assert_eq!(on_card.block(2), Some(&[0x5C; 16]));
    assert_eq!(on_card.block(0), blank.block(0));
}

#[tokio::test(start_paused = true)]
async fn test_write_rejects_other_cards() {
    let (mut worker, handle) = worker();
    let plain = handle.add_card(plain_card(&OTHER_UID));
    let source = mf_classic_dump(MfClassicType::Mini, |_| MfClassicKey::DEFAULT);
    let mut events = worker.start(WorkerMode::Write, NfcDevice::from_data(source));

    let wrong = wait_for(&mut events, |event| {
        matches!(event, WorkerEvent::WrongCardDetected { .. })
    })
    .await;
    assert_eq!(
        wrong,
        WorkerEvent::WrongCardDetected {
            expected: "Mifare Classic".to_string(),
            found: "ISO14443-3A".to_string(),
        }
    );

    // A Mifare Classic of another size is still the wrong card.
    handle.remove_card(plain);
    handle.add_card(CardListener::mf_classic(mf_classic_dump(
        MfClassicType::Classic1k,
        |_| MfClassicKey::DEFAULT,
    )));
    let wrong = wait_for(&mut events, |event| {
        matches!(event, WorkerEvent::WrongCardDetected { .. })
    })
    .await;
    assert_eq!(
        wrong,
        WorkerEvent::WrongCardDetected {
            expected: "Mifare Classic MINI".to_string(),
            found: "Mifare Classic 1K".to_string(),
        }
    );
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_returning_card_is_detected_again() {
    let (mut worker, handle) = worker();
    let plain = handle.add_card(plain_card(&OTHER_UID));
    let source = mf_classic_dump(MfClassicType::Mini, |_| MfClassicKey::DEFAULT);
    let mut events = worker.start(WorkerMode::Write, NfcDevice::from_data(source));

    wait_for(&mut events, |event| {
        matches!(event, WorkerEvent::CardDetected { .. })
    })
    .await;
    handle.remove_card(plain);
    wait_for(&mut events, |event| *event == WorkerEvent::NoCardDetected).await;

    handle.present_card(plain);
    wait_for(&mut events, |event| {
        matches!(event, WorkerEvent::CardDetected { .. })
    })
    .await;
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_needs_a_dump() {
    let (mut worker, _handle) = worker();
    let mut events = worker.start(WorkerMode::Write, NfcDevice::new());
    assert!(matches!(events.recv().await, Some(WorkerEvent::Fail { .. })));
    assert!(worker.stop().await.unwrap().data().is_none());
}

#[tokio::test]
async fn test_emulate_answers_reader() {
    let identity = Iso14443_3aData::new(Uid::new(&UID).unwrap(), [0x44, 0x00], 0x00);
    let (mut worker, mut handle) = worker();
    let mut events = worker.start(WorkerMode::Emulate, NfcDevice::from_data(identity.clone()));

    handle.send_reader_frame(sens_request(RequestKind::Wupa)).await.unwrap();
    let atqa = handle.recv_response().await.unwrap();
    assert_eq!(atqa.bytes().unwrap(), &[0x44, 0x00]);
    assert_eq!(events.recv().await, Some(WorkerEvent::ReaderActivity));

    // Activity is reported once per reader field.
    handle.reader_field_off().await.unwrap();
    handle.send_reader_frame(sens_request(RequestKind::Reqa)).await.unwrap();
    handle.recv_response().await.unwrap();
    assert_eq!(events.recv().await, Some(WorkerEvent::ReaderActivity));

    let device = worker.stop().await.unwrap();
    assert_eq!(device.data(), Some(&ProtocolData::from(identity)));
    assert_eq!(events.recv().await, Some(WorkerEvent::Aborted));
    assert_eq!(events.recv().await, None);
}
