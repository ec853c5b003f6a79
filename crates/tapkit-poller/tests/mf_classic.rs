mod common;

use common::*;
use tapkit_core::Error;
use tapkit_poller::{MfClassicEvent, MfClassicPoller, WriteSummary};
use tapkit_protocol::mf_classic::is_trailer;
use tapkit_protocol::{CardListener, KeyType, MfClassicData, MfClassicDict, MfClassicKey, MfClassicType};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_locked_sector_gives_partial_dump() {
    let dump = mf_classic_dump(MfClassicType::Mini, |sector| {
        if sector == 3 { SECRET_KEY } else { MfClassicKey::DEFAULT }
    });
    let (poller, handle) = poller();
    handle.add_card(CardListener::mf_classic(dump));
    let mut poller = MfClassicPoller::new(poller);

    let mut progress = Vec::new();
    let data = poller
        .read(&mut MfClassicDict::builtin(), &CancellationToken::new(), |event| {
            if let MfClassicEvent::BlockRead { blocks_read, .. } = event {
                progress.push(blocks_read);
            }
        })
        .await
        .unwrap();

    assert_eq!(data.blocks_total(), 20);
    assert_eq!(data.blocks_read(), 16);
    assert!(!data.is_sector_read(3));
    assert_eq!(data.key(3, KeyType::A), None);
    assert_eq!(data.keys_found(), 8);
    assert_eq!(data.block(13), None);
    assert_eq!(data.block(17), Some(&[17; 16]));

    assert!(progress.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(progress.last(), Some(&16));
}

#[tokio::test(start_paused = true)]
async fn test_known_keys_are_tried_before_the_dictionary() {
    let dump = mf_classic_dump(MfClassicType::Mini, |_| SECRET_KEY);
    let (poller, handle) = poller();
    handle.add_card(CardListener::mf_classic(dump));
    let mut poller = MfClassicPoller::new(poller);

    poller.activate().await.unwrap();
    let mut dictionary = MfClassicDict::new();
    dictionary.add_key(SECRET_KEY);
    let first = poller
        .read(&mut dictionary, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert!(first.is_fully_read());

    // Keys found by the first read carry over; the dictionary is empty.
    let tx_before = handle.counters().tx_frames;
    let second = poller
        .read(&mut MfClassicDict::new(), &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(second, first);
    // Nothing left to read: one wake-up and the final halt.
    assert!(handle.counters().tx_frames - tx_before <= 5);
}

#[tokio::test(start_paused = true)]
async fn test_card_leaving_keeps_partial_data() {
    let dump = mf_classic_dump(MfClassicType::Mini, |_| MfClassicKey::DEFAULT);
    let (poller, handle) = poller();
    let card = handle.add_card(CardListener::mf_classic(dump));
    let mut poller = MfClassicPoller::new(poller);
    let mut dictionary = MfClassicDict::builtin();

    let cancel = CancellationToken::new();
    let error = poller
        .read(&mut dictionary, &cancel, |event| {
            if let MfClassicEvent::BlockRead { blocks_read: 6, .. } = event {
                cancel.cancel();
            }
        })
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Cancelled));

    // Resume where the cancelled read stopped, with the card gone.
    handle.remove_card(card);
    let error = poller
        .read(&mut dictionary, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(error.is_transport());
    assert_eq!(poller.data().unwrap().blocks_read(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_write_dump_onto_card() {
    let blank = mf_classic_dump(MfClassicType::Mini, |_| MfClassicKey::DEFAULT);
    let mut source = blank.clone();
    for block in 1..20u8 {
        if !is_trailer(block) {
            source.set_block_read(block, &[0xA5; 16]).unwrap();
        }
    }
    source.set_block_read(0, &[0xEE; 16]).unwrap();

    let (poller, handle) = poller();
    let card = handle.add_card(CardListener::mf_classic(blank.clone()));
    let mut poller = MfClassicPoller::new(poller);

    let mut written = Vec::new();
    let summary = poller
        .write(&source, &CancellationToken::new(), |event| {
            if let MfClassicEvent::BlockWritten { block } = event {
                written.push(block);
            }
        })
        .await
        .unwrap();

    assert_eq!(summary, WriteSummary { blocks_written: 14, blocks_skipped: 0 });
    assert!(!written.contains(&0));
    let on_card: MfClassicData = handle.card(card).unwrap().mf_classic_data().unwrap().clone();
    assert_eq!(on_card.block(0), blank.block(0));
    assert_eq!(on_card.block(1), Some(&[0xA5; 16]));
    assert_eq!(on_card.raw_block(3), blank.raw_block(3));
}

#[tokio::test]
async fn test_write_refuses_other_card_type() {
    let source = mf_classic_dump(MfClassicType::Classic1k, |_| MfClassicKey::DEFAULT);
    let (poller, handle) = poller();
    handle.add_card(CardListener::mf_classic(mf_classic_dump(MfClassicType::Mini, |_| {
        MfClassicKey::DEFAULT
    })));
    let mut poller = MfClassicPoller::new(poller);

    let error = poller
        .write(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(error, Error::WrongCard { .. }));
}
