//! Simulated RF field: cards, faults and the air interface between them.

use crate::types::RxStatus;
use tapkit_core::{BitBuffer, Result};
use tapkit_protocol::CardListener;
use tracing::warn;

/// Identifier of a card placed in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardId(pub usize);

/// Fault applied to every answer until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip the lowest bit of the last byte of each answer.
    CorruptCrc,
    /// Cards answer nothing.
    Mute,
}

/// Exchange statistics of a mock transceiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeCounters {
    /// Frames transmitted by the local side.
    pub tx_frames: usize,
    /// Frames handed out by `rx`.
    pub rx_frames: usize,
    /// Frames that carried a collision.
    pub collisions: usize,
}

#[derive(Debug)]
pub(crate) struct SimulatedCard {
    pub(crate) id: CardId,
    pub(crate) listener: CardListener,
    pub(crate) present: bool,
}

impl SimulatedCard {
    fn respond(&mut self, frame: &BitBuffer) -> Option<BitBuffer> {
        match self.listener.process(frame) {
            Ok(response) => response,
            Err(error) => {
                warn!(card = self.id.0, %error, "Simulated card failed to answer");
                None
            }
        }
    }
}

/// Everything on the card side of the air gap.
#[derive(Debug, Default)]
pub(crate) struct Field {
    pub(crate) cards: Vec<SimulatedCard>,
    pub(crate) next_id: usize,
    pub(crate) field_on: bool,
    pub(crate) fault: Option<Fault>,
    pub(crate) counters: ExchangeCounters,
    pub(crate) pending: Option<(BitBuffer, RxStatus)>,
}

impl Field {
    pub(crate) fn add_card(&mut self, listener: CardListener) -> CardId {
        let id = CardId(self.next_id);
        self.next_id += 1;
        self.cards.push(SimulatedCard {
            id,
            listener,
            present: true,
        });
        id
    }

    pub(crate) fn card_mut(&mut self, id: CardId) -> Option<&mut SimulatedCard> {
        self.cards.iter_mut().find(|card| card.id == id)
    }

    /// Cards lose power.
    pub(crate) fn power_down(&mut self) {
        for card in &mut self.cards {
            card.listener.field_off();
        }
        self.pending = None;
    }

    /// Deliver a reader frame to every present card and stage the combined
    /// answer for the next `rx`.
    pub(crate) fn transmit(&mut self, frame: &BitBuffer) {
        self.counters.tx_frames += 1;
        let mut responses: Vec<BitBuffer> = self
            .cards
            .iter_mut()
            .filter(|card| card.present)
            .filter_map(|card| card.respond(frame))
            .collect();

        match self.fault {
            Some(Fault::Mute) => responses.clear(),
            Some(Fault::CorruptCrc) => {
                for frame in &mut responses {
                    if let Err(error) = corrupt(frame) {
                        warn!(%error, "Answer left uncorrupted");
                    }
                }
            }
            None => {}
        }
        self.pending = merge_responses(&responses);
    }
}

fn corrupt(frame: &mut BitBuffer) -> Result<()> {
    if !frame.is_byte_aligned() || frame.is_empty() {
        return Ok(());
    }
    let index = frame.size_bytes() - 1;
    let byte = frame.byte(index)?;
    frame.set_byte(index, byte ^ 0x01)
}

/// Combine simultaneous answers the way the air interface does.
///
/// Identical answers are indistinguishable from one. Otherwise the result is
/// the bitwise OR of all answers (as long as the longest) and reports the
/// first bit position where they differ.
pub(crate) fn merge_responses(responses: &[BitBuffer]) -> Option<(BitBuffer, RxStatus)> {
    let (first, rest) = responses.split_first()?;
    if rest.iter().all(|response| response == first) {
        return Some((first.clone(), RxStatus::Complete));
    }

    let len = responses.iter().map(BitBuffer::size_bits).max().unwrap_or(0);
    let bit_at = |response: &BitBuffer, index: usize| response.bit(index).ok();

    let mut first_bit = len;
    for index in 0..len {
        let reference = bit_at(first, index);
        if rest.iter().any(|response| bit_at(response, index) != reference) {
            first_bit = index;
            break;
        }
    }

    let mut merged = BitBuffer::new();
    for index in 0..len {
        let bit = responses
            .iter()
            .any(|response| bit_at(response, index).unwrap_or(false));
        merged.append_bit(bit).ok()?;
    }
    Some((merged, RxStatus::Collision { first_bit }))
}
