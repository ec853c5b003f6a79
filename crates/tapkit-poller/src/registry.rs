//! Protocol registry and per-family readers.
//!
//! Every family is detected from the identity an ISO14443-3A activation
//! returns. The registry tries the registered detectors in order, most
//! specific first, and hands out the reader of the winning family.
//!
//! # Examples
//!
//! ```
//! use tapkit_core::{ProtocolType, Uid};
//! use tapkit_poller::ProtocolRegistry;
//! use tapkit_protocol::Iso14443_3aData;
//!
//! let registry = ProtocolRegistry::default();
//! let uid = Uid::new(&[0x01, 0x02, 0x03, 0x04]).unwrap();
//!
//! let classic = Iso14443_3aData::new(uid.clone(), [0x04, 0x00], 0x08);
//! assert_eq!(registry.resolve(&classic), ProtocolType::MfClassic);
//!
//! let plain = Iso14443_3aData::new(uid, [0x44, 0x00], 0x00);
//! assert_eq!(registry.resolve(&plain), ProtocolType::Iso14443_3a);
//! ```

#![allow(async_fn_in_trait)]

use crate::iso14443_3a::Iso14443_3aPoller;
use crate::iso14443_4a::Iso14443_4aPoller;
use crate::mf_classic::{MfClassicEvent, MfClassicPoller};
use tapkit_core::{ProtocolType, Result};
use tapkit_hardware::Transceiver;
use tapkit_protocol::{Iso14443_3aData, MfClassicDict, MfClassicType, ProtocolData};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides from the 3A identity whether a card belongs to a family.
pub type Detector = fn(&Iso14443_3aData) -> bool;

/// Everything a reader may need besides the card.
pub struct ReadRequest<'a> {
    pub dictionary: &'a mut MfClassicDict,
    pub cancel: &'a CancellationToken,
    pub on_event: &'a mut (dyn FnMut(MfClassicEvent) + Send),
}

/// Reads a whole card of one family.
pub trait CardReader {
    fn protocol(&self) -> ProtocolType;

    /// Read the card, continuing from the selection the detection left.
    async fn read(&mut self, request: &mut ReadRequest<'_>) -> Result<ProtocolData>;

    /// Whatever was read so far, also after a failed [`read`](Self::read).
    fn partial_data(&self) -> Option<ProtocolData>;
}

impl<T: Transceiver> CardReader for Iso14443_3aPoller<T> {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Iso14443_3a
    }

    async fn read(&mut self, _request: &mut ReadRequest<'_>) -> Result<ProtocolData> {
        if self.state().is_active() {
            if let Some(data) = self.data() {
                return Ok(data.clone().into());
            }
        }
        Ok(self.reactivate().await?.into())
    }

    fn partial_data(&self) -> Option<ProtocolData> {
        self.data().cloned().map(ProtocolData::from)
    }
}

impl<T: Transceiver> CardReader for Iso14443_4aPoller<T> {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Iso14443_4a
    }

    async fn read(&mut self, _request: &mut ReadRequest<'_>) -> Result<ProtocolData> {
        if let Some(data) = self.data() {
            return Ok(data.clone().into());
        }
        let selected = self
            .iso14443_3a()
            .data()
            .filter(|_| self.iso14443_3a().state().is_active())
            .cloned();
        let data = match selected {
            Some(base) => self.complete_activation(base).await?,
            None => {
                let base = self.iso14443_3a_mut().reactivate().await?;
                self.complete_activation(base).await?
            }
        };
        Ok(data.into())
    }

    fn partial_data(&self) -> Option<ProtocolData> {
        self.data().cloned().map(ProtocolData::from)
    }
}

impl<T: Transceiver> CardReader for MfClassicPoller<T> {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::MfClassic
    }

    async fn read(&mut self, request: &mut ReadRequest<'_>) -> Result<ProtocolData> {
        let data =
            MfClassicPoller::read(self, request.dictionary, request.cancel, &mut *request.on_event)
                .await?;
        Ok(data.into())
    }

    fn partial_data(&self) -> Option<ProtocolData> {
        self.data().cloned().map(ProtocolData::from)
    }
}

/// Reader of any registered family.
#[derive(Debug)]
pub enum AnyReader<T> {
    Iso14443_3a(Iso14443_3aPoller<T>),
    Iso14443_4a(Iso14443_4aPoller<T>),
    MfClassic(MfClassicPoller<T>),
}

impl<T: Transceiver> AnyReader<T> {
    /// Give the 3A poller back, with its session lock intact.
    pub fn into_iso14443_3a(self) -> Iso14443_3aPoller<T> {
        match self {
            Self::Iso14443_3a(poller) => poller,
            Self::Iso14443_4a(poller) => poller.into_iso14443_3a(),
            Self::MfClassic(poller) => poller.into_iso14443_3a(),
        }
    }

    pub fn iso14443_3a(&self) -> &Iso14443_3aPoller<T> {
        match self {
            Self::Iso14443_3a(poller) => poller,
            Self::Iso14443_4a(poller) => poller.iso14443_3a(),
            Self::MfClassic(poller) => poller.iso14443_3a(),
        }
    }

    /// Continue from data an earlier read of the same card produced. Only
    /// Mifare Classic dumps carry over (with their keys); anything else is
    /// read again from scratch.
    pub fn resume(&mut self, previous: &ProtocolData) {
        if let (Self::MfClassic(poller), ProtocolData::MfClassic(data)) = (self, previous) {
            poller.resume(data.clone());
        }
    }

    /// Halt the card the way its family requires.
    pub async fn halt(&mut self) {
        match self {
            Self::Iso14443_3a(poller) => poller.halt().await,
            Self::Iso14443_4a(poller) => poller.halt().await,
            Self::MfClassic(poller) => poller.halt().await,
        }
    }
}

impl<T: Transceiver> CardReader for AnyReader<T> {
    fn protocol(&self) -> ProtocolType {
        match self {
            Self::Iso14443_3a(poller) => poller.protocol(),
            Self::Iso14443_4a(poller) => poller.protocol(),
            Self::MfClassic(poller) => poller.protocol(),
        }
    }

    async fn read(&mut self, request: &mut ReadRequest<'_>) -> Result<ProtocolData> {
        match self {
            Self::Iso14443_3a(poller) => CardReader::read(poller, request).await,
            Self::Iso14443_4a(poller) => CardReader::read(poller, request).await,
            Self::MfClassic(poller) => CardReader::read(poller, request).await,
        }
    }

    fn partial_data(&self) -> Option<ProtocolData> {
        match self {
            Self::Iso14443_3a(poller) => poller.partial_data(),
            Self::Iso14443_4a(poller) => poller.partial_data(),
            Self::MfClassic(poller) => poller.partial_data(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    protocol: ProtocolType,
    detector: Detector,
}

/// Families known to the reader, in detection order.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    registrations: Vec<Registration>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProtocolRegistry {
    /// Registry without any family; everything resolves to ISO14443-3A.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Mifare Classic, then ISO14443-4A, then plain ISO14443-3A.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(ProtocolType::MfClassic, |data| {
                MfClassicType::detect(data.atqa, data.sak).is_some()
            })
            .register(ProtocolType::Iso14443_4a, Iso14443_3aData::supports_iso14443_4)
            .register(ProtocolType::Iso14443_3a, |_| true);
        registry
    }

    /// Register `protocol`. A family registered again keeps its position
    /// and gets the new detector.
    pub fn register(&mut self, protocol: ProtocolType, detector: Detector) -> &mut Self {
        match self
            .registrations
            .iter_mut()
            .find(|registration| registration.protocol == protocol)
        {
            Some(registration) => registration.detector = detector,
            None => self.registrations.push(Registration { protocol, detector }),
        }
        self
    }

    pub fn is_registered(&self, protocol: ProtocolType) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.protocol == protocol)
    }

    pub fn protocols(&self) -> impl Iterator<Item = ProtocolType> + '_ {
        self.registrations.iter().map(|registration| registration.protocol)
    }

    /// Most specific registered family matching the card.
    pub fn resolve(&self, data: &Iso14443_3aData) -> ProtocolType {
        let protocol = self
            .registrations
            .iter()
            .find(|registration| (registration.detector)(data))
            .map_or(ProtocolType::Iso14443_3a, |registration| registration.protocol);
        debug!(uid = %data.uid, %protocol, "Protocol resolved");
        protocol
    }

    /// Reader for `protocol`, taking over the 3A poller. A family that is
    /// not registered is read as plain ISO14443-3A.
    pub fn reader<T: Transceiver>(
        &self,
        protocol: ProtocolType,
        poller: Iso14443_3aPoller<T>,
    ) -> AnyReader<T> {
        if !self.is_registered(protocol) {
            debug!(%protocol, "Protocol not registered, reading as ISO14443-3A");
            return AnyReader::Iso14443_3a(poller);
        }
        match protocol {
            ProtocolType::Iso14443_3a => AnyReader::Iso14443_3a(poller),
            ProtocolType::Iso14443_4a => AnyReader::Iso14443_4a(Iso14443_4aPoller::new(poller)),
            ProtocolType::MfClassic => AnyReader::MfClassic(MfClassicPoller::new(poller)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PollerConfig;
    use rstest::rstest;
    use tapkit_core::{Error, Uid};
    use tapkit_hardware::mock::MockTransceiver;
    use tapkit_protocol::{CardListener, Iso14443_4aData, MfClassicData};

    fn identity(atqa: [u8; 2], sak: u8) -> Iso14443_3aData {
        Iso14443_3aData::new(Uid::new(&[0x11, 0x22, 0x33, 0x44]).unwrap(), atqa, sak)
    }

    #[rstest]
    #[case([0x04, 0x00], 0x08, ProtocolType::MfClassic)]
    #[case([0x02, 0x00], 0x18, ProtocolType::MfClassic)]
    #[case([0x04, 0x00], 0x09, ProtocolType::MfClassic)]
    #[case([0x44, 0x03], 0x20, ProtocolType::Iso14443_4a)]
    #[case([0x44, 0x00], 0x00, ProtocolType::Iso14443_3a)]
    fn test_resolve(#[case] atqa: [u8; 2], #[case] sak: u8, #[case] expected: ProtocolType) {
        assert_eq!(ProtocolRegistry::default().resolve(&identity(atqa, sak)), expected);
    }

    #[test]
    fn test_empty_registry_falls_back_to_3a() {
        let registry = ProtocolRegistry::new();
        assert_eq!(registry.resolve(&identity([0x04, 0x00], 0x08)), ProtocolType::Iso14443_3a);
    }

    #[test]
    fn test_register_replaces_detector_in_place() {
        let mut registry = ProtocolRegistry::with_defaults();
        registry.register(ProtocolType::MfClassic, |_| false);
        assert_eq!(
            registry.protocols().collect::<Vec<_>>(),
            vec![ProtocolType::MfClassic, ProtocolType::Iso14443_4a, ProtocolType::Iso14443_3a]
        );
        assert_eq!(registry.resolve(&identity([0x04, 0x00], 0x08)), ProtocolType::Iso14443_3a);
    }

    #[test]
    fn test_unregistered_family_reads_as_3a() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolType::Iso14443_4a, Iso14443_3aData::supports_iso14443_4);
        let (transceiver, _handle) = MockTransceiver::new();
        let poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
        let reader = registry.reader(ProtocolType::MfClassic, poller);
        assert_eq!(reader.protocol(), ProtocolType::Iso14443_3a);
    }

    #[tokio::test]
    async fn test_detect_then_read_iso14443_4a() {
        let (transceiver, handle) = MockTransceiver::new();
        handle.add_card(CardListener::iso14443_4a(Iso14443_4aData {
            iso14443_3a: identity([0x44, 0x03], 0x20),
            ats: None,
        }));
        let registry = ProtocolRegistry::default();
        let mut poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
        let base = poller.activate().await.unwrap();

        let protocol = registry.resolve(&base);
        let mut reader = registry.reader(protocol, poller);
        let mut dictionary = MfClassicDict::new();
        let cancel = CancellationToken::new();
        let mut on_event = |_: MfClassicEvent| {};
        let mut request = ReadRequest {
            dictionary: &mut dictionary,
            cancel: &cancel,
            on_event: &mut on_event,
        };

        let data = reader.read(&mut request).await.unwrap();
        assert_eq!(data.protocol(), ProtocolType::Iso14443_4a);
        assert_eq!(data.uid(), &base.uid);
        // The detection selection is reused: no second WUPA.
        assert_eq!(handle.counters().tx_frames, 4);
    }

    #[tokio::test]
    async fn test_partial_data_after_cancel() {
        let (transceiver, handle) = MockTransceiver::new();
        let mut dump = MfClassicData::new(identity([0x04, 0x00], 0x09), MfClassicType::Mini);
        dump.set_key_found(0, tapkit_protocol::KeyType::A, tapkit_protocol::MfClassicKey::DEFAULT)
            .unwrap();
        handle.add_card(CardListener::mf_classic(dump));

        let mut poller = Iso14443_3aPoller::new(transceiver, PollerConfig::default());
        let base = poller.activate().await.unwrap();
        let registry = ProtocolRegistry::default();
        let mut reader = registry.reader(registry.resolve(&base), poller);

        let mut dictionary = MfClassicDict::builtin();
        let cancel = CancellationToken::new();
        let mut blocks = 0;
        let mut on_event = |event: MfClassicEvent| {
            if let MfClassicEvent::BlockRead { blocks_read, .. } = event {
                blocks = blocks_read;
                if blocks_read == 2 {
                    cancel.cancel();
                }
            }
        };
        let mut request = ReadRequest {
            dictionary: &mut dictionary,
            cancel: &cancel,
            on_event: &mut on_event,
        };

        assert!(matches!(reader.read(&mut request).await, Err(Error::Cancelled)));
        let partial = reader.partial_data().unwrap();
        assert_eq!(partial.read_progress(), Some((2, 20)));
        assert_eq!(blocks, 2);
    }
}
