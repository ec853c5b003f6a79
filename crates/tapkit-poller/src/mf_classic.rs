//! Mifare Classic poller.
//!
//! Authenticates sectors with Crypto1 and reads or writes blocks over the
//! encrypted channel. Only first authentications are performed: before
//! authenticating again the card is halted and re-activated, which works
//! with every card and every emulator.
//!
//! [`MfClassicPoller::read`] walks all sectors with a key dictionary and
//! keeps whatever it manages to read. A sector whose keys are not in the
//! dictionary simply stays unread; the dump is partial, not failed.

use crate::iso14443_3a::Iso14443_3aPoller;
use crate::state::PollerState;
use std::time::Duration;
use tapkit_core::constants::{MF_CLASSIC_ACK, MF_CLASSIC_BLOCK_SIZE};
use tapkit_core::{BitBuffer, Error, ProtocolType, Result};
use tapkit_hardware::Transceiver;
use tapkit_protocol::crc::{check_crc_a, trim_crc_a};
use tapkit_protocol::iso14443_3a::{self, Iso14443_3aData};
use tapkit_protocol::mf_classic::crypto1::{Crypto1, prng_successor};
use tapkit_protocol::mf_classic::{
    self, Block, KeyType, MfClassicData, MfClassicKey, MfClassicType, blocks_in_sector,
    first_block, is_trailer, sector_of, trailer_of,
};
use tapkit_protocol::MfClassicDict;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Progress reported while reading or writing a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfClassicEvent {
    /// A key of `sector` was found.
    KeyFound { sector: u8, key_type: KeyType },
    /// Another block was read. `blocks_read` never decreases.
    BlockRead { blocks_read: usize, blocks_total: usize },
    /// A block was written.
    BlockWritten { block: u8 },
}

/// Outcome of [`MfClassicPoller::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub blocks_written: usize,
    /// Blocks of the source no known key could write.
    pub blocks_skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Authenticated {
    sector: u8,
    key_type: KeyType,
}

/// Reader side of Mifare Classic.
#[derive(Debug)]
pub struct MfClassicPoller<T> {
    iso14443_3a: Iso14443_3aPoller<T>,
    cipher: Crypto1,
    auth: Option<Authenticated>,
    data: Option<MfClassicData>,
}

impl<T: Transceiver> MfClassicPoller<T> {
    pub fn new(iso14443_3a: Iso14443_3aPoller<T>) -> Self {
        Self {
            iso14443_3a,
            cipher: Crypto1::default(),
            auth: None,
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

    /// Dump collected so far.
    pub fn data(&self) -> Option<&MfClassicData> {
        self.data.as_ref()
    }

    pub fn take_data(&mut self) -> Option<MfClassicData> {
        self.data.take()
    }

    /// Seed the dump with an earlier one. It is used only when the card
    /// activated next has the same UID and type.
    pub fn resume(&mut self, data: MfClassicData) {
        debug!(uid = %data.iso14443_3a.uid, blocks_read = data.blocks_read(), "Resuming dump");
        self.data = Some(data);
    }

    /// Whether an authentication is currently established.
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    /// Activate the card and start a dump for it.
    ///
    /// # Errors
    ///
    /// Any 3A activation error, or `Error::WrongCard` when ATQA and SAK do
    /// not describe a Mifare Classic.
    pub async fn activate(&mut self) -> Result<MfClassicType> {
        self.drop_auth();
        let base = self.iso14443_3a.activate().await?;
        self.start_dump(base)
    }

    /// Start (or keep) the dump for a card the 3A layer activated.
    pub(crate) fn start_dump(&mut self, base: Iso14443_3aData) -> Result<MfClassicType> {
        let card_type = MfClassicType::detect(base.atqa, base.sak).ok_or_else(|| {
            Error::WrongCard {
                expected: ProtocolType::MfClassic.to_string(),
                found: format!(
                    "{} (ATQA {:02X}{:02X}, SAK {:02X})",
                    ProtocolType::Iso14443_3a,
                    base.atqa[1],
                    base.atqa[0],
                    base.sak
                ),
            }
        })?;

        let same_card = self
            .data
            .as_ref()
            .is_some_and(|data| data.iso14443_3a.uid == base.uid && data.card_type == card_type);
        if !same_card {
            debug!(uid = %base.uid, %card_type, "New Mifare Classic dump");
            self.data = Some(MfClassicData::new(base, card_type));
        }
        Ok(card_type)
    }

    fn fwt(&self) -> Duration {
        self.iso14443_3a.config().mf_classic_fwt()
    }

    fn dump(&self) -> Result<&MfClassicData> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::communication("No Mifare Classic card activated"))
    }

    fn dump_mut(&mut self) -> Result<&mut MfClassicData> {
        self.data
            .as_mut()
            .ok_or_else(|| Error::communication("No Mifare Classic card activated"))
    }

    fn drop_auth(&mut self) {
        self.auth = None;
        self.cipher.reset();
    }

    /// The card left the authenticated state on its own.
    fn lose_card(&mut self) {
        self.drop_auth();
        self.iso14443_3a.mark_deselected();
    }

    /// First authentication to the sector holding `block`.
    ///
    /// # Errors
    ///
    /// `Error::AuthFailed` when the card rejects the key (it goes silent),
    /// `Error::Nack` for a block the card does not have and
    /// `Error::Communication` without an active card or while another
    /// authentication is established. After any error the card must be
    /// re-activated.
    pub async fn auth(&mut self, block: u8, key_type: KeyType, key: &MfClassicKey) -> Result<()> {
        if self.auth.is_some() {
            return Err(Error::communication(
                "Already authenticated, halt and re-activate first",
            ));
        }
        let cuid = self
            .iso14443_3a
            .data()
            .filter(|_| self.iso14443_3a.state().is_active())
            .map(Iso14443_3aData::cuid)
            .ok_or_else(|| Error::communication("No card is active"))?;

        match self.run_auth(block, key_type, key, cuid).await {
            Ok(()) => {
                self.auth = Some(Authenticated {
                    sector: sector_of(block),
                    key_type,
                });
                trace!(block, %key_type, "Authenticated");
                Ok(())
            }
            Err(error) => {
                self.lose_card();
                Err(error)
            }
        }
    }

    async fn run_auth(
        &mut self,
        block: u8,
        key_type: KeyType,
        key: &MfClassicKey,
        cuid: u32,
    ) -> Result<()> {
        let fwt = self.fwt();
        let request = mf_classic::auth_request(block, key_type)?;
        let nonce = match self.iso14443_3a.txrx(&request, fwt).await {
            Ok((frame, _)) => frame,
            Err(Error::Timeout) => return Err(Error::AuthFailed { block }),
            Err(error) => return Err(error),
        };
        if nonce.size_bits() == 4 {
            return Err(Error::Nack(nonce.raw_bytes()[0] & 0x0F));
        }
        if nonce.size_bits() != 32 {
            return Err(Error::communication(format!(
                "Tag nonce must be 32 bits, got {}",
                nonce.size_bits()
            )));
        }
        let bytes = nonce.bytes()?;
        let nt = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        let nr = rand::random::<u32>().to_be_bytes();
        let answer = self.cipher.encrypt_reader_nonce(key, cuid, nt, nr)?;
        let tag_answer = match self.iso14443_3a.send_custom_parity_frame(&answer, fwt).await {
            Ok(frame) => frame,
            Err(Error::Timeout) => return Err(Error::AuthFailed { block }),
            Err(error) => return Err(error),
        };
        if tag_answer.size_bits() != 32 {
            return Err(Error::communication(format!(
                "Tag answer must be 32 bits, got {}",
                tag_answer.size_bits()
            )));
        }

        let at = self.cipher.decrypt(&tag_answer)?;
        if at.bytes()? != prng_successor(nt, 96).to_be_bytes() {
            return Err(Error::AuthFailed { block });
        }
        Ok(())
    }

    fn require_auth(&self, block: u8) -> Result<()> {
        match self.auth {
            Some(auth) if auth.sector == sector_of(block) => Ok(()),
            Some(auth) => Err(Error::communication(format!(
                "Block {block} is outside authenticated sector {}",
                auth.sector
            ))),
            None => Err(Error::communication("Not authenticated")),
        }
    }

    /// Encrypt `plain`, exchange it and decrypt the answer.
    async fn encrypted_exchange(&mut self, plain: &BitBuffer) -> Result<BitBuffer> {
        let frame = self.cipher.encrypt(plain)?;
        let fwt = self.fwt();
        match self.iso14443_3a.send_custom_parity_frame(&frame, fwt).await {
            Ok(answer) => self.cipher.decrypt(&answer),
            Err(error) => {
                self.lose_card();
                Err(error)
            }
        }
    }

    fn nack(&mut self, answer: &BitBuffer) -> Error {
        self.lose_card();
        Error::Nack(answer.raw_bytes().first().copied().unwrap_or(0) & 0x0F)
    }

    /// Read one block of the authenticated sector.
    ///
    /// # Errors
    ///
    /// `Error::Nack` when the access conditions forbid the read (the card
    /// then drops the authentication), `Error::WrongCrc` for a corrupted
    /// answer and `Error::Timeout` when the card stays silent.
    pub async fn read_block(&mut self, block: u8) -> Result<Block> {
        self.require_auth(block)?;
        let mut answer = self.encrypted_exchange(&mf_classic::read_request(block)?).await?;

        match answer.size_bits() {
            4 => Err(self.nack(&answer)),
            bits if bits == (MF_CLASSIC_BLOCK_SIZE + 2) * 8 => {
                if !check_crc_a(&answer) {
                    self.lose_card();
                    return Err(Error::WrongCrc);
                }
                trim_crc_a(&mut answer)?;
                let mut content = [0u8; MF_CLASSIC_BLOCK_SIZE];
                content.copy_from_slice(answer.bytes()?);
                Ok(content)
            }
            bits => {
                self.lose_card();
                Err(Error::communication(format!("Read answer of {bits} bits")))
            }
        }
    }

    async fn expect_ack(&mut self, plain: &BitBuffer) -> Result<()> {
        let answer = self.encrypted_exchange(plain).await?;
        if answer.size_bits() != 4 {
            self.lose_card();
            return Err(Error::communication(format!(
                "Expected ACK, got {} bits",
                answer.size_bits()
            )));
        }
        if answer.raw_bytes()[0] & 0x0F != MF_CLASSIC_ACK {
            return Err(self.nack(&answer));
        }
        Ok(())
    }

    /// Write one block of the authenticated sector (two-phase WRITE).
    ///
    /// # Errors
    ///
    /// `Error::Nack` when the card refuses either phase and
    /// `Error::Timeout` when it stays silent.
    pub async fn write_block(&mut self, block: u8, content: &Block) -> Result<()> {
        self.require_auth(block)?;
        self.expect_ack(&mf_classic::write_request(block)?).await?;
        self.expect_ack(&mf_classic::write_data_frame(content)?).await?;
        trace!(block, "Block written");
        Ok(())
    }

    /// Halt the card, encrypted when authenticated. Best effort.
    pub async fn halt(&mut self) {
        if self.auth.is_none() {
            self.iso14443_3a.halt().await;
            return;
        }

        let fwt = self.fwt();
        if self.iso14443_3a.enter(PollerState::Halt).is_err() {
            trace!("Encrypted halt outside Active");
        }
        match iso14443_3a::halt_request().and_then(|frame| self.cipher.encrypt(&frame)) {
            Ok(frame) => match self.iso14443_3a.txrx(&frame, fwt).await {
                Err(Error::Timeout) => trace!("Card halted"),
                Ok((answer, _)) => warn!(answer = %answer, "Card answered encrypted HALT"),
                Err(error) => warn!(%error, "Encrypted HALT failed"),
            },
            Err(error) => warn!(%error, "Cannot build encrypted HALT"),
        }
        self.lose_card();
    }

    /// Continue with the card the 3A layer selected, or wake it up again.
    async fn ensure_dump(&mut self) -> Result<()> {
        if self.iso14443_3a.state().is_active() {
            if let Some(base) = self.iso14443_3a.data().cloned() {
                self.start_dump(base)?;
                return Ok(());
            }
        }
        self.drop_auth();
        let base = self.iso14443_3a.reactivate().await?;
        self.start_dump(base)?;
        Ok(())
    }

    /// Make the card ready for a first authentication.
    async fn prepare_auth(&mut self) -> Result<()> {
        if self.auth.is_some() {
            self.halt().await;
        }
        if !self.iso14443_3a.state().is_active() {
            let base = self.iso14443_3a.reactivate().await?;
            self.start_dump(base)?;
        }
        Ok(())
    }

    /// Authenticate `sector` with `key` unless that is already done.
    /// `Ok(false)` means the card rejected the key.
    async fn ensure_auth(&mut self, sector: u8, key_type: KeyType, key: &MfClassicKey) -> Result<bool> {
        if self.auth == Some(Authenticated { sector, key_type }) {
            return Ok(true);
        }
        self.prepare_auth().await?;
        match self.auth(trailer_of(sector), key_type, key).await {
            Ok(()) => Ok(true),
            Err(Error::AuthFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Read every sector the dictionary unlocks.
    ///
    /// Keys already known (from earlier sectors or a previous dump of the
    /// same card) are tried before the dictionary. Cancellation is checked
    /// before every key attempt and every block. Whatever was read stays
    /// available through [`data`](Self::data), also after an error.
    ///
    /// # Errors
    ///
    /// Transport errors (the card left), `Error::Cancelled`, or
    /// `Error::WrongCard` when the card is not a Mifare Classic.
    pub async fn read<F>(
        &mut self,
        dictionary: &mut MfClassicDict,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<MfClassicData>
    where
        F: FnMut(MfClassicEvent) + Send,
    {
        self.ensure_dump().await?;

        let sectors = self.dump()?.sectors_total();
        for sector in 0..sectors {
            for key_type in [KeyType::A, KeyType::B] {
                let key = match self.dump()?.key(sector, key_type) {
                    Some(key) => Some(key),
                    None => {
                        self.find_key(sector, key_type, dictionary, cancel, &mut on_event)
                            .await?
                    }
                };
                if let Some(key) = key {
                    self.read_sector(sector, key_type, &key, cancel, &mut on_event)
                        .await?;
                }
            }
        }
        self.halt().await;

        let dump = self.dump()?.clone();
        info!(
            blocks_read = dump.blocks_read(),
            blocks_total = dump.blocks_total(),
            keys_found = dump.keys_found(),
            "Mifare Classic read finished"
        );
        Ok(dump)
    }

    async fn find_key<F>(
        &mut self,
        sector: u8,
        key_type: KeyType,
        dictionary: &mut MfClassicDict,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<Option<MfClassicKey>>
    where
        F: FnMut(MfClassicEvent) + Send,
    {
        let dump = self.dump()?;
        let mut known: Vec<MfClassicKey> = Vec::new();
        for other in 0..dump.sectors_total() {
            for other_type in [KeyType::A, KeyType::B] {
                if let Some(key) = dump.key(other, other_type) {
                    if !known.contains(&key) {
                        known.push(key);
                    }
                }
            }
        }

        dictionary.rewind();
        let mut known_keys = known.clone().into_iter();
        loop {
            let key = match known_keys.next() {
                Some(key) => key,
                None => match dictionary.next_key() {
                    Some(key) if known.contains(&key) => continue,
                    Some(key) => key,
                    None => break,
                },
            };
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if self.ensure_auth(sector, key_type, &key).await? {
                self.dump_mut()?.set_key_found(sector, key_type, key)?;
                debug!(sector, %key_type, "Key found");
                on_event(MfClassicEvent::KeyFound { sector, key_type });
                return Ok(Some(key));
            }
        }
        trace!(sector, %key_type, "No key in dictionary");
        Ok(None)
    }

    async fn read_sector<F>(
        &mut self,
        sector: u8,
        key_type: KeyType,
        key: &MfClassicKey,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<()>
    where
        F: FnMut(MfClassicEvent) + Send,
    {
        let first = first_block(sector);
        for block in first..first + blocks_in_sector(sector) {
            if self.dump()?.is_block_read(block) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.ensure_auth(sector, key_type, key).await? {
                warn!(sector, %key_type, "Known key rejected");
                return Ok(());
            }

            match self.read_block(block).await {
                Ok(content) => {
                    self.store_block(block, &content)?;
                    let dump = self.dump()?;
                    on_event(MfClassicEvent::BlockRead {
                        blocks_read: dump.blocks_read(),
                        blocks_total: dump.blocks_total(),
                    });
                }
                Err(Error::Nack(_)) => trace!(block, %key_type, "Read not permitted"),
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Store a block; trailer keys the card masked are restored from the
    /// keys found.
    fn store_block(&mut self, block: u8, content: &Block) -> Result<()> {
        let dump = self.dump_mut()?;
        dump.set_block_read(block, content)?;
        if is_trailer(block) {
            let sector = sector_of(block);
            for key_type in [KeyType::A, KeyType::B] {
                if let Some(key) = dump.key(sector, key_type) {
                    dump.set_key_found(sector, key_type, key)?;
                }
            }
        }
        Ok(())
    }

    /// Write the data blocks of `source` onto the activated card.
    ///
    /// Block 0 and sector trailers are never written. Each sector is
    /// unlocked with the source's key B, then key A.
    ///
    /// # Errors
    ///
    /// `Error::WrongCard` when the card type differs from the source,
    /// `Error::Cancelled` and transport errors.
    pub async fn write<F>(
        &mut self,
        source: &MfClassicData,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<WriteSummary>
    where
        F: FnMut(MfClassicEvent) + Send,
    {
        self.ensure_dump().await?;
        let target = self.dump()?.card_type;
        if target != source.card_type {
            return Err(Error::WrongCard {
                expected: format!("{} {}", ProtocolType::MfClassic, source.card_type),
                found: format!("{} {target}", ProtocolType::MfClassic),
            });
        }

        let mut summary = WriteSummary::default();
        for sector in 0..source.sectors_total() {
            let first = first_block(sector);
            let mut pending: Vec<u8> = (first..first + blocks_in_sector(sector))
                .filter(|block| *block != 0 && !is_trailer(*block) && source.is_block_read(*block))
                .collect();
            let keys = [KeyType::B, KeyType::A]
                .into_iter()
                .filter_map(|key_type| source.key(sector, key_type).map(|key| (key_type, key)));

            for (key_type, key) in keys {
                let mut denied = Vec::new();
                for block in pending {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let Some(content) = source.block(block) else {
                        continue;
                    };
                    if !self.ensure_auth(sector, key_type, &key).await? {
                        denied.push(block);
                        continue;
                    }
                    match self.write_block(block, content).await {
                        Ok(()) => {
                            summary.blocks_written += 1;
                            on_event(MfClassicEvent::BlockWritten { block });
                        }
                        Err(Error::Nack(_)) => denied.push(block),
                        Err(error) => return Err(error),
                    }
                }
                pending = denied;
            }
            summary.blocks_skipped += pending.len();
        }
        self.halt().await;

        info!(
            written = summary.blocks_written,
            skipped = summary.blocks_skipped,
            "Mifare Classic write finished"
        );
        Ok(summary)
    }
}
