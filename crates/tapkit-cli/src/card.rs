//! Simulated cards built from command-line flags.

use crate::cli::{CardArgs, CardKind};
use anyhow::{Result, bail, ensure};
use tapkit_protocol::mf_classic::access::DEFAULT_ACCESS_BITS;
use tapkit_protocol::mf_classic::{first_block, trailer_of};
use tapkit_protocol::{
    CardListener, Iso14443_3aData, Iso14443_4aData, KeyType, MfClassicData, MfClassicKey,
    MfClassicType, ats_fill_default, bcc,
};

/// Key of locked sectors. Absent from the built-in dictionary.
const LOCKED_KEY: MfClassicKey = MfClassicKey::new([0x7A, 0x9C, 0x31, 0xE0, 0x5D, 0x42]);

impl CardKind {
    fn mf_classic_type(self) -> Option<MfClassicType> {
        match self {
            Self::Mini => Some(MfClassicType::Mini),
            Self::Classic1k => Some(MfClassicType::Classic1k),
            Self::Classic4k => Some(MfClassicType::Classic4k),
            Self::Plain | Self::Iso4 => None,
        }
    }

    /// ATQA and SAK a genuine card of this kind answers with.
    fn identity(self) -> ([u8; 2], u8) {
        match self {
            Self::Plain => ([0x44, 0x00], 0x00),
            Self::Iso4 => ([0x44, 0x03], 0x20),
            Self::Mini => ([0x04, 0x00], 0x09),
            Self::Classic1k => ([0x04, 0x00], 0x08),
            Self::Classic4k => ([0x02, 0x00], 0x18),
        }
    }
}

/// Build the card the simulated field will hold.
pub fn build(args: &CardArgs) -> Result<CardListener> {
    let (default_atqa, default_sak) = args.kind.identity();
    let base = Iso14443_3aData::new(
        args.uid.clone(),
        args.atqa.unwrap_or(default_atqa),
        args.sak.unwrap_or(default_sak),
    );

    let Some(card_type) = args.kind.mf_classic_type() else {
        ensure!(args.locked.is_empty(), "--locked only applies to Mifare Classic cards");
        return Ok(match args.kind {
            CardKind::Iso4 => CardListener::iso14443_4a(Iso14443_4aData {
                iso14443_3a: base,
                ats: Some(ats_fill_default()),
            }),
            _ => CardListener::iso14443_3a(base),
        });
    };

    let sectors = card_type.sectors_total();
    if let Some(sector) = args.locked.iter().find(|sector| **sector >= sectors) {
        bail!("Sector {sector} does not exist on a {} card", card_type.name());
    }
    let dump = mf_classic_dump(base, card_type, |sector| {
        if args.locked.contains(&sector) { LOCKED_KEY } else { args.key }
    })?;
    Ok(CardListener::mf_classic(dump))
}

/// Dump with a manufacturer block, a recognisable pattern in every data
/// block and transport access bits in every trailer.
fn mf_classic_dump(
    base: Iso14443_3aData,
    card_type: MfClassicType,
    key_of: impl Fn(u8) -> MfClassicKey,
) -> Result<MfClassicData> {
    let mut manufacturer = [0u8; 16];
    let uid = base.uid.as_bytes();
    manufacturer[..uid.len()].copy_from_slice(uid);
    let mut next = uid.len();
    if uid.len() == 4 {
        manufacturer[4] = bcc(uid);
        next = 5;
    }
    manufacturer[next] = base.sak;
    manufacturer[next + 1] = base.atqa[1];
    manufacturer[next + 2] = base.atqa[0];

    let mut data = MfClassicData::new(base, card_type);
    data.set_block_read(0, &manufacturer)?;
    for sector in 0..card_type.sectors_total() {
        let first = first_block(sector);
        let trailer = trailer_of(sector);
        for block in first..trailer {
            if block != 0 {
                data.set_block_read(block, &[block; 16])?;
            }
        }
        let key = key_of(sector);
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(key.as_bytes());
        bytes[6..10].copy_from_slice(&DEFAULT_ACCESS_BITS);
        bytes[10..].copy_from_slice(key.as_bytes());
        data.set_block_read(trailer, &bytes)?;
        data.set_key_found(sector, KeyType::A, key)?;
        data.set_key_found(sector, KeyType::B, key)?;
    }
    Ok(data)
}
