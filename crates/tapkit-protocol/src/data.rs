//! Protocol data of any supported card family.

use crate::iso14443_3a::Iso14443_3aData;
use crate::iso14443_4a::Iso14443_4aData;
use crate::mf_classic::MfClassicData;
use serde::{Deserialize, Serialize};
use tapkit_core::format::{FormatReader, FormatWriter};
use tapkit_core::{ProtocolType, Result, Uid};

const DEVICE_TYPE_KEY: &str = "Device type";

/// What was read from a card, tagged by family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolData {
    Iso14443_3a(Iso14443_3aData),
    Iso14443_4a(Iso14443_4aData),
    MfClassic(MfClassicData),
}

impl ProtocolData {
    pub fn protocol(&self) -> ProtocolType {
        match self {
            Self::Iso14443_3a(_) => ProtocolType::Iso14443_3a,
            Self::Iso14443_4a(_) => ProtocolType::Iso14443_4a,
            Self::MfClassic(_) => ProtocolType::MfClassic,
        }
    }

    /// The ISO14443-3A identity every family carries.
    pub fn iso14443_3a(&self) -> &Iso14443_3aData {
        match self {
            Self::Iso14443_3a(data) => data,
            Self::Iso14443_4a(data) => &data.iso14443_3a,
            Self::MfClassic(data) => &data.iso14443_3a,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.iso14443_3a().uid
    }

    /// `(blocks_read, blocks_total)` for families with a memory dump.
    pub fn read_progress(&self) -> Option<(usize, usize)> {
        match self {
            Self::MfClassic(data) => Some((data.blocks_read(), data.blocks_total())),
            _ => None,
        }
    }

    /// Whether everything the card holds was read.
    pub fn is_complete(&self) -> bool {
        self.read_progress()
            .is_none_or(|(read, total)| read == total)
    }

    /// Write `Device type` followed by the family's fields.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` for fields that cannot be encoded.
    pub fn save(&self, writer: &mut impl FormatWriter) -> Result<()> {
        writer.write_comment("Device type can be ISO14443-3A, ISO14443-4A, Mifare Classic");
        writer.write_string(DEVICE_TYPE_KEY, self.protocol().name());
        match self {
            Self::Iso14443_3a(data) => data.save(writer),
            Self::Iso14443_4a(data) => data.save(writer)?,
            Self::MfClassic(data) => data.save(writer),
        }
        Ok(())
    }

    /// Read the fields written by [`save`](Self::save).
    ///
    /// # Errors
    /// Returns `Error::Format` for an unknown device type or malformed
    /// family fields.
    pub fn load(reader: &mut impl FormatReader) -> Result<Self> {
        let protocol: ProtocolType = reader.read_string(DEVICE_TYPE_KEY)?.parse()?;
        Ok(match protocol {
            ProtocolType::Iso14443_3a => Self::Iso14443_3a(Iso14443_3aData::load(reader)?),
            ProtocolType::Iso14443_4a => Self::Iso14443_4a(Iso14443_4aData::load(reader)?),
            ProtocolType::MfClassic => Self::MfClassic(MfClassicData::load(reader)?),
        })
    }
}

impl From<Iso14443_3aData> for ProtocolData {
    fn from(data: Iso14443_3aData) -> Self {
        Self::Iso14443_3a(data)
    }
}

impl From<Iso14443_4aData> for ProtocolData {
    fn from(data: Iso14443_4aData) -> Self {
        Self::Iso14443_4a(data)
    }
}

impl From<MfClassicData> for ProtocolData {
    fn from(data: MfClassicData) -> Self {
        Self::MfClassic(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso14443_4a::ats_fill_default;
    use crate::mf_classic::MfClassicType;
    use tapkit_core::format::KeyValueFile;

    fn base() -> Iso14443_3aData {
        Iso14443_3aData::new(
            Uid::new(&[0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]).unwrap(),
            [0x44, 0x00],
            0x20,
        )
    }

    #[test]
    fn test_save_load_iso14443_4a() {
        let data = ProtocolData::from(Iso14443_4aData {
            iso14443_3a: base(),
            ats: Some(ats_fill_default()),
        });
        let mut file = KeyValueFile::new();
        data.save(&mut file).unwrap();
        assert!(file.to_text().contains("Device type: ISO14443-4A"));

        let mut parsed = KeyValueFile::parse(&file.to_text()).unwrap();
        assert_eq!(ProtocolData::load(&mut parsed).unwrap(), data);
    }

    #[test]
    fn test_partial_dump_is_not_complete() {
        let mut dump = MfClassicData::new(base(), MfClassicType::Mini);
        dump.set_block_read(1, &[0x11; 16]).unwrap();
        let data = ProtocolData::from(dump);

        assert_eq!(data.protocol(), ProtocolType::MfClassic);
        assert_eq!(data.read_progress(), Some((1, 20)));
        assert!(!data.is_complete());
        assert!(ProtocolData::from(base()).is_complete());
    }

    #[test]
    fn test_unknown_device_type() {
        let mut file = KeyValueFile::parse("Device type: Felica\n").unwrap();
        assert!(ProtocolData::load(&mut file).is_err());
    }
}
