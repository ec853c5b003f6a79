use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Card protocol families known to the engine.
///
/// Families form a tree: every Mifare Classic and every ISO14443-4A card is
/// also an ISO14443-3A card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Iso14443_3a,
    Iso14443_4a,
    MfClassic,
}

impl ProtocolType {
    /// All protocols, most generic first.
    pub const ALL: [ProtocolType; 3] = [Self::Iso14443_3a, Self::Iso14443_4a, Self::MfClassic];

    /// The protocol this one is layered on, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_core::ProtocolType;
    ///
    /// assert_eq!(ProtocolType::MfClassic.parent(), Some(ProtocolType::Iso14443_3a));
    /// assert_eq!(ProtocolType::Iso14443_3a.parent(), None);
    /// ```
    pub fn parent(&self) -> Option<ProtocolType> {
        match self {
            Self::Iso14443_3a => None,
            Self::Iso14443_4a | Self::MfClassic => Some(Self::Iso14443_3a),
        }
    }

    /// Whether `self` is `other` or layered (directly or not) on `other`.
    pub fn is_kind_of(&self, other: ProtocolType) -> bool {
        let mut current = Some(*self);
        while let Some(protocol) = current {
            if protocol == other {
                return true;
            }
            current = protocol.parent();
        }
        false
    }

    /// Name used in device files and user messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Iso14443_3a => "ISO14443-3A",
            Self::Iso14443_4a => "ISO14443-4A",
            Self::MfClassic => "Mifare Classic",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ProtocolType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|protocol| protocol.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::format(format!("Unknown device type: {s}")))
    }
}

/// Card unique identifier.
///
/// ISO14443-3A identifiers are single (4 bytes), double (7 bytes) or
/// triple (10 bytes) size; no other length can be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Uid(Vec<u8>);

impl Uid {
    pub const SINGLE: usize = 4;
    pub const DOUBLE: usize = 7;
    pub const TRIPLE: usize = 10;

    /// Create a UID with length validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` if the length is not 4, 7 or 10 bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_core::Uid;
    ///
    /// let uid = Uid::new(&[0x04, 0x01, 0x23, 0x45, 0x67, 0x89, 0x00]).unwrap();
    /// assert_eq!(uid.len(), 7);
    /// assert!(Uid::new(&[0x01, 0x02]).is_err());
    /// ```
    pub fn new(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            Self::SINGLE | Self::DOUBLE | Self::TRIPLE => Ok(Self(bytes.to_vec())),
            len => Err(Error::invalid_data(format!(
                "UID must be 4, 7 or 10 bytes, got {len}"
            ))),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of cascade levels needed to select this UID.
    #[must_use]
    pub fn cascade_levels(&self) -> usize {
        match self.0.len() {
            Self::SINGLE => 1,
            Self::DOUBLE => 2,
            _ => 3,
        }
    }

    /// Last four UID bytes as a big-endian word, as used by Crypto1.
    #[must_use]
    pub fn cuid(&self) -> u32 {
        let tail = &self.0[self.0.len() - 4..];
        u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]])
    }

    /// Upper-case hex with a space between bytes (`04 A1 B2 C3`).
    #[must_use]
    pub fn to_hex(&self) -> String {
        format_hex(&self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for Uid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uid::new(&parse_hex(s)?)
    }
}

impl TryFrom<Vec<u8>> for Uid {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Uid::new(&bytes)
    }
}

impl From<Uid> for Vec<u8> {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

/// Format bytes as upper-case hex pairs separated by spaces.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex text, ignoring whitespace between digits.
///
/// # Errors
/// Returns `Error::Format` on odd digit counts or non-hex characters.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| Error::format(format!("Invalid hex '{s}': {e}")))
}
