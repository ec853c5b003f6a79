//! Sector trailer access conditions.
//!
//! Each sector has four access groups (three data groups and the trailer),
//! each described by three bits C1 C2 C3. The trailer stores every bit twice,
//! once inverted:
//!
//! ```text
//! byte 6: !C2[3..0] !C1[3..0]
//! byte 7:  C1[3..0] !C3[3..0]
//! byte 8:  C3[3..0]  C2[3..0]
//! byte 9:  general purpose byte
//! ```

use super::{KeyType, blocks_in_sector, first_block, sector_of};
use tapkit_core::{Error, Result};

/// Transport configuration: data blocks open with either key, trailer
/// writable with key A.
pub const DEFAULT_ACCESS_BITS: [u8; 4] = [0xFF, 0x07, 0x80, 0x69];

/// Index of the trailer's access group.
pub const TRAILER_GROUP: usize = 3;

/// Permitted key for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Never,
    KeyA,
    KeyB,
    Both,
}

impl Permit {
    fn allows(self, key_type: KeyType) -> bool {
        matches!(
            (self, key_type),
            (Permit::Both, _) | (Permit::KeyA, KeyType::A) | (Permit::KeyB, KeyType::B)
        )
    }
}

/// Decoded access conditions of one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConditions {
    /// `C1 << 2 | C2 << 1 | C3` per group.
    groups: [u8; 4],
}

impl AccessConditions {
    /// Decode and cross-check the access bytes of a trailer.
    ///
    /// # Errors
    /// Returns `Error::InvalidData` when the inverted copies disagree.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_protocol::mf_classic::access::{AccessConditions, DEFAULT_ACCESS_BITS};
    ///
    /// let access = AccessConditions::parse(&DEFAULT_ACCESS_BITS).unwrap();
    /// assert_eq!(access.condition(3), 0b001);
    /// assert!(AccessConditions::parse(&[0x00, 0x00, 0x00, 0x00]).is_err());
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let [b6, b7, b8] = match bytes {
            [b6, b7, b8, ..] => [*b6, *b7, *b8],
            _ => return Err(Error::invalid_data("Access bits need 3 bytes")),
        };

        let c1 = b7 >> 4;
        let c2 = b8 & 0x0F;
        let c3 = b8 >> 4;
        let c1_inv = b6 & 0x0F;
        let c2_inv = b6 >> 4;
        let c3_inv = b7 & 0x0F;
        if c1 ^ c1_inv != 0x0F || c2 ^ c2_inv != 0x0F || c3 ^ c3_inv != 0x0F {
            return Err(Error::invalid_data(format!(
                "Inconsistent access bits {b6:02X} {b7:02X} {b8:02X}"
            )));
        }

        let mut groups = [0; 4];
        for (group, condition) in groups.iter_mut().enumerate() {
            *condition = (c1 >> group & 1) << 2 | (c2 >> group & 1) << 1 | (c3 >> group & 1);
        }
        Ok(Self { groups })
    }

    /// Build conditions from per-group `C1C2C3` values (each 0..=7).
    pub fn from_groups(groups: [u8; 4]) -> Self {
        Self {
            groups: groups.map(|condition| condition & 0x07),
        }
    }

    /// Encode into access bytes 6..=9.
    pub fn to_bytes(&self, general_purpose: u8) -> [u8; 4] {
        let (mut c1, mut c2, mut c3) = (0u8, 0u8, 0u8);
        for (group, condition) in self.groups.iter().enumerate() {
            c1 |= (condition >> 2 & 1) << group;
            c2 |= (condition >> 1 & 1) << group;
            c3 |= (condition & 1) << group;
        }
        [
            (!c2 & 0x0F) << 4 | (!c1 & 0x0F),
            c1 << 4 | (!c3 & 0x0F),
            c3 << 4 | c2,
            general_purpose,
        ]
    }

    /// `C1C2C3` of a group.
    pub fn condition(&self, group: usize) -> u8 {
        self.groups.get(group).copied().unwrap_or(0b111)
    }

    fn data_read(&self, group: usize) -> Permit {
        match self.condition(group) {
            0b000 | 0b010 | 0b100 | 0b110 | 0b001 => Permit::Both,
            0b011 | 0b101 => Permit::KeyB,
            _ => Permit::Never,
        }
    }

    fn data_write(&self, group: usize) -> Permit {
        match self.condition(group) {
            0b000 => Permit::Both,
            0b100 | 0b110 | 0b011 => Permit::KeyB,
            _ => Permit::Never,
        }
    }

    fn trailer_access_read(&self) -> Permit {
        match self.condition(TRAILER_GROUP) {
            0b000 | 0b010 | 0b001 => Permit::KeyA,
            _ => Permit::Both,
        }
    }

    fn trailer_keys_write(&self) -> Permit {
        match self.condition(TRAILER_GROUP) {
            0b000 | 0b001 => Permit::KeyA,
            0b100 | 0b011 => Permit::KeyB,
            _ => Permit::Never,
        }
    }

    /// Whether key B can be read back from the trailer (and therefore is
    /// stored as plain data rather than used as a key).
    pub fn is_key_b_readable(&self) -> bool {
        matches!(self.condition(TRAILER_GROUP), 0b000 | 0b010 | 0b001)
    }

    /// Whether `key_type` may READ `block`.
    pub fn can_read(&self, block: u8, key_type: KeyType) -> bool {
        match access_group(block) {
            TRAILER_GROUP => self.trailer_access_read().allows(key_type),
            group => self.data_read(group).allows(key_type),
        }
    }

    /// Whether `key_type` may WRITE `block`. Trailers count as writable when
    /// their keys are.
    pub fn can_write(&self, block: u8, key_type: KeyType) -> bool {
        match access_group(block) {
            TRAILER_GROUP => self.trailer_keys_write().allows(key_type),
            group => self.data_write(group).allows(key_type),
        }
    }
}

impl Default for AccessConditions {
    fn default() -> Self {
        Self::from_groups([0b000, 0b000, 0b000, 0b001])
    }
}

/// Access group governing `block` within its sector.
pub fn access_group(block: u8) -> usize {
    let sector = sector_of(block);
    let offset = usize::from(block - first_block(sector));
    if blocks_in_sector(sector) == 4 {
        offset
    } else if offset == 15 {
        TRAILER_GROUP
    } else {
        offset / 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_round_trip() {
        let access = AccessConditions::parse(&DEFAULT_ACCESS_BITS).unwrap();
        assert_eq!(access, AccessConditions::default());
        assert_eq!(access.to_bytes(0x69), DEFAULT_ACCESS_BITS);
    }

    #[test]
    fn test_encode_read_only_sector() {
        let access = AccessConditions::from_groups([0b010, 0b010, 0b010, 0b110]);
        let bytes = access.to_bytes(0x00);
        assert_eq!(AccessConditions::parse(&bytes).unwrap(), access);
    }

    #[test]
    fn test_rejects_inconsistent_bits() {
        let mut bytes = DEFAULT_ACCESS_BITS;
        bytes[1] ^= 0x10;
        assert!(AccessConditions::parse(&bytes).is_err());
        assert!(AccessConditions::parse(&[0xFF]).is_err());
    }

    #[rstest]
    #[case(0b000, true, true, true, true)]
    #[case(0b010, true, true, false, false)]
    #[case(0b100, true, true, false, true)]
    #[case(0b011, false, true, false, true)]
    #[case(0b101, false, true, false, false)]
    #[case(0b001, true, true, false, false)]
    #[case(0b111, false, false, false, false)]
    fn test_data_permissions(
        #[case] condition: u8,
        #[case] read_a: bool,
        #[case] read_b: bool,
        #[case] write_a: bool,
        #[case] write_b: bool,
    ) {
        let access = AccessConditions::from_groups([condition, 0, 0, 0b001]);
        assert_eq!(access.can_read(0, KeyType::A), read_a);
        assert_eq!(access.can_read(0, KeyType::B), read_b);
        assert_eq!(access.can_write(0, KeyType::A), write_a);
        assert_eq!(access.can_write(0, KeyType::B), write_b);
    }

    #[test]
    fn test_trailer_permissions() {
        let transport = AccessConditions::default();
        assert!(transport.can_read(3, KeyType::A));
        assert!(!transport.can_read(3, KeyType::B));
        assert!(transport.can_write(3, KeyType::A));
        assert!(transport.is_key_b_readable());

        let locked = AccessConditions::from_groups([0, 0, 0, 0b011]);
        assert!(locked.can_read(3, KeyType::B));
        assert!(locked.can_write(3, KeyType::B));
        assert!(!locked.can_write(3, KeyType::A));
        assert!(!locked.is_key_b_readable());
    }

    #[rstest]
    #[case(4, 0)]
    #[case(6, 2)]
    #[case(7, TRAILER_GROUP)]
    #[case(128, 0)]
    #[case(133, 1)]
    #[case(142, 2)]
    #[case(143, TRAILER_GROUP)]
    fn test_access_group(#[case] block: u8, #[case] group: usize) {
        assert_eq!(access_group(block), group);
    }
}
