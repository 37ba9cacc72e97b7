//! # Word/byte order for 32-bit register pairs
//!
//! Uses ABCD notation, A being the most significant byte of the value.
//! Registers arrive as two big-endian words `[w0, w1]` = `[AB, CD]` when
//! the device stores values naturally.
//!
//! For 32-bit value `0x12345678` the words on the wire are:
//! - `AB_CD`: \[0x1234, 0x5678\]
//! - `CD_AB`: \[0x5678, 0x1234\] (word swapped)
//! - `DC_BA`: \[0x7856, 0x3412\] (word and byte swapped)
//!
//! 16-bit values are never reordered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModbusError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Natural big-endian order
    #[default]
    #[serde(rename = "AB_CD", alias = "ABCD")]
    AbCd,
    /// Low word first
    #[serde(rename = "CD_AB", alias = "CDAB")]
    CdAb,
    /// Fully reversed
    #[serde(rename = "DC_BA", alias = "DCBA")]
    DcBa,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbCd => "AB_CD",
            Self::CdAb => "CD_AB",
            Self::DcBa => "DC_BA",
        }
    }

    /// Value bytes (A, B, C, D) from two registers as received
    #[inline]
    pub fn words_to_bytes(&self, words: [u16; 2]) -> [u8; 4] {
        let [a0, a1] = words[0].to_be_bytes();
        let [b0, b1] = words[1].to_be_bytes();
        match self {
            Self::AbCd => [a0, a1, b0, b1],
            Self::CdAb => [b0, b1, a0, a1],
            Self::DcBa => [b1, b0, a1, a0],
        }
    }

    /// Registers as the device would hold them for value bytes (A, B, C, D)
    #[inline]
    pub fn bytes_to_words(&self, bytes: [u8; 4]) -> [u16; 2] {
        let [a, b, c, d] = bytes;
        match self {
            Self::AbCd => [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
            Self::CdAb => [u16::from_be_bytes([c, d]), u16::from_be_bytes([a, b])],
            Self::DcBa => [u16::from_be_bytes([d, c]), u16::from_be_bytes([b, a])],
        }
    }

    #[inline]
    pub fn words_to_u32(&self, words: [u16; 2]) -> u32 {
        u32::from_be_bytes(self.words_to_bytes(words))
    }

    #[inline]
    pub fn u32_to_words(&self, value: u32) -> [u16; 2] {
        self.bytes_to_words(value.to_be_bytes())
    }
}

impl FromStr for ByteOrder {
    type Err = ModbusError;

    /// Accepts "AB_CD", "AB-CD", "abcd" and the like
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" => Ok(Self::AbCd),
            "CDAB" => Ok(Self::CdAb),
            "DCBA" => Ok(Self::DcBa),
            _ => Err(ModbusError::configuration(format!(
                "Unknown byte order '{}' (expected AB_CD, CD_AB or DC_BA)",
                s
            ))),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_word_layouts() {
        assert_eq!(ByteOrder::AbCd.u32_to_words(0x12345678), [0x1234, 0x5678]);
        assert_eq!(ByteOrder::CdAb.u32_to_words(0x12345678), [0x5678, 0x1234]);
        assert_eq!(ByteOrder::DcBa.u32_to_words(0x12345678), [0x7856, 0x3412]);
    }

    #[test]
    fn test_cd_ab_scenario() {
        assert_eq!(ByteOrder::CdAb.words_to_u32([0x0001, 0x0002]), 0x0002_0001);
        assert_eq!(ByteOrder::CdAb.words_to_u32([0x0001, 0x0002]), 131073);
        assert_eq!(ByteOrder::AbCd.words_to_u32([0x0001, 0x0002]), 0x0001_0002);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("AB_CD".parse::<ByteOrder>().unwrap(), ByteOrder::AbCd);
        assert_eq!("cd-ab".parse::<ByteOrder>().unwrap(), ByteOrder::CdAb);
        assert_eq!("DCBA".parse::<ByteOrder>().unwrap(), ByteOrder::DcBa);
        assert!("BADC".parse::<ByteOrder>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let order: ByteOrder = serde_yaml::from_str("CD_AB").unwrap();
        assert_eq!(order, ByteOrder::CdAb);
        assert_eq!(serde_yaml::to_string(&ByteOrder::DcBa).unwrap().trim(), "DC_BA");
        assert_eq!(ByteOrder::default(), ByteOrder::AbCd);
    }

    proptest! {
        #[test]
        fn prop_u32_round_trip(value in any::<u32>()) {
            for order in [ByteOrder::AbCd, ByteOrder::CdAb, ByteOrder::DcBa] {
                prop_assert_eq!(order.words_to_u32(order.u32_to_words(value)), value);
            }
        }
    }
}
