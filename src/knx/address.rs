//! # KNX Addressing
//!
//! Group addresses identify a monitored point on the bus; individual addresses
//! identify the device that sent a telegram.

use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 3-level group address `main/middle/sub` (5/3/8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress(u16);

impl GroupAddress {
    pub const MAX_MAIN: u8 = 31;
    pub const MAX_MIDDLE: u8 = 7;

    /// Builds an address from its three levels.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self, BridgeError> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(BridgeError::InvalidGroupAddress(format!(
                "{main}/{middle}/{sub}"
            )));
        }
        Ok(GroupAddress(
            (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub),
        ))
    }

    /// Wraps a raw 16-bit bus address.
    pub const fn from_raw(raw: u16) -> Self {
        GroupAddress(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn main(self) -> u8 {
        (self.0 >> 11) as u8 & 0x1F
    }

    pub fn middle(self) -> u8 {
        (self.0 >> 8) as u8 & 0x07
    }

    pub fn sub(self) -> u8 {
        self.0 as u8
    }
}

impl FromStr for GroupAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BridgeError::InvalidGroupAddress(s.to_string());
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut levels = [0u8; 3];
        for (level, part) in levels.iter_mut().zip(&parts) {
            *level = part.trim().parse().map_err(|_| invalid())?;
        }
        GroupAddress::new(levels[0], levels[1], levels[2]).map_err(|_| invalid())
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The physical address `area.line.device` of a bus member (4/4/8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    pub const fn from_raw(raw: u16) -> Self {
        IndividualAddress(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl FromStr for IndividualAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BridgeError::InvalidConfig(format!("invalid physical address: {s}"));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let area: u8 = parts[0].parse().map_err(|_| invalid())?;
        let line: u8 = parts[1].parse().map_err(|_| invalid())?;
        let device: u8 = parts[2].parse().map_err(|_| invalid())?;
        if area > 15 || line > 15 {
            return Err(invalid());
        }
        Ok(IndividualAddress(
            (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device),
        ))
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0 >> 12, (self.0 >> 8) & 0x0F, self.0 & 0xFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_group_address() {
        let addr: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.middle(), 2);
        assert_eq!(addr.sub(), 3);
        assert_eq!(addr.raw(), 0x0A03);
        assert_eq!(addr.to_string(), "1/2/3");
    }

    #[test]
    fn test_group_address_limits() {
        assert!("31/7/255".parse::<GroupAddress>().is_ok());
        assert!("32/0/0".parse::<GroupAddress>().is_err());
        assert!("0/8/0".parse::<GroupAddress>().is_err());
        assert!("0/0/256".parse::<GroupAddress>().is_err());
        assert!("1/2".parse::<GroupAddress>().is_err());
        assert!("a/b/c".parse::<GroupAddress>().is_err());
    }

    #[test]
    fn test_raw_round_trip() {
        let addr = GroupAddress::new(31, 7, 255).unwrap();
        assert_eq!(GroupAddress::from_raw(addr.raw()), addr);
        assert_eq!(addr.raw(), 0xFFFF);
    }

    #[test]
    fn test_individual_address() {
        let addr: IndividualAddress = "1.1.20".parse().unwrap();
        assert_eq!(addr.raw(), 0x1114);
        assert_eq!(addr.to_string(), "1.1.20");
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
    }

    #[test]
    fn test_group_address_serde() {
        let addr: GroupAddress = serde_yaml::from_str("\"5/1/9\"").unwrap();
        assert_eq!(addr, GroupAddress::new(5, 1, 9).unwrap());
        let text = serde_yaml::to_string(&addr).unwrap();
        assert_eq!(text.trim(), "5/1/9");
    }
}
