//! # Datapoint Types
//!
//! A datapoint type (DPT) tells how the value bytes of a group address are to be
//! interpreted. Types are written `main.sub` in the configuration (`9.001`), or
//! `main.*` / `main.xxx` when only the wire encoding matters.
//!
//! The [`codec`] module converts between value bytes and [`DatapointValue`].

pub mod codec;

pub use codec::{decode, encode};

use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Wire encoding family, identified by the DPT main number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DptFamily {
    /// 1.xxx: one bit
    Boolean,
    /// 5.xxx: 8-bit unsigned, optionally scaled
    Unsigned8,
    /// 6.xxx: 8-bit two's complement
    Signed8,
    /// 7.xxx
    Unsigned16,
    /// 8.xxx
    Signed16,
    /// 9.xxx: 2-byte KNX float
    Float16,
    /// 12.xxx
    Unsigned32,
    /// 13.xxx
    Signed32,
    /// 14.xxx: IEEE-754 single precision
    Float32,
    /// 16.xxx: 14 character string
    String14,
    /// 17.xxx: scene number 0..=63
    SceneNumber,
    /// 20.xxx: 8-bit enumeration
    Enum8,
}

impl DptFamily {
    fn from_main(main: u16) -> Option<Self> {
        let family = match main {
            1 => DptFamily::Boolean,
            5 => DptFamily::Unsigned8,
            6 => DptFamily::Signed8,
            7 => DptFamily::Unsigned16,
            8 => DptFamily::Signed16,
            9 => DptFamily::Float16,
            12 => DptFamily::Unsigned32,
            13 => DptFamily::Signed32,
            14 => DptFamily::Float32,
            16 => DptFamily::String14,
            17 => DptFamily::SceneNumber,
            20 => DptFamily::Enum8,
            _ => return None,
        };
        Some(family)
    }

    pub fn main(self) -> u16 {
        match self {
            DptFamily::Boolean => 1,
            DptFamily::Unsigned8 => 5,
            DptFamily::Signed8 => 6,
            DptFamily::Unsigned16 => 7,
            DptFamily::Signed16 => 8,
            DptFamily::Float16 => 9,
            DptFamily::Unsigned32 => 12,
            DptFamily::Signed32 => 13,
            DptFamily::Float32 => 14,
            DptFamily::String14 => 16,
            DptFamily::SceneNumber => 17,
            DptFamily::Enum8 => 20,
        }
    }

    /// Number of value bytes on the wire.
    pub fn width(self) -> usize {
        match self {
            DptFamily::Boolean
            | DptFamily::Unsigned8
            | DptFamily::Signed8
            | DptFamily::SceneNumber
            | DptFamily::Enum8 => 1,
            DptFamily::Unsigned16 | DptFamily::Signed16 | DptFamily::Float16 => 2,
            DptFamily::Unsigned32 | DptFamily::Signed32 | DptFamily::Float32 => 4,
            DptFamily::String14 => 14,
        }
    }

    /// Sub numbers defined for the family.
    fn accepts_sub(self, sub: u16) -> bool {
        match self {
            DptFamily::Boolean => (1..=24).contains(&sub) || sub == 100,
            DptFamily::Unsigned8 => matches!(sub, 1 | 3 | 4 | 5 | 6 | 10 | 100),
            DptFamily::Signed8 => matches!(sub, 1 | 10 | 20),
            DptFamily::Unsigned16 => (1..=13).contains(&sub) || sub == 600,
            DptFamily::Signed16 => (1..=12).contains(&sub),
            DptFamily::Float16 => (1..=11).contains(&sub) || (20..=29).contains(&sub),
            DptFamily::Unsigned32 => matches!(sub, 1 | 100 | 101 | 102 | 1200 | 1201),
            DptFamily::Signed32 => {
                matches!(sub, 1 | 2 | 100 | 1200 | 1201) || (10..=16).contains(&sub)
            }
            DptFamily::Float32 => sub <= 79 || sub == 1200 || sub == 1201,
            DptFamily::String14 => sub <= 1,
            DptFamily::SceneNumber => sub == 1,
            DptFamily::Enum8 => matches!(
                sub,
                1..=8
                    | 11..=14
                    | 17
                    | 20..=22
                    | 100..=116
                    | 120..=122
                    | 600..=613
                    | 801..=804
                    | 1000..=1005
                    | 1200..=1209
            ),
        }
    }
}

/// A configured datapoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatapointType {
    pub family: DptFamily,
    /// `None` for wildcard notation (`9.*`).
    pub sub: Option<u16>,
}

impl DatapointType {
    pub fn new(family: DptFamily, sub: u16) -> Self {
        DatapointType {
            family,
            sub: Some(sub),
        }
    }

    pub fn width(&self) -> usize {
        self.family.width()
    }

    /// Value that the raw maximum 255 maps to, if the type is fixed-point
    /// (5.001 percent, 5.003 angle).
    pub fn full_scale(&self) -> Option<f64> {
        match (self.family, self.sub) {
            (DptFamily::Unsigned8, Some(1)) => Some(100.0),
            (DptFamily::Unsigned8, Some(3)) => Some(360.0),
            _ => None,
        }
    }

    /// True for string types, which are exported as info-style metrics.
    pub fn is_text(&self) -> bool {
        self.family == DptFamily::String14
    }
}

impl FromStr for DatapointType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || BridgeError::UnknownDatapointType(s.to_string());
        let text = s.trim();
        let text = text
            .strip_prefix("DPT-")
            .or_else(|| text.strip_prefix("DPT"))
            .unwrap_or(text);
        let (main, sub) = text.split_once('.').ok_or_else(unknown)?;
        let main: u16 = main.trim().parse().map_err(|_| unknown())?;
        let family = DptFamily::from_main(main).ok_or_else(unknown)?;
        let sub = match sub.trim() {
            "*" | "xxx" => None,
            digits => {
                let sub: u16 = digits.parse().map_err(|_| unknown())?;
                if !family.accepts_sub(sub) {
                    return Err(unknown());
                }
                Some(sub)
            }
        };
        Ok(DatapointType { family, sub })
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "{}.{:03}", self.family.main(), sub),
            None => write!(f, "{}.*", self.family.main()),
        }
    }
}

impl Serialize for DatapointType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatapointType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A decoded datapoint value.
#[derive(Debug, Clone, PartialEq)]
pub enum DatapointValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Enum(u8),
}

impl DatapointValue {
    /// Numeric projection used for metric samples. Text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatapointValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            DatapointValue::Int(i) => Some(*i as f64),
            DatapointValue::Float(f) => Some(*f),
            DatapointValue::Enum(e) => Some(f64::from(*e)),
            DatapointValue::Text(_) => None,
        }
    }
}

impl fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatapointValue::Bool(b) => write!(f, "{b}"),
            DatapointValue::Int(i) => write!(f, "{i}"),
            DatapointValue::Float(v) => write!(f, "{v}"),
            DatapointValue::Text(t) => write!(f, "{t:?}"),
            DatapointValue::Enum(e) => write!(f, "#{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dpt_notations() {
        let dpt: DatapointType = "9.001".parse().unwrap();
        assert_eq!(dpt.family, DptFamily::Float16);
        assert_eq!(dpt.sub, Some(1));
        assert_eq!(dpt.to_string(), "9.001");

        let dpt: DatapointType = "14.*".parse().unwrap();
        assert_eq!(dpt.family, DptFamily::Float32);
        assert_eq!(dpt.sub, None);
        assert_eq!(dpt.to_string(), "14.*");

        let dpt: DatapointType = "DPT-5.xxx".parse().unwrap();
        assert_eq!(dpt.family, DptFamily::Unsigned8);

        for text in ["20.001", "20.102", "20.613", "20.1005", "20.1209"] {
            let dpt: DatapointType = text.parse().unwrap();
            assert_eq!(dpt, DatapointType::new(DptFamily::Enum8, dpt.sub.unwrap()));
        }
    }

    #[test]
    fn test_unknown_dpt() {
        for text in [
            "2.001", "9", "1.999", "abc", "5.002", "17.002", "20.000", "20.009", "20.500",
            "20.1210",
        ] {
            let err = text.parse::<DatapointType>().unwrap_err();
            assert!(
                matches!(err, BridgeError::UnknownDatapointType(_)),
                "{text} parsed"
            );
        }
    }

    #[test]
    fn test_scale_and_width() {
        let percent: DatapointType = "5.001".parse().unwrap();
        assert_eq!(percent.full_scale(), Some(100.0));
        assert_eq!(percent.width(), 1);
        let counter: DatapointType = "12.001".parse().unwrap();
        assert!(counter.full_scale().is_none());
        assert_eq!(counter.width(), 4);
        assert!("16.001".parse::<DatapointType>().unwrap().is_text());
    }

    #[test]
    fn test_value_projection() {
        assert_eq!(DatapointValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(DatapointValue::Int(-4).as_f64(), Some(-4.0));
        assert_eq!(DatapointValue::Enum(3).as_f64(), Some(3.0));
        assert_eq!(DatapointValue::Text("x".into()).as_f64(), None);
    }
}
