//! # Group Telegrams
//!
//! A telegram is one group communication event observed on the bus. This module
//! also packs and unpacks the application layer PDU (APDU) that carries the
//! group value service and its data.

use crate::constants::{
    APCI_GROUP_VALUE_READ, APCI_GROUP_VALUE_RESPONSE, APCI_GROUP_VALUE_WRITE,
    APCI_SHORT_DATA_MASK,
};
use crate::error::BridgeError;
use crate::knx::address::{GroupAddress, IndividualAddress};

/// Group value service of a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramKind {
    Read,
    Response,
    Write,
}

/// One inbound group telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub source: Option<IndividualAddress>,
    pub destination: GroupAddress,
    pub kind: TelegramKind,
    /// Value bytes. Values of six bits or less travel inside the APCI byte and
    /// are delivered here as a single byte.
    pub payload: Vec<u8>,
}

impl Telegram {
    pub fn write(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Telegram {
            source: None,
            destination,
            kind: TelegramKind::Write,
            payload,
        }
    }

    pub fn response(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Telegram {
            source: None,
            destination,
            kind: TelegramKind::Response,
            payload,
        }
    }

    pub fn read(destination: GroupAddress) -> Self {
        Telegram {
            source: None,
            destination,
            kind: TelegramKind::Read,
            payload: Vec::new(),
        }
    }

    /// True if the telegram carries a value (write or response).
    pub fn carries_value(&self) -> bool {
        matches!(self.kind, TelegramKind::Write | TelegramKind::Response)
    }
}

/// Splits an APDU into its group value service and value bytes.
pub fn parse_apdu(apdu: &[u8]) -> Result<(TelegramKind, Vec<u8>), BridgeError> {
    if apdu.len() < 2 {
        return Err(BridgeError::Transport(format!(
            "APDU too short: {} bytes",
            apdu.len()
        )));
    }
    let apci = ((apdu[0] & 0x03) << 2) | (apdu[1] >> 6);
    let kind = match apci {
        APCI_GROUP_VALUE_READ => TelegramKind::Read,
        APCI_GROUP_VALUE_RESPONSE => TelegramKind::Response,
        APCI_GROUP_VALUE_WRITE => TelegramKind::Write,
        other => {
            return Err(BridgeError::Transport(format!(
                "unsupported APCI 0x{other:X}"
            )))
        }
    };
    let payload = match kind {
        TelegramKind::Read => Vec::new(),
        _ if apdu.len() == 2 => vec![apdu[1] & APCI_SHORT_DATA_MASK],
        _ => apdu[2..].to_vec(),
    };
    Ok((kind, payload))
}

/// Packs a group value service and its value bytes into an APDU.
///
/// Single-byte payloads that fit into six bits are carried inside the APCI byte.
pub fn pack_apdu(kind: TelegramKind, payload: &[u8]) -> Vec<u8> {
    let apci = match kind {
        TelegramKind::Read => APCI_GROUP_VALUE_READ,
        TelegramKind::Response => APCI_GROUP_VALUE_RESPONSE,
        TelegramKind::Write => APCI_GROUP_VALUE_WRITE,
    };
    let first = (apci >> 2) & 0x03;
    let second = (apci & 0x03) << 6;
    match payload {
        [] => vec![first, second],
        [short] if *short <= APCI_SHORT_DATA_MASK => vec![first, second | short],
        long => {
            let mut apdu = Vec::with_capacity(2 + long.len());
            apdu.push(first);
            apdu.push(second);
            apdu.extend_from_slice(long);
            apdu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_apdu() {
        let (kind, payload) = parse_apdu(&[0x00, 0x00]).unwrap();
        assert_eq!(kind, TelegramKind::Read);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_short_write() {
        let (kind, payload) = parse_apdu(&[0x00, 0x81]).unwrap();
        assert_eq!(kind, TelegramKind::Write);
        assert_eq!(payload, vec![0x01]);
    }

    #[test]
    fn test_parse_long_response() {
        let (kind, payload) = parse_apdu(&[0x00, 0x40, 0x0C, 0x1A]).unwrap();
        assert_eq!(kind, TelegramKind::Response);
        assert_eq!(payload, vec![0x0C, 0x1A]);
    }

    #[test]
    fn test_parse_rejects_other_services() {
        assert!(parse_apdu(&[0x03, 0x00]).is_err());
        assert!(parse_apdu(&[0x00]).is_err());
    }

    #[test]
    fn test_pack_apdu() {
        assert_eq!(pack_apdu(TelegramKind::Read, &[]), vec![0x00, 0x00]);
        assert_eq!(pack_apdu(TelegramKind::Write, &[0x01]), vec![0x00, 0x81]);
        assert_eq!(
            pack_apdu(TelegramKind::Response, &[0x0C, 0x1A]),
            vec![0x00, 0x40, 0x0C, 0x1A]
        );
        // 8-bit values do not fit the APCI byte
        assert_eq!(
            pack_apdu(TelegramKind::Write, &[0xFF]),
            vec![0x00, 0x80, 0xFF]
        );
    }
}
