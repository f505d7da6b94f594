//! Datapoint decoding through the crate's top-level helpers, using payloads as
//! they appear on a real installation.

use knx_bridge::{decode_value, encode_value, BridgeError, DatapointValue};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_decode_typical_payloads() {
    assert_eq!(decode_value(&[0x01], "1.001").unwrap(), DatapointValue::Bool(true));
    assert_eq!(decode_value(&[0x80], "5.001").unwrap().as_f64().map(f64::round), Some(50.0));
    assert_eq!(decode_value(&[0x0C, 0x1A], "9.001").unwrap(), DatapointValue::Float(21.0));
    assert_eq!(
        decode_value(&[0x00, 0x00, 0x04, 0xD2], "13.010").unwrap(),
        DatapointValue::Int(1234)
    );
    assert_eq!(
        decode_value(b"KNX is OK\0\0\0\0\0", "16.000").unwrap(),
        DatapointValue::Text("KNX is OK".to_string())
    );
    assert_eq!(decode_value(&[0x05], "17.001").unwrap(), DatapointValue::Enum(5));
}

#[test]
fn test_decode_errors() {
    assert!(matches!(
        decode_value(&[0x0C], "9.001"),
        Err(BridgeError::MalformedPayload { .. })
    ));
    assert!(matches!(
        decode_value(&[0x40], "17.001"),
        Err(BridgeError::ValueOutOfRange { .. })
    ));
    assert!(matches!(
        decode_value(&[0x01], "3.007"),
        Err(BridgeError::UnknownDatapointType(_))
    ));
}

#[test]
fn test_encode_then_decode_temperature() {
    let bytes = assert_ok!(encode_value(&DatapointValue::Float(-5.5), "9.001"));
    let value = assert_ok!(decode_value(&bytes, "9.001")).as_f64().unwrap();
    assert!((value + 5.5).abs() <= 0.02);
}

#[test]
fn test_encode_rejects_unrepresentable_values() {
    assert_err!(encode_value(&DatapointValue::Float(1.0e9), "9.001"));
    assert_err!(encode_value(&DatapointValue::Enum(64), "17.001"));
    assert_err!(encode_value(&DatapointValue::Text("x".into()), "1.001"));
}
