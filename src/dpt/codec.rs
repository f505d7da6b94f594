//! # Datapoint Encoding and Decoding
//!
//! Pure conversions between group value bytes and [`DatapointValue`]. All
//! multi-byte values are big-endian on the wire.

use super::{DatapointType, DatapointValue, DptFamily};
use crate::error::BridgeError;

/// Largest magnitude representable by a 2-byte KNX float.
const FLOAT16_MAX: f64 = 670_760.96;
const FLOAT16_MIN: f64 = -671_088.64;
/// Raw value reserved for "invalid data".
const FLOAT16_INVALID: u16 = 0x7FFF;

const SCENE_NUMBER_MAX: u8 = 63;

fn malformed(dpt: DatapointType, reason: impl Into<String>) -> BridgeError {
    BridgeError::MalformedPayload {
        dpt: dpt.to_string(),
        reason: reason.into(),
    }
}

fn out_of_range(dpt: DatapointType, value: impl ToString) -> BridgeError {
    BridgeError::ValueOutOfRange {
        dpt: dpt.to_string(),
        value: value.to_string(),
    }
}

/// Decodes group value bytes according to `dpt`.
pub fn decode(bytes: &[u8], dpt: DatapointType) -> Result<DatapointValue, BridgeError> {
    if bytes.len() != dpt.width() {
        return Err(malformed(
            dpt,
            format!("expected {} bytes, got {}", dpt.width(), bytes.len()),
        ));
    }

    let value = match dpt.family {
        DptFamily::Boolean => match bytes[0] {
            0 => DatapointValue::Bool(false),
            1 => DatapointValue::Bool(true),
            other => return Err(out_of_range(dpt, other)),
        },
        DptFamily::Unsigned8 => match dpt.full_scale() {
            Some(full) => DatapointValue::Float(f64::from(bytes[0]) * full / 255.0),
            None => DatapointValue::Int(i64::from(bytes[0])),
        },
        DptFamily::Signed8 => DatapointValue::Int(i64::from(bytes[0] as i8)),
        DptFamily::Unsigned16 => {
            DatapointValue::Int(i64::from(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        DptFamily::Signed16 => {
            DatapointValue::Int(i64::from(i16::from_be_bytes([bytes[0], bytes[1]])))
        }
        DptFamily::Float16 => {
            let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
            DatapointValue::Float(decode_float16(raw).ok_or_else(|| out_of_range(dpt, raw))?)
        }
        DptFamily::Unsigned32 => DatapointValue::Int(i64::from(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DptFamily::Signed32 => DatapointValue::Int(i64::from(i32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DptFamily::Float32 => DatapointValue::Float(f64::from(f32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DptFamily::String14 => DatapointValue::Text(decode_string(bytes, dpt)?),
        DptFamily::SceneNumber => {
            if bytes[0] > SCENE_NUMBER_MAX {
                return Err(out_of_range(dpt, bytes[0]));
            }
            DatapointValue::Enum(bytes[0])
        }
        DptFamily::Enum8 => DatapointValue::Enum(bytes[0]),
    };
    Ok(value)
}

/// Encodes `value` into group value bytes according to `dpt`.
pub fn encode(value: &DatapointValue, dpt: DatapointType) -> Result<Vec<u8>, BridgeError> {
    match (dpt.family, value) {
        (DptFamily::Boolean, DatapointValue::Bool(b)) => Ok(vec![u8::from(*b)]),
        (DptFamily::Unsigned8, DatapointValue::Float(v)) if dpt.full_scale().is_some() => {
            let full = dpt.full_scale().unwrap_or(255.0);
            let raw = (v * 255.0 / full).round();
            if !(0.0..=255.0).contains(&raw) {
                return Err(out_of_range(dpt, v));
            }
            Ok(vec![raw as u8])
        }
        (DptFamily::Unsigned8, DatapointValue::Int(i)) if dpt.full_scale().is_none() => {
            let raw = u8::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(vec![raw])
        }
        (DptFamily::Signed8, DatapointValue::Int(i)) => {
            let raw = i8::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Unsigned16, DatapointValue::Int(i)) => {
            let raw = u16::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Signed16, DatapointValue::Int(i)) => {
            let raw = i16::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Float16, DatapointValue::Float(v)) => {
            let raw = encode_float16(*v).ok_or_else(|| out_of_range(dpt, v))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Unsigned32, DatapointValue::Int(i)) => {
            let raw = u32::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Signed32, DatapointValue::Int(i)) => {
            let raw = i32::try_from(*i).map_err(|_| out_of_range(dpt, i))?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (DptFamily::Float32, DatapointValue::Float(v)) => {
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(out_of_range(dpt, v));
            }
            Ok((*v as f32).to_be_bytes().to_vec())
        }
        (DptFamily::String14, DatapointValue::Text(text)) => encode_string(text, dpt),
        (DptFamily::SceneNumber, DatapointValue::Enum(e)) => {
            if *e > SCENE_NUMBER_MAX {
                return Err(out_of_range(dpt, e));
            }
            Ok(vec![*e])
        }
        (DptFamily::Enum8, DatapointValue::Enum(e)) => Ok(vec![*e]),
        (_, other) => Err(malformed(dpt, format!("cannot encode {other:?}"))),
    }
}

/// `0.01 * M * 2^E` with a 12-bit two's complement mantissa split around the
/// exponent: `MEEEEMMM MMMMMMMM`.
fn decode_float16(raw: u16) -> Option<f64> {
    if raw == FLOAT16_INVALID {
        return None;
    }
    let exponent = i32::from((raw >> 11) & 0x0F);
    let mut mantissa = i32::from(raw & 0x07FF);
    if raw & 0x8000 != 0 {
        mantissa -= 0x0800;
    }
    Some(f64::from(mantissa * (1 << exponent)) / 100.0)
}

fn encode_float16(value: f64) -> Option<u16> {
    if !value.is_finite() || !(FLOAT16_MIN..=FLOAT16_MAX).contains(&value) {
        return None;
    }
    let scaled = value * 100.0;
    for exponent in 0..=15u16 {
        let mantissa = (scaled / f64::from(1u32 << exponent)).round() as i32;
        if (-2048..=2047).contains(&mantissa) {
            let sign = if mantissa < 0 { 0x8000 } else { 0 };
            let bits = (mantissa as u16) & 0x07FF;
            let raw = sign | (exponent << 11) | bits;
            // Positive maximum would collide with the invalid marker.
            return (raw != FLOAT16_INVALID).then_some(raw);
        }
    }
    None
}

fn decode_string(bytes: &[u8], dpt: DatapointType) -> Result<String, BridgeError> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = &bytes[..end];
    match dpt.sub {
        // 16.001 is ISO 8859-1, which maps byte-for-byte onto Unicode
        Some(1) => Ok(text.iter().map(|b| char::from(*b)).collect()),
        _ => {
            if let Some(bad) = text.iter().find(|b| !b.is_ascii()) {
                return Err(out_of_range(dpt, format!("0x{bad:02X}")));
            }
            Ok(text.iter().map(|b| char::from(*b)).collect())
        }
    }
}

fn encode_string(text: &str, dpt: DatapointType) -> Result<Vec<u8>, BridgeError> {
    let latin1 = dpt.sub == Some(1);
    let mut bytes = Vec::with_capacity(dpt.width());
    for ch in text.chars() {
        let code = u32::from(ch);
        if code == 0 || code > 0xFF || (!latin1 && code > 0x7F) {
            return Err(out_of_range(dpt, text));
        }
        bytes.push(code as u8);
    }
    if bytes.len() > dpt.width() {
        return Err(out_of_range(dpt, text));
    }
    bytes.resize(dpt.width(), 0);
    Ok(bytes)
}
