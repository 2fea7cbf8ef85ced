// src/collate.rs
// Order-preserving binary encoding for JSON view keys.
//
// The engine orders keys by raw bytes, so emitted view keys are encoded
// such that byte order equals CouchDB's view collation:
//   null < false < true < numbers < strings < arrays < objects
// Numbers collate numerically across the int/float divide, strings and
// arrays lexicographically, objects by their key/value pairs.

use serde_json::{Map, Number, Value};

const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

const TERMINATOR: u8 = 0x00;

/// Encode a JSON value into its collation byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(n.as_f64().unwrap_or(0.0)));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            encode_bytes(s.as_bytes(), out);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out);
            }
            out.push(TERMINATOR);
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            for (k, v) in map {
                out.push(TAG_STRING);
                encode_bytes(k.as_bytes(), out);
                encode_into(v, out);
            }
            out.push(TERMINATOR);
        }
    }
}

// Zero bytes are escaped as 0x00 0xFF so the 0x00 terminator stays
// smaller than any continuation of the string.
fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(TERMINATOR);
}

// Sign-aware bit flip: negative floats flip completely, positive floats
// flip the sign bit, making the big-endian bytes order like the values.
fn encode_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let bits = if v.is_sign_negative() {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    bits.to_be_bytes()
}

fn decode_f64(bytes: [u8; 8]) -> f64 {
    let bits = u64::from_be_bytes(bytes);
    let bits = if bits & (1u64 << 63) != 0 {
        bits ^ (1u64 << 63)
    } else {
        !bits
    };
    f64::from_bits(bits)
}

/// Decode a collation byte form back into a JSON value.
/// Returns `None` on malformed input.
pub fn decode(bytes: &[u8]) -> Option<Value> {
    let (value, used) = decode_at(bytes)?;
    if used != bytes.len() {
        return None;
    }
    Some(value)
}

fn decode_at(bytes: &[u8]) -> Option<(Value, usize)> {
    match *bytes.first()? {
        TAG_NULL => Some((Value::Null, 1)),
        TAG_FALSE => Some((Value::Bool(false), 1)),
        TAG_TRUE => Some((Value::Bool(true), 1)),
        TAG_NUMBER => {
            let raw: [u8; 8] = bytes.get(1..9)?.try_into().ok()?;
            let v = decode_f64(raw);
            Some((Value::Number(json_number(v)?), 9))
        }
        TAG_STRING => {
            let (s, used) = decode_bytes(&bytes[1..])?;
            Some((Value::String(s), used + 1))
        }
        TAG_ARRAY => {
            let mut items = Vec::new();
            let mut pos = 1;
            loop {
                if *bytes.get(pos)? == TERMINATOR {
                    return Some((Value::Array(items), pos + 1));
                }
                let (item, used) = decode_at(&bytes[pos..])?;
                items.push(item);
                pos += used;
            }
        }
        TAG_OBJECT => {
            let mut map = Map::new();
            let mut pos = 1;
            loop {
                match *bytes.get(pos)? {
                    TERMINATOR => return Some((Value::Object(map), pos + 1)),
                    TAG_STRING => {
                        let (key, used) = decode_bytes(&bytes[pos + 1..])?;
                        pos += used + 1;
                        let (value, used) = decode_at(&bytes[pos..])?;
                        pos += used;
                        map.insert(key, value);
                    }
                    _ => return None,
                }
            }
        }
        _ => None,
    }
}

fn decode_bytes(bytes: &[u8]) -> Option<(String, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let b = *bytes.get(pos)?;
        if b == 0x00 {
            if bytes.get(pos + 1) == Some(&0xFF) {
                out.push(0x00);
                pos += 2;
                continue;
            }
            return Some((String::from_utf8_lossy(&out).into_owned(), pos + 1));
        }
        out.push(b);
        pos += 1;
    }
}

// Integral values come back as JSON integers so emitted integer keys
// round-trip without a trailing ".0".
fn json_number(v: f64) -> Option<Number> {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Some(Number::from(v as i64))
    } else {
        Number::from_f64(v)
    }
}
