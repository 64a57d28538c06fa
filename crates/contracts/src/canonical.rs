//! Canonical JSON: object keys sorted at every depth, no insignificant
//! whitespace, arrays kept in order. Hashes over this form are stable no
//! matter how a mapping was built.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use hex::ToHex;
use serde_json::Value;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    sha2::Sha256::digest(bytes).encode_hex::<String>()
}

/// Exactly 64 lowercase hex characters.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Lowercases a client-supplied digest so comparisons stay byte-for-byte.
pub fn normalize_sha256_hex(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// Rebuilds `value` with every object's keys in sorted order.
pub fn canonicalize_json_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize_json_value(v)))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

pub fn canonical_json_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

pub fn hash_canonical_json(value: &Value) -> String {
    sha256_hex(canonical_json_string(value).as_bytes())
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let sorted = map.iter().collect::<BTreeMap<_, _>>();
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(out, &Value::String(key.clone()));
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
        scalar => write_scalar(out, scalar),
    }
}

fn write_scalar(out: &mut String, value: &Value) {
    // Display on a scalar Value is its compact JSON encoding.
    let _ = write!(out, "{}", value);
}
