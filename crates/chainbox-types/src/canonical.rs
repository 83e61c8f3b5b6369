//! Canonical JSON serialization and content fingerprinting.
//!
//! Signing and cache keying both need a byte-stable rendering of a JSON
//! value. Object keys are emitted in lexicographic order regardless of how
//! the value was built, so two structurally equal payloads always produce
//! the same bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value with lexicographically sorted object keys and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                // Key came from the map, entry always present.
                if let Some(v) = map.get(*key) {
                    write_value(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Stable content hash of `(name, canonical(input))`, hex-encoded.
///
/// Used as the cache fingerprint for one capability invocation.
pub fn fingerprint(fn_name: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fn_name.as_bytes());
    hasher.update(b"\x00");
    hasher.update(canonical_json(input).as_bytes());
    hex::encode(hasher.finalize())
}
