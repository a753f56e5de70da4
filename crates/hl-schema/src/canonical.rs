//! Canonical JSON rendering and schema checksums.
//!
//! The canonical form is the schema serialized with (a) the top-level
//! `timestamp` normalized to 0 and (b) object keys sorted lexicographically at
//! every depth.  The checksum is the lowercase-hex SHA-256 of the canonical
//! UTF-8 bytes.  The sorted-key writer is hand-rolled so the result does not
//! depend on serde_json's map ordering features.

use crate::Schema;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render the canonical JSON form of a schema.
pub fn canonical_json(schema: &Schema) -> String {
    let mut value = serde_json::to_value(schema).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".to_owned(), Value::from(0u64));
    }
    let mut out = String::new();
    write_canonical(&value, &mut out);
    out
}

/// Canonical content checksum of a schema.
pub fn checksum(schema: &Schema) -> String {
    hex::encode(Sha256::digest(canonical_json(schema).as_bytes()))
}

/// Content equality: two schemas are equal iff their canonical forms match.
pub fn canonically_equal(a: &Schema, b: &Schema) -> bool {
    canonical_json(a) == canonical_json(b)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
