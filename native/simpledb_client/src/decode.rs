/// Decoding and type conversion utilities
///
/// This module converts between the text wire format and `Value`s, maps
/// type OIDs to column types, and converts between `Value`s and libsql values
/// for the loopback server.
use bytes::Bytes;

use crate::constants::*;
use crate::models::{Column, ColumnType, Value};

/// Map a type OID to the column type used to decode its values.
pub fn column_type_for_oid(oid: u32) -> ColumnType {
    match oid {
        INT2_OID | INT4_OID | INT8_OID => ColumnType::Integer,
        FLOAT4_OID | FLOAT8_OID | NUMERIC_OID => ColumnType::Real,
        TEXT_OID | VARCHAR_OID | BPCHAR_OID | NAME_OID => ColumnType::Text,
        BYTEA_OID => ColumnType::Blob,
        BOOL_OID => ColumnType::Boolean,
        other => ColumnType::Unknown(other),
    }
}

pub fn column(name: impl Into<String>, type_oid: u32) -> Column {
    Column {
        name: name.into(),
        type_oid,
        column_type: column_type_for_oid(type_oid),
    }
}

/// Decode one text-format column value.
///
/// Decoding is tolerant: a value that does not parse as its declared type
/// falls back to the closest representation instead of failing the row, since
/// the server's storage is dynamically typed.
pub fn decode_text_value(column_type: ColumnType, raw: Option<&[u8]>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Value::Blob(raw.to_vec()),
    };

    match column_type {
        ColumnType::Integer => {
            if let Ok(v) = text.parse::<i64>() {
                Value::Integer(v)
            } else if let Ok(v) = text.parse::<f64>() {
                Value::Real(v)
            } else {
                Value::Text(text.to_string())
            }
        }
        ColumnType::Real => text
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Real),
        ColumnType::Boolean => match text {
            "t" | "true" | "1" => Value::Integer(1),
            "f" | "false" | "0" => Value::Integer(0),
            _ => Value::Text(text.to_string()),
        },
        ColumnType::Blob => match text.strip_prefix("\\x") {
            Some(hex) => decode_hex(hex).map_or_else(|| Value::Blob(raw.to_vec()), Value::Blob),
            None => Value::Blob(raw.to_vec()),
        },
        ColumnType::Text | ColumnType::Unknown(_) => Value::Text(text.to_string()),
    }
}

/// Encode a parameter in text format; `None` encodes NULL.
pub fn encode_param(value: &Value) -> Option<Bytes> {
    match value {
        Value::Null => None,
        Value::Integer(v) => Some(Bytes::from(v.to_string())),
        Value::Real(v) => Some(Bytes::from(format_real(*v))),
        Value::Text(v) => Some(Bytes::copy_from_slice(v.as_bytes())),
        Value::Blob(v) => Some(Bytes::from(format!("\\x{}", encode_hex(v)))),
    }
}

/// Type OID announced for a parameter in the Parse message (0 = unspecified).
pub fn param_type_oid(value: &Value) -> u32 {
    match value {
        Value::Null => 0,
        Value::Integer(_) => INT8_OID,
        Value::Real(_) => FLOAT8_OID,
        Value::Text(_) => TEXT_OID,
        Value::Blob(_) => BYTEA_OID,
    }
}

/// Text form of a float that parses back to the same value.
fn format_real(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{v:?}")
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks_exact(2)
        .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Map a declared SQLite column type to the type OID announced to clients.
///
/// Follows SQLite's affinity rules; an empty declaration yields `None` so the
/// caller can infer the type from the first value.
pub fn oid_for_decl_type(decl: &str) -> Option<u32> {
    let decl = decl.to_ascii_uppercase();
    if decl.is_empty() {
        None
    } else if decl.starts_with("BOOL") {
        Some(BOOL_OID)
    } else if decl.contains("INT") {
        Some(INT8_OID)
    } else if decl.starts_with("VARCHAR") || decl.contains("VARYING") {
        Some(VARCHAR_OID)
    } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
        Some(TEXT_OID)
    } else if decl.contains("BLOB") || decl.contains("BYTEA") {
        Some(BYTEA_OID)
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Some(FLOAT8_OID)
    } else if decl.contains("NUMERIC") || decl.contains("DECIMAL") {
        Some(NUMERIC_OID)
    } else {
        Some(TEXT_OID)
    }
}

/// Infer a type OID from a stored value when the column has no declaration.
pub fn oid_for_libsql_value(value: &libsql::Value) -> u32 {
    match value {
        libsql::Value::Integer(_) => INT8_OID,
        libsql::Value::Real(_) => FLOAT8_OID,
        libsql::Value::Blob(_) => BYTEA_OID,
        libsql::Value::Text(_) | libsql::Value::Null => TEXT_OID,
    }
}

/// Render a stored value in the text format for a column of type `oid`.
pub fn libsql_value_to_text(value: &libsql::Value, oid: u32) -> Option<Bytes> {
    match value {
        libsql::Value::Null => None,
        libsql::Value::Integer(v) if oid == BOOL_OID => {
            Some(Bytes::from_static(if *v != 0 { b"t" } else { b"f" }))
        }
        libsql::Value::Integer(v) => Some(Bytes::from(v.to_string())),
        libsql::Value::Real(v) => Some(Bytes::from(format_real(*v))),
        libsql::Value::Text(v) => Some(Bytes::copy_from_slice(v.as_bytes())),
        libsql::Value::Blob(v) => Some(Bytes::from(format!("\\x{}", encode_hex(v)))),
    }
}

/// Convert a text-format parameter into a libsql value using its Parse type.
///
/// Unspecified or textual types bind as text and let SQLite apply column
/// affinity.
pub fn param_to_libsql_value(raw: Option<&[u8]>, oid: u32) -> Result<libsql::Value, String> {
    let Some(raw) = raw else {
        return Ok(libsql::Value::Null);
    };
    let text = std::str::from_utf8(raw).map_err(|_| "parameter is not valid utf-8".to_string())?;
    match oid {
        INT2_OID | INT4_OID | INT8_OID => text
            .parse::<i64>()
            .map(libsql::Value::Integer)
            .map_err(|_| format!("invalid integer parameter: {text:?}")),
        FLOAT4_OID | FLOAT8_OID | NUMERIC_OID => text
            .parse::<f64>()
            .map(libsql::Value::Real)
            .map_err(|_| format!("invalid float parameter: {text:?}")),
        BOOL_OID => match text {
            "t" | "true" | "1" => Ok(libsql::Value::Integer(1)),
            "f" | "false" | "0" => Ok(libsql::Value::Integer(0)),
            _ => Err(format!("invalid boolean parameter: {text:?}")),
        },
        BYTEA_OID => text
            .strip_prefix("\\x")
            .and_then(decode_hex)
            .map(libsql::Value::Blob)
            .ok_or_else(|| "invalid bytea parameter".to_string()),
        _ => Ok(libsql::Value::Text(text.to_string())),
    }
}
