use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Column types understood by the core. The SQL layer owns the richer type
/// system; the core only needs enough to round-trip values through the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Decimal,
    Text,
}

/// A single column value.
///
/// Values travel on the WAL wire as `[type_id:i32][len:u32][utf8 rendering]`,
/// the same string-backed encoding the engine has always used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Decimal(f64),
    Text(String),
}

/// A row is an ordered list of values.
pub type Row = Vec<Value>;

const TYPE_NULL: i32 = 0;
const TYPE_INT: i32 = 1;
const TYPE_DECIMAL: i32 = 2;
const TYPE_TEXT: i32 = 3;

impl Value {
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Decimal(v) => v.to_string(),
            Value::Text(v) => v.clone(),
        }
    }

    fn type_id(&self) -> i32 {
        match self {
            Value::Null => TYPE_NULL,
            Value::Int(_) => TYPE_INT,
            Value::Decimal(_) => TYPE_DECIMAL,
            Value::Text(_) => TYPE_TEXT,
        }
    }
}

pub fn encode_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn decode_string(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(DbError::ShortRead("string length prefix".to_string()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(DbError::ShortRead(format!("string body of {} bytes", len)));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    buf.put_i32_le(value.type_id());
    encode_string(buf, &value.render());
}

pub fn decode_value(buf: &mut impl Buf) -> Result<Value> {
    if buf.remaining() < 4 {
        return Err(DbError::ShortRead("value type tag".to_string()));
    }
    let type_id = buf.get_i32_le();
    let rendered = decode_string(buf)?;
    match type_id {
        TYPE_NULL => Ok(Value::Null),
        TYPE_INT => Ok(Value::Int(rendered.parse().unwrap_or(0))),
        TYPE_DECIMAL => Ok(Value::Decimal(rendered.parse().unwrap_or(0.0))),
        TYPE_TEXT => Ok(Value::Text(rendered)),
        other => Err(DbError::Serialization(format!(
            "unknown value type tag {}",
            other
        ))),
    }
}

/// Encode a row as `[count:u32][value...]`.
pub fn encode_row(buf: &mut BytesMut, row: &[Value]) {
    buf.put_u32_le(row.len() as u32);
    for value in row {
        encode_value(buf, value);
    }
}

pub fn decode_row(buf: &mut impl Buf) -> Result<Row> {
    if buf.remaining() < 4 {
        return Err(DbError::ShortRead("row column count".to_string()));
    }
    let count = buf.get_u32_le() as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        row.push(decode_value(buf)?);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let values = vec![
            Value::Null,
            Value::Int(-42),
            Value::Decimal(3.25),
            Value::Text("hello".to_string()),
        ];
        let mut buf = BytesMut::new();
        encode_row(&mut buf, &values);

        let mut cursor = buf.freeze();
        let decoded = decode_row(&mut cursor).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::Text("truncate me".to_string()));
        let truncated = &buf[..buf.len() - 3];
        let mut cursor = truncated;
        assert!(decode_value(&mut cursor).is_err());
    }
}
