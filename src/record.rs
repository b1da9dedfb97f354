//! The on-disk record codec: packs/unpacks a field list to the byte layout
//! shared by `MakeRecord`'s output and a table-leaf cell's payload.
//!
//! Layout: one header-length byte, then one type code byte per field (0 for
//! Null, 1 for Byte, 2 for SmallInt, 4 for Int, or `2*(len+1)+13` for text),
//! then the field data in order. Every type code is exactly one byte --
//! text's code is distinguished from the four fixed codes simply by not
//! being one of them, which only holds because a single byte can't encode
//! both schemes at once: text length is capped at `MAX_TEXT_LEN` so its
//! code never overflows `u8`.

use crate::error::{Error, ErrorCode, Result};
use crate::schema::ColumnType;
use crate::value::Value;

const TYPE_NULL: u8 = 0;
const TYPE_BYTE: u8 = 1;
const TYPE_SMALLINT: u8 = 2;
const TYPE_INT: u8 = 4;

/// Longest text field this codec can represent: `2*(len+1)+13` must fit in
/// a `u8`, so `len <= (255 - 13) / 2 - 1 = 120`.
pub const MAX_TEXT_LEN: usize = 120;

fn text_type_code(len: usize) -> Result<u8> {
    if len > MAX_TEXT_LEN {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("text field of length {len} exceeds the maximum encodable length {MAX_TEXT_LEN}"),
        ));
    }
    Ok((2 * (len as u32 + 1) + 13) as u8)
}

fn text_len_from_code(code: u8) -> Result<usize> {
    if code < 15 || (code - 13) % 2 != 0 {
        return Err(Error::with_message(
            ErrorCode::TypeMismatch,
            format!("not a text type code: {code}"),
        ));
    }
    Ok(((code - 13) / 2) as usize)
}

/// Pack a field list into a record buffer.
///
/// This is used both by `MakeRecord` (whose registers always carry a real
/// value for every column, including the primary key) and by the B-tree
/// cell builder in [`crate::btree`] (which, per the primary-key-in-key
/// convention, packs a `Value::Null` placeholder for the primary-key
/// column instead of omitting it from the header).
pub fn pack(fields: &[Value]) -> Result<Vec<u8>> {
    let mut type_codes = Vec::with_capacity(fields.len());
    let mut data = Vec::new();
    for field in fields {
        match field {
            Value::Null => type_codes.push(TYPE_NULL),
            Value::Byte(b) => {
                type_codes.push(TYPE_BYTE);
                data.push(*b as u8);
            }
            Value::SmallInt(s) => {
                type_codes.push(TYPE_SMALLINT);
                data.extend_from_slice(&s.to_be_bytes());
            }
            Value::Int(i) => {
                type_codes.push(TYPE_INT);
                data.extend_from_slice(&i.to_be_bytes());
            }
            Value::Bytes(bytes) => {
                type_codes.push(text_type_code(bytes.len())?);
                data.extend_from_slice(bytes);
            }
        }
    }
    let header_len = 1 + type_codes.len();
    let mut out = Vec::with_capacity(header_len + data.len());
    out.push(header_len as u8);
    out.extend_from_slice(&type_codes);
    out.extend_from_slice(&data);
    Ok(out)
}

/// Unpack a record buffer into its field list.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.is_empty() {
        return Err(Error::with_message(ErrorCode::TypeMismatch, "empty record"));
    }
    let header_len = bytes[0] as usize;
    let codes = bytes
        .get(1..header_len)
        .ok_or_else(|| Error::with_message(ErrorCode::TypeMismatch, "corrupt record header length"))?;

    let mut data_pos = header_len;
    let mut fields = Vec::with_capacity(codes.len());
    for &code in codes {
        match code {
            TYPE_NULL => fields.push(Value::Null),
            TYPE_BYTE => {
                let b = *bytes.get(data_pos).ok_or_else(too_short)?;
                fields.push(Value::Byte(b as i8));
                data_pos += 1;
            }
            TYPE_SMALLINT => {
                let w = bytes.get(data_pos..data_pos + 2).ok_or_else(too_short)?;
                fields.push(Value::SmallInt(i16::from_be_bytes(w.try_into().unwrap())));
                data_pos += 2;
            }
            TYPE_INT => {
                let w = bytes.get(data_pos..data_pos + 4).ok_or_else(too_short)?;
                fields.push(Value::Int(i32::from_be_bytes(w.try_into().unwrap())));
                data_pos += 4;
            }
            _ => {
                let len = text_len_from_code(code)?;
                let w = bytes.get(data_pos..data_pos + len).ok_or_else(too_short)?;
                fields.push(Value::text(w.to_vec()));
                data_pos += len;
            }
        }
    }
    Ok(fields)
}

/// The number of data bytes a preceding column's type code occupies, used
/// to skip past it without decoding its value.
fn field_width(code: u8) -> Result<usize> {
    match code {
        TYPE_NULL => Ok(0),
        TYPE_BYTE => Ok(1),
        TYPE_SMALLINT => Ok(2),
        TYPE_INT => Ok(4),
        _ => text_len_from_code(code),
    }
}

/// Read one column out of a table-leaf cell's payload, the way `Column`
/// does: walk the header past every preceding column's width to find this
/// column's data offset, then -- unless the on-disk type code is Null --
/// interpret the bytes at that offset using the *schema-declared* column
/// type rather than the on-disk code. The on-disk code still decides
/// whether the column is absent (Null) and, for text, how many bytes to
/// read; everything else about how to turn those bytes into a `Value`
/// comes from `declared`.
pub fn read_column(payload: &[u8], col_num: usize, declared: ColumnType) -> Result<Value> {
    if payload.is_empty() {
        return Err(Error::with_message(ErrorCode::TypeMismatch, "empty record"));
    }
    let header_len = payload[0] as usize;
    let codes = payload
        .get(1..header_len)
        .ok_or_else(|| Error::with_message(ErrorCode::TypeMismatch, "corrupt record header length"))?;
    let code = *codes
        .get(col_num)
        .ok_or_else(|| Error::with_message(ErrorCode::Misuse, format!("column {col_num} absent from record")))?;

    let mut data_pos = header_len;
    for &preceding in &codes[..col_num] {
        data_pos += field_width(preceding)?;
    }

    if code == TYPE_NULL {
        return Ok(Value::Null);
    }

    match declared {
        ColumnType::Byte => {
            if code != TYPE_BYTE {
                return Err(type_mismatch(col_num, "Byte", code));
            }
            let b = *payload.get(data_pos).ok_or_else(too_short)?;
            Ok(Value::Byte(b as i8))
        }
        ColumnType::SmallInt => {
            if code != TYPE_SMALLINT {
                return Err(type_mismatch(col_num, "SmallInt", code));
            }
            let w = payload.get(data_pos..data_pos + 2).ok_or_else(too_short)?;
            Ok(Value::SmallInt(i16::from_be_bytes(w.try_into().unwrap())))
        }
        ColumnType::Int => {
            if code != TYPE_INT {
                return Err(type_mismatch(col_num, "Int", code));
            }
            let w = payload.get(data_pos..data_pos + 4).ok_or_else(too_short)?;
            Ok(Value::Int(i32::from_be_bytes(w.try_into().unwrap())))
        }
        ColumnType::Text => {
            let len = text_len_from_code(code).map_err(|_| type_mismatch(col_num, "Text", code))?;
            let w = payload.get(data_pos..data_pos + len).ok_or_else(too_short)?;
            Ok(Value::text(w.to_vec()))
        }
        // Not a real declared column type in practice (no column is
        // "declared Null"); fall back to the on-disk code's own width and
        // interpretation rather than reject an otherwise-valid cell.
        ColumnType::Null => decode_by_code(payload, data_pos, code),
    }
}

fn decode_by_code(payload: &[u8], data_pos: usize, code: u8) -> Result<Value> {
    match code {
        TYPE_BYTE => Ok(Value::Byte(*payload.get(data_pos).ok_or_else(too_short)? as i8)),
        TYPE_SMALLINT => {
            let w = payload.get(data_pos..data_pos + 2).ok_or_else(too_short)?;
            Ok(Value::SmallInt(i16::from_be_bytes(w.try_into().unwrap())))
        }
        TYPE_INT => {
            let w = payload.get(data_pos..data_pos + 4).ok_or_else(too_short)?;
            Ok(Value::Int(i32::from_be_bytes(w.try_into().unwrap())))
        }
        _ => {
            let len = text_len_from_code(code)?;
            let w = payload.get(data_pos..data_pos + len).ok_or_else(too_short)?;
            Ok(Value::text(w.to_vec()))
        }
    }
}

fn type_mismatch(col_num: usize, declared: &str, code: u8) -> Error {
    Error::with_message(
        ErrorCode::TypeMismatch,
        format!("column {col_num} declared {declared} but stored as type code {code}"),
    )
}

fn too_short() -> Error {
    Error::with_message(ErrorCode::TypeMismatch, "record data shorter than header promises")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field_kind() {
        let fields = vec![
            Value::Null,
            Value::Byte(-7),
            Value::SmallInt(-1234),
            Value::Int(70_000),
            Value::text(b"hello world".to_vec()),
        ];
        let packed = pack(&fields).unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(fields, unpacked);
    }

    #[test]
    fn empty_text_round_trips() {
        let fields = vec![Value::text(Vec::new())];
        let packed = pack(&fields).unwrap();
        assert_eq!(unpack(&packed).unwrap(), fields);
    }

    #[test]
    fn text_type_code_matches_formula() {
        assert_eq!(text_type_code(0).unwrap(), 15);
        assert_eq!(text_type_code(5).unwrap(), 25);
    }

    #[test]
    fn text_type_code_never_collides_with_a_fixed_code() {
        for len in 0..=MAX_TEXT_LEN {
            let code = text_type_code(len).unwrap();
            assert!(![TYPE_NULL, TYPE_BYTE, TYPE_SMALLINT, TYPE_INT].contains(&code));
        }
    }

    #[test]
    fn text_longer_than_max_is_rejected() {
        let fields = vec![Value::text(vec![0u8; MAX_TEXT_LEN + 1])];
        let err = pack(&fields).unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
    }

    #[test]
    fn multiple_text_fields_round_trip_without_ambiguity() {
        let fields = vec![
            Value::text(b"first".to_vec()),
            Value::Null,
            Value::text(b"second field".to_vec()),
            Value::Int(9),
        ];
        let packed = pack(&fields).unwrap();
        assert_eq!(unpack(&packed).unwrap(), fields);
    }
}
