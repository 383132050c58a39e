//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writers append to a [`BytesMut`]; readers walk a byte slice with an
//! explicit offset. Every reader checks the remaining length before slicing,
//! so truncated or oversized fields from the network surface as
//! [`TernError::InvalidEncoding`] instead of a panic.

use bytes::{BufMut, BytesMut};
use tern_platform::{TernError, TernResult};

/// Writes a `string` holding UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes a `string` holding arbitrary bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a `name-list` (comma separated, no spaces).
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an `mpint` from unsigned big-endian magnitude bytes.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Encodes unsigned big-endian bytes as an SSH `mpint`.
///
/// Leading zeros are stripped and a zero byte is prepended when the high bit
/// is set, so the value stays positive. Zero encodes as an empty string.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    let needs_padding = trimmed.first().is_some_and(|b| b & 0x80 != 0);
    let length = trimmed.len() + usize::from(needs_padding);

    let mut out = Vec::with_capacity(4 + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> TernResult<u8> {
    let value = *data.get(*offset).ok_or_else(|| {
        TernError::InvalidEncoding(format!("Cannot read byte at offset {}", offset))
    })?;
    *offset += 1;
    Ok(value)
}

/// Reads a `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> TernResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> TernResult<u32> {
    let bytes = take(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a `string` as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> TernResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;
    Ok(take(data, offset, length)?.to_vec())
}

/// Reads a `string` that must be valid UTF-8.
pub fn read_string(data: &[u8], offset: &mut usize) -> TernResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| TernError::InvalidEncoding("String contains invalid UTF-8".to_string()))
}

/// Reads a `name-list`.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> TernResult<Vec<String>> {
    let list = read_string(data, offset)?;
    if list.is_empty() {
        Ok(vec![])
    } else {
        Ok(list.split(',').map(String::from).collect())
    }
}

/// Reads an `mpint` and returns its unsigned magnitude without leading zeros.
///
/// Negative values are rejected; SSH never sends them in the places this
/// crate reads mpints.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> TernResult<Vec<u8>> {
    let raw = read_bytes(data, offset)?;
    if raw.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(TernError::InvalidEncoding(
            "Negative mpint not allowed".to_string(),
        ));
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Checks that a message starts with the expected type byte.
pub fn expect_message(data: &[u8], expected: u8, name: &str) -> TernResult<()> {
    match data.first() {
        None => Err(TernError::InvalidEncoding(format!("{} message is empty", name))),
        Some(&t) if t != expected => Err(TernError::InvalidEncoding(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, t
        ))),
        Some(_) => Ok(()),
    }
}

fn take<'a>(data: &'a [u8], offset: &mut usize, length: usize) -> TernResult<&'a [u8]> {
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            TernError::InvalidEncoding(format!(
                "Data truncated: expected {} bytes at offset {}",
                length, offset
            ))
        })?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}
