//! Codec primitives for the tokenized wire format.
//!
//! Conventions:
//!
//! - fixed-width unsigned integers are little-endian;
//! - fixed-length strings are UTF-8, right-padded with NUL;
//! - variable strings and byte strings carry a length prefix whose width is
//!   the smallest of {u8, u16, u32} that covers the field's declared
//!   maximum;
//! - timestamps are 8-byte nanosecond counts;
//! - hashes are 32 raw bytes;
//! - addresses are their type-tagged byte form behind a u16-max length
//!   prefix.
//!
//! Every read validates the remaining buffer before allocating.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitcoin::{Address, Hash32};

/// Errors from wire encoding or decoding.
///
/// Any decode failure maps to the `MsgMalformed` rejection at the handler
/// layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the field was complete.
    #[error("message truncated")]
    Truncated,

    /// A field exceeds its declared maximum.
    #[error("field exceeds maximum length: {len} > {max}")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Declared maximum.
        max: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A field value is outside its defined set.
    #[error("invalid field value: {0}")]
    InvalidValue(&'static str),

    /// The payload does not start with a known protocol identifier.
    #[error("unknown protocol identifier")]
    UnknownProtocol,

    /// The action code is not defined.
    #[error("unknown action code")]
    UnknownActionCode,

    /// Bytes remain after the last field.
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// An 8-byte nanosecond timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The zero timestamp, used as a "not set" marker.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Timestamp(nanos)
    }

    /// Nanoseconds since the epoch.
    #[must_use]
    pub const fn nanos(&self) -> u64 {
        self.0
    }

    /// Returns true if the timestamp is unset.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// This timestamp advanced by `secs` seconds.
    #[must_use]
    pub const fn plus_secs(&self, secs: u64) -> Timestamp {
        Timestamp(self.0 + secs * 1_000_000_000)
    }
}

pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    if buf.len() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn read_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    if buf.len() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn read_bool(buf: &mut &[u8]) -> Result<bool, WireError> {
    match read_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::InvalidValue("bool")),
    }
}

pub(crate) fn write_bool(out: &mut Vec<u8>, value: bool) {
    out.put_u8(u8::from(value));
}

pub(crate) fn read_timestamp(buf: &mut &[u8]) -> Result<Timestamp, WireError> {
    Ok(Timestamp(read_u64(buf)?))
}

pub(crate) fn write_timestamp(out: &mut Vec<u8>, ts: Timestamp) {
    out.put_u64_le(ts.0);
}

pub(crate) fn read_hash(buf: &mut &[u8]) -> Result<Hash32, WireError> {
    if buf.len() < 32 {
        return Err(WireError::Truncated);
    }
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash32(bytes))
}

pub(crate) fn write_hash(out: &mut Vec<u8>, hash: &Hash32) {
    out.put_slice(hash.as_bytes());
}

/// Writes a length prefix sized for `max`.
fn write_len(out: &mut Vec<u8>, len: usize, max: usize) -> Result<(), WireError> {
    if len > max {
        return Err(WireError::TooLong { len, max });
    }
    if max <= u8::MAX as usize {
        out.put_u8(len as u8);
    } else if max <= u16::MAX as usize {
        out.put_u16_le(len as u16);
    } else {
        out.put_u32_le(len as u32);
    }
    Ok(())
}

/// Reads a length prefix sized for `max` and bounds-checks it.
fn read_len(buf: &mut &[u8], max: usize) -> Result<usize, WireError> {
    let len = if max <= u8::MAX as usize {
        read_u8(buf)? as usize
    } else if max <= u16::MAX as usize {
        read_u16(buf)? as usize
    } else {
        read_u32(buf)? as usize
    };
    if len > max {
        return Err(WireError::TooLong { len, max });
    }
    Ok(len)
}

pub(crate) fn write_var_bytes(out: &mut Vec<u8>, data: &[u8], max: usize) -> Result<(), WireError> {
    write_len(out, data.len(), max)?;
    out.put_slice(data);
    Ok(())
}

pub(crate) fn read_var_bytes(buf: &mut &[u8], max: usize) -> Result<Vec<u8>, WireError> {
    let len = read_len(buf, max)?;
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

pub(crate) fn write_var_char(out: &mut Vec<u8>, text: &str, max: usize) -> Result<(), WireError> {
    write_var_bytes(out, text.as_bytes(), max)
}

pub(crate) fn read_var_char(buf: &mut &[u8], max: usize) -> Result<String, WireError> {
    let data = read_var_bytes(buf, max)?;
    String::from_utf8(data).map_err(|_| WireError::InvalidUtf8)
}

pub(crate) fn write_fixed_char(out: &mut Vec<u8>, text: &str, len: usize) -> Result<(), WireError> {
    let bytes = text.as_bytes();
    if bytes.len() > len {
        return Err(WireError::TooLong {
            len: bytes.len(),
            max: len,
        });
    }
    out.put_slice(bytes);
    for _ in bytes.len()..len {
        out.put_u8(0);
    }
    Ok(())
}

pub(crate) fn read_fixed_char(buf: &mut &[u8], len: usize) -> Result<String, WireError> {
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    while data.last() == Some(&0) {
        data.pop();
    }
    String::from_utf8(data).map_err(|_| WireError::InvalidUtf8)
}

/// Address fields carry the type-tagged byte form behind a u16-max prefix.
const ADDRESS_FIELD_MAX: usize = u16::MAX as usize;

pub(crate) fn write_address(out: &mut Vec<u8>, address: &Address) -> Result<(), WireError> {
    write_var_bytes(out, &address.to_bytes(), ADDRESS_FIELD_MAX)
}

/// Writes an optional address; absence is a zero-length field.
pub(crate) fn write_opt_address(
    out: &mut Vec<u8>,
    address: Option<&Address>,
) -> Result<(), WireError> {
    match address {
        Some(a) => write_address(out, a),
        None => write_var_bytes(out, &[], ADDRESS_FIELD_MAX),
    }
}

pub(crate) fn read_address(buf: &mut &[u8]) -> Result<Address, WireError> {
    let data = read_var_bytes(buf, ADDRESS_FIELD_MAX)?;
    Address::from_bytes(&data).map_err(|_| WireError::InvalidValue("address"))
}

pub(crate) fn read_opt_address(buf: &mut &[u8]) -> Result<Option<Address>, WireError> {
    let data = read_var_bytes(buf, ADDRESS_FIELD_MAX)?;
    if data.is_empty() {
        return Ok(None);
    }
    Address::from_bytes(&data)
        .map(Some)
        .map_err(|_| WireError::InvalidValue("address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::Network;

    #[test]
    fn len_prefix_width_tracks_maximum() {
        let mut out = Vec::new();
        write_var_bytes(&mut out, b"ab", 255).unwrap();
        assert_eq!(out, vec![2, b'a', b'b']);

        out.clear();
        write_var_bytes(&mut out, b"ab", 256).unwrap();
        assert_eq!(out, vec![2, 0, b'a', b'b']);

        out.clear();
        write_var_bytes(&mut out, b"ab", 1 << 20).unwrap();
        assert_eq!(out, vec![2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn var_char_round_trip_and_limit() {
        let mut out = Vec::new();
        write_var_char(&mut out, "hello", 16).unwrap();
        let mut buf = out.as_slice();
        assert_eq!(read_var_char(&mut buf, 16).unwrap(), "hello");
        assert!(buf.is_empty());

        let mut out = Vec::new();
        let err = write_var_char(&mut out, "toolongtext", 4).unwrap_err();
        assert_eq!(err, WireError::TooLong { len: 11, max: 4 });
    }

    #[test]
    fn fixed_char_pads_and_trims() {
        let mut out = Vec::new();
        write_fixed_char(&mut out, "CUR", 5).unwrap();
        assert_eq!(out, vec![b'C', b'U', b'R', 0, 0]);

        let mut buf = out.as_slice();
        assert_eq!(read_fixed_char(&mut buf, 5).unwrap(), "CUR");
    }

    #[test]
    fn declared_max_is_enforced_on_read() {
        // A prefix claiming more than the declared maximum is malformed even
        // if the bytes are present.
        let data = vec![200u8, 0, 0, 0, 0];
        let mut buf = data.as_slice();
        assert!(read_var_bytes(&mut buf, 100).is_err());
    }

    #[test]
    fn address_round_trip() {
        let addr = Address::pkh([9u8; 20], Network::Test);
        let mut out = Vec::new();
        write_address(&mut out, &addr).unwrap();
        let mut buf = out.as_slice();
        assert_eq!(read_address(&mut buf).unwrap(), addr);

        let mut out = Vec::new();
        write_opt_address(&mut out, None).unwrap();
        let mut buf = out.as_slice();
        assert_eq!(read_opt_address(&mut buf).unwrap(), None);
    }

    #[test]
    fn timestamp_helpers() {
        let ts = Timestamp(5_000_000_000);
        assert_eq!(ts.plus_secs(2), Timestamp(7_000_000_000));
        assert!(Timestamp::ZERO.is_zero());
        assert!(!Timestamp::now().is_zero());
    }
}
