//! Script opcodes and push-data encoding.
//!
//! Only the opcodes the agent actually emits or matches are defined here;
//! the agent never evaluates scripts, it recognizes templates.

use thiserror::Error;

/// OP_FALSE / OP_0.
pub const OP_FALSE: u8 = 0x00;
/// OP_RETURN.
pub const OP_RETURN: u8 = 0x6a;
/// OP_DUP.
pub const OP_DUP: u8 = 0x76;
/// OP_HASH160.
pub const OP_HASH160: u8 = 0xa9;
/// OP_EQUAL.
pub const OP_EQUAL: u8 = 0x87;
/// OP_EQUALVERIFY.
pub const OP_EQUALVERIFY: u8 = 0x88;
/// OP_CHECKSIG.
pub const OP_CHECKSIG: u8 = 0xac;
/// OP_CHECKSIGVERIFY.
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
/// OP_1.
pub const OP_1: u8 = 0x51;
/// OP_3.
pub const OP_3: u8 = 0x53;
/// OP_IF.
pub const OP_IF: u8 = 0x63;
/// OP_ENDIF.
pub const OP_ENDIF: u8 = 0x68;
/// OP_TOALTSTACK.
pub const OP_TOALTSTACK: u8 = 0x6b;
/// OP_FROMALTSTACK.
pub const OP_FROMALTSTACK: u8 = 0x6c;
/// OP_DROP.
pub const OP_DROP: u8 = 0x75;
/// OP_NIP.
pub const OP_NIP: u8 = 0x77;
/// OP_SWAP.
pub const OP_SWAP: u8 = 0x7c;
/// OP_SPLIT.
pub const OP_SPLIT: u8 = 0x7f;
/// OP_1ADD.
pub const OP_1ADD: u8 = 0x8b;
/// OP_GREATERTHANOREQUAL.
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;

/// Largest length encodable as a single-byte push opcode.
pub const MAX_SINGLE_BYTE_PUSH: u8 = 0x4b;
/// OP_PUSHDATA1.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// OP_PUSHDATA2.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// OP_PUSHDATA4.
pub const OP_PUSHDATA4: u8 = 0x4e;

/// Errors from script parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// The script ended before the expected data.
    #[error("script truncated")]
    Truncated,

    /// An opcode that is not a push where a push was required.
    #[error("invalid push opcode: 0x{0:02x}")]
    InvalidPushOpCode(u8),
}

/// Encodes the push-data prefix for a payload of `size` bytes.
#[must_use]
pub fn push_data(size: usize) -> Vec<u8> {
    if size <= MAX_SINGLE_BYTE_PUSH as usize {
        vec![size as u8]
    } else if size <= u8::MAX as usize {
        vec![OP_PUSHDATA1, size as u8]
    } else if size <= u16::MAX as usize {
        let mut out = vec![OP_PUSHDATA2];
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out
    } else {
        let mut out = vec![OP_PUSHDATA4];
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out
    }
}

/// Parses a push-data prefix at the start of `script`.
///
/// Returns `(payload_len, prefix_len)`.
pub fn parse_push_data(script: &[u8]) -> Result<(usize, usize), ScriptError> {
    let op = *script.first().ok_or(ScriptError::Truncated)?;

    if op <= MAX_SINGLE_BYTE_PUSH {
        return Ok((op as usize, 1));
    }

    match op {
        OP_PUSHDATA1 => {
            let size = *script.get(1).ok_or(ScriptError::Truncated)?;
            Ok((size as usize, 2))
        }
        OP_PUSHDATA2 => {
            let bytes: [u8; 2] = script
                .get(1..3)
                .ok_or(ScriptError::Truncated)?
                .try_into()
                .expect("slice length checked");
            Ok((u16::from_le_bytes(bytes) as usize, 3))
        }
        OP_PUSHDATA4 => {
            let bytes: [u8; 4] = script
                .get(1..5)
                .ok_or(ScriptError::Truncated)?
                .try_into()
                .expect("slice length checked");
            Ok((u32::from_le_bytes(bytes) as usize, 5))
        }
        other => Err(ScriptError::InvalidPushOpCode(other)),
    }
}

/// Encodes a minimal push of a small number, as used in multi-PKH required
/// counts.
///
/// Covers the range the protocol needs: 0..=16 map to OP_0/OP_1..OP_16 and
/// larger values become little-endian minimally-signed pushes.
#[must_use]
pub fn push_number(n: i64) -> Vec<u8> {
    if n == 0 {
        return vec![OP_FALSE];
    }
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }

    let negative = n < 0;
    let mut value = n.unsigned_abs();
    let mut result: Vec<u8> = Vec::with_capacity(9);
    while value > 0 {
        result.push((value & 0xff) as u8);
        value >>= 8;
    }

    // Sign-extend when the high bit is taken.
    let last = *result.last().expect("non-zero value produced bytes");
    if last & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *result.last_mut().expect("non-empty") |= 0x80;
    }

    let mut out = Vec::with_capacity(result.len() + 1);
    out.push(result.len() as u8);
    out.extend_from_slice(&result);
    out
}

/// Returns true if `script` is a data-only output
/// (`OP_FALSE OP_RETURN ...`).
#[must_use]
pub fn is_data_output(script: &[u8]) -> bool {
    script.len() >= 2 && script[0] == OP_FALSE && script[1] == OP_RETURN
}

/// Extracts the single pushed payload from a data-only output script.
///
/// Returns `None` if the script is not a data output or the push is
/// malformed or does not span the remainder of the script.
#[must_use]
pub fn data_output_payload(script: &[u8]) -> Option<&[u8]> {
    if !is_data_output(script) {
        return None;
    }
    let rest = &script[2..];
    let (len, prefix) = parse_push_data(rest).ok()?;
    let payload = rest.get(prefix..prefix + len)?;
    if prefix + len != rest.len() {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_widths() {
        assert_eq!(push_data(0), vec![0]);
        assert_eq!(push_data(0x4b), vec![0x4b]);
        assert_eq!(push_data(0x4c), vec![OP_PUSHDATA1, 0x4c]);
        assert_eq!(push_data(255), vec![OP_PUSHDATA1, 255]);
        assert_eq!(push_data(256), vec![OP_PUSHDATA2, 0x00, 0x01]);
        assert_eq!(push_data(70000), vec![OP_PUSHDATA4, 0x70, 0x11, 0x01, 0x00]);
    }

    #[test]
    fn parse_round_trips() {
        for size in [0usize, 1, 0x4b, 0x4c, 300, 70000] {
            let prefix = push_data(size);
            let (parsed, consumed) = parse_push_data(&prefix).unwrap();
            assert_eq!(parsed, size);
            assert_eq!(consumed, prefix.len());
        }
    }

    #[test]
    fn parse_rejects_non_push() {
        assert_eq!(
            parse_push_data(&[OP_DUP]),
            Err(ScriptError::InvalidPushOpCode(OP_DUP))
        );
        assert_eq!(parse_push_data(&[]), Err(ScriptError::Truncated));
    }

    #[test]
    fn push_number_encodings() {
        assert_eq!(push_number(0), vec![0x00]);
        assert_eq!(push_number(1), vec![0x51]);
        assert_eq!(push_number(16), vec![0x60]);
        assert_eq!(push_number(127), vec![0x01, 0x7f]);
        assert_eq!(push_number(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(push_number(256), vec![0x02, 0x00, 0x01]);
    }

    #[test]
    fn data_output_recognition() {
        let mut script = vec![OP_FALSE, OP_RETURN];
        script.extend(push_data(3));
        script.extend_from_slice(b"abc");
        assert!(is_data_output(&script));
        assert_eq!(data_output_payload(&script), Some(&b"abc"[..]));

        // Trailing garbage is not a clean data output.
        script.push(0x00);
        assert_eq!(data_output_payload(&script), None);

        assert!(!is_data_output(&[OP_RETURN]));
    }
}
