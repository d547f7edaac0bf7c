//! Hex helpers for console input and log output.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("hex length must be even (got {0} digits)")]
    OddLength(usize),
    #[error("invalid hex character {0:?}")]
    InvalidChar(char),
}

/// Parses a hex string. Whitespace between digits is ignored so operators can
/// paste dumps like `6565 0100 0000`.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, HexError> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if !digits.len().is_multiple_of(2) {
        return Err(HexError::OddLength(digits.len()));
    }

    let mut out = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let hi = hex_nibble(pair[0])?;
        let lo = hex_nibble(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_nibble(ch: u8) -> Result<u8, HexError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => Err(HexError::InvalidChar(ch as char)),
    }
}

pub fn hex_all(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First `max_len` bytes as hex, with a marker when the input was cut.
pub fn hex_prefix(bytes: &[u8], max_len: usize) -> String {
    let mut out = hex_all(&bytes[..bytes.len().min(max_len)]);
    if bytes.len() > max_len {
        out.push_str("..");
    }
    out
}

/// Printable rendering of raw bytes, non-ASCII escaped.
pub fn escape_bytes(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_accepts_mixed_case_and_spaces() {
        assert_eq!(
            decode_hex("6565 01 00 0A0b").unwrap(),
            vec![0x65, 0x65, 0x01, 0x00, 0x0a, 0x0b]
        );
    }

    #[test]
    fn decode_hex_rejects_odd_and_garbage() {
        assert_eq!(decode_hex("abc"), Err(HexError::OddLength(3)));
        assert_eq!(decode_hex("zz"), Err(HexError::InvalidChar('z')));
    }

    #[test]
    fn hex_prefix_marks_truncation() {
        assert_eq!(hex_prefix(&[1, 2, 3], 2), "0102..");
        assert_eq!(hex_prefix(&[1, 2], 2), "0102");
    }
}
