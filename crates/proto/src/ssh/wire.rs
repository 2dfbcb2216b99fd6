//! Wire encoding primitives (RFC 4251 Section 5).
//!
//! Decoding goes through [`Reader`], an immutable byte slice plus an explicit
//! read position. `Reader` is `Copy`, so a caller can snapshot a position,
//! attempt a parse, and fall back to the snapshot without re-slicing.
//!
//! Encoding is a set of free functions appending to a `BytesMut`.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tern_proto::ssh::wire::{write_string, write_u32, Reader};
//!
//! let mut buf = BytesMut::new();
//! write_u32(&mut buf, 7);
//! write_string(&mut buf, b"ssh-userauth");
//!
//! let mut reader = Reader::new(&buf);
//! assert_eq!(reader.read_u32().unwrap(), 7);
//! assert_eq!(reader.read_str().unwrap(), "ssh-userauth");
//! assert!(reader.is_empty());
//! ```

use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use tern_platform::{TernError, TernResult};

/// Cursor over an immutable byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true if every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consumes exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> TernResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TernError::Protocol(format!(
                "Truncated data: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Consumes every remaining byte.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = self.rest();
        self.pos = self.data.len();
        out
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> TernResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads an SSH boolean (any non-zero byte is true).
    pub fn read_bool(&mut self) -> TernResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian u32.
    pub fn read_u32(&mut self) -> TernResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian u64.
    pub fn read_u64(&mut self) -> TernResult<u64> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> TernResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> TernResult<&'a str> {
        let raw = self.read_string()?;
        std::str::from_utf8(raw)
            .map_err(|e| TernError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
    }

    /// Reads a length-prefixed string, replacing invalid UTF-8.
    ///
    /// Used for human readable text (banners, SFTP messages, file names)
    /// where servers are not always careful about encodings.
    pub fn read_lossy(&mut self) -> TernResult<String> {
        Ok(String::from_utf8_lossy(self.read_string()?).into_owned())
    }

    /// Reads a comma separated name-list.
    pub fn read_name_list(&mut self) -> TernResult<Vec<String>> {
        let raw = self.read_str()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(raw.split(',').map(str::to_string).collect())
    }

    /// Reads an mpint and returns its magnitude bytes (leading zero stripped).
    pub fn read_mpint(&mut self) -> TernResult<&'a [u8]> {
        let raw = self.read_string()?;
        if let Some(&first) = raw.first() {
            if first & 0x80 != 0 {
                return Err(TernError::Protocol(
                    "Negative mpint where a positive value is required".to_string(),
                ));
            }
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }

    /// Reads an mpint as an unsigned big integer.
    pub fn read_biguint(&mut self) -> TernResult<BigUint> {
        Ok(BigUint::from_bytes_be(self.read_mpint()?))
    }
}

/// Appends a single byte.
pub fn write_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Appends an SSH boolean.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a big-endian u32.
pub fn write_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Appends a big-endian u64.
pub fn write_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

/// Appends a length-prefixed byte string.
pub fn write_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Appends a length-prefixed UTF-8 string.
pub fn write_str(buf: &mut BytesMut, s: &str) {
    write_string(buf, s.as_bytes());
}

/// Appends a comma separated name-list.
pub fn write_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    write_str(buf, &joined);
}

/// Appends an mpint from unsigned big-endian magnitude bytes.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Appends an mpint from a big integer.
pub fn write_biguint(buf: &mut BytesMut, value: &BigUint) {
    if value.bits() == 0 {
        write_mpint(buf, &[]);
    } else {
        write_mpint(buf, &value.to_bytes_be());
    }
}

/// Encodes unsigned big-endian magnitude bytes as a complete mpint field.
///
/// Leading zeros are stripped, a zero byte is prepended when the high bit
/// is set, and zero encodes as an empty string.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let value = &magnitude[start..];

    let pad = value.first().map_or(false, |&b| b & 0x80 != 0);
    let len = value.len() + usize::from(pad);

    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_primitives() {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, 9);
        write_bool(&mut buf, true);
        write_u32(&mut buf, 0xDEAD_BEEF);
        write_u64(&mut buf, 1 << 40);
        write_str(&mut buf, "hello");

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 9);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_str().unwrap(), "hello");
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_string_is_rejected() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut r = Reader::new(&data);
        let err = r.read_string().unwrap_err();
        assert!(matches!(err, TernError::Protocol(_)));
    }

    #[test]
    fn test_snapshot_restores_position() {
        let data = [0, 0, 0, 1, 0, 0, 0, 2];
        let mut r = Reader::new(&data);
        let snapshot = r;
        assert_eq!(r.read_u32().unwrap(), 1);
        r = snapshot;
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_u32().unwrap(), 2);
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &["aes128-ctr", "aes256-ctr"]);
        write_name_list::<&str>(&mut buf, &[]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_name_list().unwrap(), vec!["aes128-ctr", "aes256-ctr"]);
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 Section 5 examples
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0, 0]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }

    #[test]
    fn test_mpint_read_strips_sign_byte() {
        let encoded = encode_mpint(&[0xff, 0x01]);
        let mut r = Reader::new(&encoded);
        assert_eq!(r.read_mpint().unwrap(), &[0xff, 0x01]);

        let negative = [0, 0, 0, 1, 0x80];
        let mut r = Reader::new(&negative);
        assert!(r.read_mpint().is_err());
    }

    #[test]
    fn test_biguint_round() {
        let value = BigUint::from(0x1_0000_0001u64);
        let mut buf = BytesMut::new();
        write_biguint(&mut buf, &value);
        write_biguint(&mut buf, &BigUint::from(0u32));
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_biguint().unwrap(), value);
        assert_eq!(r.read_biguint().unwrap(), BigUint::from(0u32));
    }
}
