//! Bencode decoder
//!
//! Strict recursive-descent parser. Anything that is not the canonical
//! encoding of some value is rejected with the byte position of the fault.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::trace;

use super::value::Value;
use crate::error::TorrentError;

/// Maximum nesting of lists and dictionaries
pub const MAX_DEPTH: usize = 256;

/// Decode exactly one value; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(TorrentError::parse_error_with_source(
            "Trailing data after bencoded value",
            format!("position {}", consumed),
        )
        .into());
    }
    Ok(value)
}

/// Decode one value from the front of `data`, returning it with the number
/// of bytes consumed
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize)> {
    trace!("Decoding bencode from {} bytes", data.len());
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn fail(&self, message: &str) -> anyhow::Error {
        TorrentError::parse_error_with_source(message, format!("position {}", self.pos)).into()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(self.fail("Nesting too deep"));
        }

        match self.peek() {
            None => Err(self.fail("Unexpected end of input")),
            Some(b'i') => self.integer().map(Value::Integer),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => self.bytes().map(Value::Bytes),
            Some(_) => Err(self.fail("Unexpected token")),
        }
    }

    fn integer(&mut self) -> Result<i64> {
        // skip 'i'
        self.pos += 1;
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|off| start + off)
            .ok_or_else(|| self.fail("Unterminated integer"))?;

        let digits = &self.data[start..end];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(self.fail("Malformed integer"));
        }
        if unsigned[0] == b'0' && (unsigned.len() > 1 || digits.len() != unsigned.len()) {
            return Err(self.fail("Integer has leading zero or negative zero"));
        }

        let text = std::str::from_utf8(digits).map_err(|_| self.fail("Malformed integer"))?;
        let n = text.parse::<i64>().map_err(|_| self.fail("Integer out of range"))?;
        self.pos = end + 1;
        Ok(n)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() != Some(b':') {
            return Err(self.fail("String length not followed by ':'"));
        }

        let digits = &self.data[start..self.pos];
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(self.fail("String length has leading zero"));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.fail("Invalid string length"))?;

        // skip ':'
        self.pos += 1;
        if len > self.data.len() - self.pos {
            return Err(self.fail("String length exceeds remaining input"));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("Unterminated list")),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value(depth + 1)?),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("Unterminated dictionary")),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::Dict(map));
                }
                Some(b'0'..=b'9') => {
                    let key = self.bytes()?;
                    let value = self.value(depth + 1)?;
                    map.insert(key, value);
                }
                Some(_) => return Err(self.fail("Dictionary key is not a string")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    fn assert_rejected(input: &[u8]) {
        let err = decode(input).unwrap_err();
        let parse = err.downcast_ref::<TorrentError>();
        assert!(
            matches!(parse, Some(TorrentError::ParseError { .. })),
            "expected parse error for {:?}, got {}",
            String::from_utf8_lossy(input),
            err
        );
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::from("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::from(""));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d3:fool3:bard4:testl5:againi12eeee4:testi12ee").unwrap();
        assert_eq!(value.get("test").and_then(Value::as_int), Some(12));
        let foo = value.get("foo").and_then(Value::as_list).unwrap();
        assert_eq!(foo[0].as_str(), Some("bar"));
        let inner = foo[1].get("test").and_then(Value::as_list).unwrap();
        assert_eq!(inner[0].as_str(), Some("again"));
        assert_eq!(inner[1].as_int(), Some(12));
    }

    #[test]
    fn test_roundtrip_canonical() {
        let inputs: [&[u8]; 3] = [
            b"d3:fool3:bard4:testl5:againi12eeee4:testi12ee",
            b"ll4:testi2eell3:fooeli3eeee",
            b"d4:infod6:lengthi10e4:name1:xee",
        ];
        for input in inputs {
            assert_eq!(encode(&decode(input).unwrap()), input.to_vec());
        }
    }

    #[test]
    fn test_reject_malformed_integers() {
        assert_rejected(b"i-0e");
        assert_rejected(b"i01e");
        assert_rejected(b"i-01e");
        assert_rejected(b"ie");
        assert_rejected(b"i-e");
        assert_rejected(b"i12");
        assert_rejected(b"i1x2e");
    }

    #[test]
    fn test_reject_malformed_strings() {
        assert_rejected(b"");
        assert_rejected(b"04:test");
        assert_rejected(b"5:test");
        assert_rejected(b"4test");
        assert_rejected(b"x");
    }

    #[test]
    fn test_reject_bad_containers() {
        assert_rejected(b"di1ei1ee");
        assert_rejected(b"l4:test");
        assert_rejected(b"d4:testi1e");
        assert_rejected(b"d4:teste");
    }

    #[test]
    fn test_reject_trailing_data() {
        assert_rejected(b"i1ei2e");
        let (value, consumed) = decode_prefix(b"i1ei2e").unwrap();
        assert_eq!(value, Value::Integer(1));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn test_depth_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert_rejected(&deep);

        let mut ok = vec![b'l'; 10];
        ok.extend(vec![b'e'; 10]);
        assert!(decode(&ok).is_ok());
    }
}
