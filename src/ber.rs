// BER encoding/decoding for LDAP v3 PDUs
// Single-byte tags only: every tag LDAP uses fits in the low-tag-number form.

use thiserror::Error;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

pub const CLASS_APPLICATION: u8 = 0x40;
pub const CLASS_CONTEXT: u8 = 0x80;
pub const CONSTRUCTED: u8 = 0x20;

/// Context-specific primitive tag `[n]`.
pub const fn context(n: u8) -> u8 {
    CLASS_CONTEXT | n
}

/// Context-specific constructed tag `[n]`.
pub const fn context_constructed(n: u8) -> u8 {
    CLASS_CONTEXT | CONSTRUCTED | n
}

/// Application primitive tag `[APPLICATION n]`.
pub const fn application(n: u8) -> u8 {
    CLASS_APPLICATION | n
}

/// Application constructed tag `[APPLICATION n]`.
pub const fn application_constructed(n: u8) -> u8 {
    CLASS_APPLICATION | CONSTRUCTED | n
}

/// Tag number without class and constructed bits.
pub const fn tag_number(tag: u8) -> u8 {
    tag & 0x1F
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BerError {
    #[error("BER truncated: need {need} bytes, {remaining} remaining")]
    Truncated { need: usize, remaining: usize },
    #[error("expected tag 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("indefinite length not supported")]
    IndefiniteLength,
    #[error("length too large: {0} bytes")]
    LengthTooLarge(usize),
    #[error("integer too large: {0} bytes")]
    IntegerTooLarge(usize),
    #[error("invalid boolean length: {0}")]
    InvalidBoolean(usize),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("{0}")]
    Malformed(String),
}

pub type BerResult<T> = std::result::Result<T, BerError>;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Total length (header + content) of the first TLV in `buf`, or `None` when
/// more bytes are needed to know it.
pub fn peek_frame_length(buf: &[u8]) -> BerResult<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        return Ok(Some(2 + first as usize));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 {
        return Err(BerError::IndefiniteLength);
    }
    if length_bytes > 4 {
        return Err(BerError::LengthTooLarge(length_bytes));
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for b in &buf[2..2 + length_bytes] {
        length = (length << 8) | *b as usize;
    }
    if length > MAX_FRAME_LENGTH {
        return Err(BerError::LengthTooLarge(length));
    }
    Ok(Some(2 + length_bytes + length))
}

/// Reader over a BER buffer. Constructed values are read into sub-readers so
/// that `is_empty()` always refers to the enclosing element.
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> BerResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(BerError::Truncated {
                need: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_length(&mut self) -> BerResult<usize> {
        let first = self.take(1)?[0];
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(BerError::IndefiniteLength);
        }
        if length_bytes > 4 {
            return Err(BerError::LengthTooLarge(length_bytes));
        }
        let mut length = 0usize;
        for b in self.take(length_bytes)? {
            length = (length << 8) | *b as usize;
        }
        Ok(length)
    }

    /// Read one TLV, returning its tag and content bytes.
    pub fn read_element(&mut self) -> BerResult<(u8, &'a [u8])> {
        let tag = self.take(1)?[0];
        let length = self.read_length()?;
        let content = self.take(length)?;
        Ok((tag, content))
    }

    /// Read one TLV and return it unparsed, header included.
    pub fn read_raw_element(&mut self) -> BerResult<&'a [u8]> {
        let start = self.pos;
        self.read_element()?;
        Ok(&self.data[start..self.pos])
    }

    /// Read a TLV whose tag must equal `tag`.
    pub fn read_tagged(&mut self, tag: u8) -> BerResult<&'a [u8]> {
        let actual = self.peek_tag().ok_or(BerError::Truncated {
            need: 1,
            remaining: 0,
        })?;
        if actual != tag {
            return Err(BerError::UnexpectedTag {
                expected: tag,
                actual,
            });
        }
        Ok(self.read_element()?.1)
    }

    /// Read a TLV with `tag` only if it is next.
    pub fn read_optional(&mut self, tag: u8) -> BerResult<Option<&'a [u8]>> {
        if self.peek_tag() == Some(tag) {
            Ok(Some(self.read_element()?.1))
        } else {
            Ok(None)
        }
    }

    pub fn read_constructed(&mut self, tag: u8) -> BerResult<BerReader<'a>> {
        Ok(BerReader::new(self.read_tagged(tag)?))
    }

    pub fn read_sequence(&mut self) -> BerResult<BerReader<'a>> {
        self.read_constructed(TAG_SEQUENCE)
    }

    pub fn read_integer(&mut self) -> BerResult<i64> {
        let content = self.read_tagged(TAG_INTEGER)?;
        decode_integer(content)
    }

    pub fn read_i32(&mut self) -> BerResult<i32> {
        let value = self.read_integer()?;
        i32::try_from(value).map_err(|_| BerError::IntegerTooLarge(8))
    }

    pub fn read_enumerated(&mut self) -> BerResult<i64> {
        let content = self.read_tagged(TAG_ENUMERATED)?;
        decode_integer(content)
    }

    pub fn read_boolean(&mut self) -> BerResult<bool> {
        let content = self.read_tagged(TAG_BOOLEAN)?;
        decode_boolean(content)
    }

    pub fn read_octet_string(&mut self) -> BerResult<Vec<u8>> {
        Ok(self.read_tagged(TAG_OCTET_STRING)?.to_vec())
    }

    pub fn read_string(&mut self) -> BerResult<String> {
        let bytes = self.read_tagged(TAG_OCTET_STRING)?;
        decode_string(bytes)
    }
}

pub fn decode_integer(content: &[u8]) -> BerResult<i64> {
    if content.is_empty() {
        return Err(BerError::Malformed("empty integer".to_string()));
    }
    if content.len() > 8 {
        return Err(BerError::IntegerTooLarge(content.len()));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for b in content {
        value = (value << 8) | *b as i64;
    }
    Ok(value)
}

pub fn decode_boolean(content: &[u8]) -> BerResult<bool> {
    if content.len() != 1 {
        return Err(BerError::InvalidBoolean(content.len()));
    }
    Ok(content[0] != 0)
}

pub fn decode_string(content: &[u8]) -> BerResult<String> {
    String::from_utf8(content.to_vec()).map_err(|_| BerError::InvalidUtf8)
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

fn encode_integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Drop redundant leading sign octets.
    while start < 7 {
        let b = bytes[start];
        let next_high = bytes[start + 1] & 0x80;
        if (b == 0x00 && next_high == 0) || (b == 0xFF && next_high != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    /// Write a complete primitive TLV.
    pub fn write_element(&mut self, tag: u8, content: &[u8]) {
        self.buffer.push(tag);
        self.buffer.extend_from_slice(&encode_length(content.len()));
        self.buffer.extend_from_slice(content);
    }

    /// Append already-encoded bytes.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_tagged_integer(TAG_INTEGER, value);
    }

    pub fn write_tagged_integer(&mut self, tag: u8, value: i64) {
        let content = encode_integer_content(value);
        self.write_element(tag, &content);
    }

    pub fn write_enumerated(&mut self, value: i64) {
        self.write_tagged_integer(TAG_ENUMERATED, value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tagged_boolean(TAG_BOOLEAN, value);
    }

    pub fn write_tagged_boolean(&mut self, tag: u8, value: bool) {
        self.write_element(tag, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_element(TAG_OCTET_STRING, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_null(&mut self, tag: u8) {
        self.write_element(tag, &[]);
    }

    /// Open a constructed element; close it with `end_constructed(pos)`.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.buffer.push(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length of the element opened at `pos`, short or long form.
    pub fn end_constructed(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let encoded = encode_length(content_len);
        self.buffer.splice(pos..pos + 1, encoded);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(TAG_SEQUENCE)
    }

    pub fn end_sequence(&mut self, pos: usize) {
        self.end_constructed(pos);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}
