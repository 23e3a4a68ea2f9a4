//! Search filters: RFC 4515 string form, RFC 4511 BER form, and in-memory matching.

use crate::ber::{context, context_constructed, BerReader, BerResult, BerWriter, BerError};
use crate::entry::{values_match, Entry};
use crate::error::{LdapError, Result};
use crate::result_code;
use std::fmt;

const TAG_AND: u8 = context_constructed(0);
const TAG_OR: u8 = context_constructed(1);
const TAG_NOT: u8 = context_constructed(2);
const TAG_EQUALITY: u8 = context_constructed(3);
const TAG_SUBSTRINGS: u8 = context_constructed(4);
const TAG_GREATER_OR_EQUAL: u8 = context_constructed(5);
const TAG_LESS_OR_EQUAL: u8 = context_constructed(6);
const TAG_PRESENT: u8 = context(7);
const TAG_APPROX: u8 = context_constructed(8);
const TAG_EXTENSIBLE: u8 = context_constructed(9);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    pub fn equality(attribute: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        Filter::Equality(attribute.into(), value.as_ref().to_vec())
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    /// Parse the string representation. A bare `attr=value` without
    /// surrounding parentheses is accepted.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid(s, "empty filter"));
        }
        let owned;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({})", trimmed);
            &owned
        };
        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
            source: s,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            return Err(invalid(s, "trailing characters"));
        }
        Ok(filter)
    }

    pub fn encode(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let tag = if matches!(self, Filter::And(_)) { TAG_AND } else { TAG_OR };
                let pos = writer.start_constructed(tag);
                for f in filters {
                    f.encode(writer);
                }
                writer.end_constructed(pos);
            }
            Filter::Not(inner) => {
                let pos = writer.start_constructed(TAG_NOT);
                inner.encode(writer);
                writer.end_constructed(pos);
            }
            Filter::Equality(attr, value) => encode_assertion(writer, TAG_EQUALITY, attr, value),
            Filter::GreaterOrEqual(attr, value) => encode_assertion(writer, TAG_GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual(attr, value) => encode_assertion(writer, TAG_LESS_OR_EQUAL, attr, value),
            Filter::Approx(attr, value) => encode_assertion(writer, TAG_APPROX, attr, value),
            Filter::Present(attr) => writer.write_element(TAG_PRESENT, attr.as_bytes()),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                let pos = writer.start_constructed(TAG_SUBSTRINGS);
                writer.write_string(attribute);
                let seq = writer.start_sequence();
                if let Some(initial) = initial {
                    writer.write_element(context(0), initial);
                }
                for a in any {
                    writer.write_element(context(1), a);
                }
                if let Some(final_) = final_ {
                    writer.write_element(context(2), final_);
                }
                writer.end_sequence(seq);
                writer.end_constructed(pos);
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let pos = writer.start_constructed(TAG_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    writer.write_element(context(1), rule.as_bytes());
                }
                if let Some(attr) = attribute {
                    writer.write_element(context(2), attr.as_bytes());
                }
                writer.write_element(context(3), value);
                if *dn_attributes {
                    writer.write_tagged_boolean(context(4), true);
                }
                writer.end_constructed(pos);
            }
        }
    }

    pub fn decode(reader: &mut BerReader<'_>) -> BerResult<Self> {
        let tag = reader.peek_tag().ok_or(BerError::Truncated {
            need: 1,
            remaining: 0,
        })?;
        match tag {
            TAG_AND | TAG_OR => {
                let mut inner = reader.read_constructed(tag)?;
                let mut filters = Vec::new();
                while !inner.is_empty() {
                    filters.push(Filter::decode(&mut inner)?);
                }
                Ok(if tag == TAG_AND { Filter::And(filters) } else { Filter::Or(filters) })
            }
            TAG_NOT => {
                let mut inner = reader.read_constructed(TAG_NOT)?;
                Ok(Filter::Not(Box::new(Filter::decode(&mut inner)?)))
            }
            TAG_EQUALITY | TAG_GREATER_OR_EQUAL | TAG_LESS_OR_EQUAL | TAG_APPROX => {
                let mut inner = reader.read_constructed(tag)?;
                let attr = inner.read_string()?;
                let value = inner.read_octet_string()?;
                Ok(match tag {
                    TAG_EQUALITY => Filter::Equality(attr, value),
                    TAG_GREATER_OR_EQUAL => Filter::GreaterOrEqual(attr, value),
                    TAG_LESS_OR_EQUAL => Filter::LessOrEqual(attr, value),
                    _ => Filter::Approx(attr, value),
                })
            }
            TAG_PRESENT => {
                let content = reader.read_tagged(TAG_PRESENT)?;
                Ok(Filter::Present(crate::ber::decode_string(content)?))
            }
            TAG_SUBSTRINGS => {
                let mut inner = reader.read_constructed(TAG_SUBSTRINGS)?;
                let attribute = inner.read_string()?;
                let mut seq = inner.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                while !seq.is_empty() {
                    let (t, content) = seq.read_element()?;
                    match t {
                        0x80 => initial = Some(content.to_vec()),
                        0x81 => any.push(content.to_vec()),
                        0x82 => final_ = Some(content.to_vec()),
                        other => {
                            return Err(BerError::UnexpectedTag {
                                expected: 0x81,
                                actual: other,
                            })
                        }
                    }
                }
                Ok(Filter::Substrings {
                    attribute,
                    initial,
                    any,
                    final_,
                })
            }
            TAG_EXTENSIBLE => {
                let mut inner = reader.read_constructed(TAG_EXTENSIBLE)?;
                let matching_rule = inner
                    .read_optional(context(1))?
                    .map(crate::ber::decode_string)
                    .transpose()?;
                let attribute = inner
                    .read_optional(context(2))?
                    .map(crate::ber::decode_string)
                    .transpose()?;
                let value = inner.read_tagged(context(3))?.to_vec();
                let dn_attributes = match inner.read_optional(context(4))? {
                    Some(content) => crate::ber::decode_boolean(content)?,
                    None => false,
                };
                Ok(Filter::Extensible {
                    matching_rule,
                    attribute,
                    value,
                    dn_attributes,
                })
            }
            other => Err(BerError::Malformed(format!("unknown filter tag 0x{:02X}", other))),
        }
    }

    /// Evaluate against an entry using case-insensitive string semantics.
    /// Extensible filters only honour the attribute/value part.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass") || entry.has(attr)
            }
            Filter::Equality(attr, value) | Filter::Approx(attr, value) => entry
                .get(attr)
                .map(|a| a.contains(value))
                .unwrap_or(false),
            Filter::GreaterOrEqual(attr, value) => compare_any(entry, attr, |v| cmp_values(v, value).is_ge()),
            Filter::LessOrEqual(attr, value) => compare_any(entry, attr, |v| cmp_values(v, value).is_le()),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => compare_any(entry, attribute, |v| {
                substring_match(v, initial.as_deref(), any, final_.as_deref())
            }),
            Filter::Extensible {
                attribute, value, ..
            } => match attribute {
                Some(attr) => entry.get(attr).map(|a| a.contains(value)).unwrap_or(false),
                None => entry.attributes.iter().any(|a| a.contains(value)),
            },
        }
    }
}

fn encode_assertion(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(pos);
}

fn compare_any(entry: &Entry, attr: &str, pred: impl Fn(&[u8]) -> bool) -> bool {
    entry
        .get(attr)
        .map(|a| a.values.iter().any(|v| pred(v)))
        .unwrap_or(false)
}

fn cmp_values(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let (sa, sb) = (String::from_utf8_lossy(a), String::from_utf8_lossy(b));
    match (sa.parse::<i64>(), sb.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => sa.to_lowercase().cmp(&sb.to_lowercase()),
    }
}

fn substring_match(value: &[u8], initial: Option<&[u8]>, any: &[Vec<u8>], final_: Option<&[u8]>) -> bool {
    let value = String::from_utf8_lossy(value).to_lowercase();
    let lower = |b: &[u8]| String::from_utf8_lossy(b).to_lowercase();
    let mut rest = value.as_str();
    if let Some(initial) = initial {
        let initial = lower(initial);
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    let final_ = final_.map(lower);
    if let Some(f) = &final_ {
        match rest.strip_suffix(f.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for a in any {
        let a = lower(a);
        match rest.find(a.as_str()) {
            Some(i) => rest = &rest[i + a.len()..],
            None => return false,
        }
    }
    true
}

fn invalid(filter: &str, reason: &str) -> LdapError {
    LdapError::operation(
        result_code::PROTOCOL_ERROR,
        format!("Invalid filter '{}': {}", filter, reason),
    )
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn expect(&mut self, b: u8) -> Result<()> {
        if self.input.get(self.pos) == Some(&b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(self.source, &format!("expected '{}' at {}", b as char, self.pos)))
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.input.get(self.pos) {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(invalid(self.source, "unexpected end")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.input.get(self.pos) == Some(&b'(') {
            filters.push(self.parse_filter()?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(&b) = self.input.get(self.pos) {
            if b == b')' {
                break;
            }
            if b == b'(' {
                return Err(invalid(self.source, "unescaped '(' in value"));
            }
            self.pos += 1;
        }
        let item = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| invalid(self.source, "invalid UTF-8"))?;
        let eq = item.find('=').ok_or_else(|| invalid(self.source, "missing '='"))?;
        let (lhs, raw_value) = (&item[..eq], &item[eq + 1..]);
        if let Some(attr) = lhs.strip_suffix('~') {
            return Ok(Filter::Approx(self.attr(attr)?, self.unescape(raw_value)?));
        }
        if let Some(attr) = lhs.strip_suffix('>') {
            return Ok(Filter::GreaterOrEqual(self.attr(attr)?, self.unescape(raw_value)?));
        }
        if let Some(attr) = lhs.strip_suffix('<') {
            return Ok(Filter::LessOrEqual(self.attr(attr)?, self.unescape(raw_value)?));
        }
        if let Some(ext) = lhs.strip_suffix(':') {
            return self.parse_extensible(ext, raw_value);
        }
        let attr = self.attr(lhs)?;
        if raw_value == "*" {
            return Ok(Filter::Present(attr));
        }
        if raw_value.contains('*') {
            let parts: Vec<&str> = raw_value.split('*').collect();
            let last = parts.len() - 1;
            let mut initial = None;
            let mut any = Vec::new();
            let mut final_ = None;
            for (i, part) in parts.iter().enumerate() {
                if part.is_empty() {
                    continue;
                }
                let value = self.unescape(part)?;
                if i == 0 {
                    initial = Some(value);
                } else if i == last {
                    final_ = Some(value);
                } else {
                    any.push(value);
                }
            }
            return Ok(Filter::Substrings {
                attribute: attr,
                initial,
                any,
                final_,
            });
        }
        Ok(Filter::Equality(attr, self.unescape(raw_value)?))
    }

    /// `attr[:dn][:rule]` or `[:dn]:rule` followed by `:=value`.
    fn parse_extensible(&self, lhs: &str, raw_value: &str) -> Result<Filter> {
        let mut parts = lhs.split(':');
        let attr_part = parts.next().unwrap_or("");
        let attribute = if attr_part.is_empty() {
            None
        } else {
            Some(self.attr(attr_part)?)
        };
        let mut dn_attributes = false;
        let mut matching_rule = None;
        for part in parts {
            if part.eq_ignore_ascii_case("dn") {
                dn_attributes = true;
            } else if !part.is_empty() {
                matching_rule = Some(part.to_string());
            }
        }
        if attribute.is_none() && matching_rule.is_none() {
            return Err(invalid(self.source, "extensible match needs a type or a rule"));
        }
        Ok(Filter::Extensible {
            matching_rule,
            attribute,
            value: self.unescape(raw_value)?,
            dn_attributes,
        })
    }

    fn attr(&self, s: &str) -> Result<String> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';') {
            return Err(invalid(self.source, "bad attribute description"));
        }
        Ok(s.to_string())
    }

    fn unescape(&self, s: &str) -> Result<Vec<u8>> {
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                let hex = s
                    .get(i + 1..i + 3)
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| invalid(self.source, "bad escape sequence"))?;
                out.push(hex);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Ok(out)
    }
}

/// Escape a value for the string form of a filter.
pub fn escape_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    match std::str::from_utf8(value) {
        Ok(s) => {
            for c in s.chars() {
                match c {
                    '*' => out.push_str("\\2a"),
                    '(' => out.push_str("\\28"),
                    ')' => out.push_str("\\29"),
                    '\\' => out.push_str("\\5c"),
                    '\0' => out.push_str("\\00"),
                    c => out.push(c),
                }
            }
        }
        Err(_) => {
            for b in value {
                out.push_str(&format!("\\{:02x}", b));
            }
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) => {
                f.write_str("(&")?;
                for inner in filters {
                    write!(f, "{}", inner)?;
                }
                f.write_str(")")
            }
            Filter::Or(filters) => {
                f.write_str("(|")?;
                for inner in filters {
                    write!(f, "{}", inner)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality(a, v) => write!(f, "({}={})", a, escape_value(v)),
            Filter::GreaterOrEqual(a, v) => write!(f, "({}>={})", a, escape_value(v)),
            Filter::LessOrEqual(a, v) => write!(f, "({}<={})", a, escape_value(v)),
            Filter::Approx(a, v) => write!(f, "({}~={})", a, escape_value(v)),
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(i) = initial {
                    f.write_str(&escape_value(i))?;
                }
                f.write_str("*")?;
                for a in any {
                    write!(f, "{}*", escape_value(a))?;
                }
                if let Some(fin) = final_ {
                    f.write_str(&escape_value(fin))?;
                }
                f.write_str(")")
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(a) = attribute {
                    f.write_str(a)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_value(value))
            }
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}
