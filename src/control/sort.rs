// Server-side sorting (RFC 2891) and virtual list view (draft-ietf-ldapext-ldapv3-vlv).

use crate::ber::{context, context_constructed, BerError, BerReader, BerResult, BerWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

pub(super) fn encode_sort_request(keys: &[SortKey]) -> Vec<u8> {
    let mut w = BerWriter::new();
    let outer = w.start_sequence();
    for key in keys {
        let seq = w.start_sequence();
        w.write_string(&key.attribute);
        if let Some(rule) = &key.ordering_rule {
            w.write_element(context(0), rule.as_bytes());
        }
        if key.reverse {
            w.write_tagged_boolean(context(1), true);
        }
        w.end_sequence(seq);
    }
    w.end_sequence(outer);
    w.into_vec()
}

pub(super) fn decode_sort_request(value: &[u8]) -> BerResult<Vec<SortKey>> {
    let mut outer = BerReader::new(value).read_sequence()?;
    let mut keys = Vec::new();
    while !outer.is_empty() {
        let mut seq = outer.read_sequence()?;
        let attribute = seq.read_string()?;
        let ordering_rule = seq
            .read_optional(context(0))?
            .map(crate::ber::decode_string)
            .transpose()?;
        let reverse = match seq.read_optional(context(1))? {
            Some(c) => crate::ber::decode_boolean(c)?,
            None => false,
        };
        keys.push(SortKey {
            attribute,
            ordering_rule,
            reverse,
        });
    }
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortResponseControl {
    pub result: i64,
    pub attribute: Option<String>,
}

impl SortResponseControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_enumerated(self.result);
        if let Some(attr) = &self.attribute {
            w.write_element(context(0), attr.as_bytes());
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        Ok(Self {
            result: seq.read_enumerated()?,
            attribute: seq
                .read_optional(context(0))?
                .map(crate::ber::decode_string)
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    ByOffset { offset: i64, content_count: i64 },
    GreaterOrEqual(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvRequestControl {
    pub before_count: i64,
    pub after_count: i64,
    pub target: VlvTarget,
    pub context_id: Option<Vec<u8>>,
}

impl VlvRequestControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(self.before_count);
        w.write_integer(self.after_count);
        match &self.target {
            VlvTarget::ByOffset {
                offset,
                content_count,
            } => {
                let pos = w.start_constructed(context_constructed(0));
                w.write_integer(*offset);
                w.write_integer(*content_count);
                w.end_constructed(pos);
            }
            VlvTarget::GreaterOrEqual(value) => w.write_element(context(1), value),
        }
        if let Some(id) = &self.context_id {
            w.write_octet_string(id);
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        let before_count = seq.read_integer()?;
        let after_count = seq.read_integer()?;
        let target = match seq.peek_tag() {
            Some(t) if t == context_constructed(0) => {
                let mut inner = seq.read_constructed(t)?;
                VlvTarget::ByOffset {
                    offset: inner.read_integer()?,
                    content_count: inner.read_integer()?,
                }
            }
            Some(t) if t == context(1) => VlvTarget::GreaterOrEqual(seq.read_tagged(t)?.to_vec()),
            Some(t) => {
                return Err(BerError::UnexpectedTag {
                    expected: context_constructed(0),
                    actual: t,
                })
            }
            None => return Err(BerError::Truncated { need: 1, remaining: 0 }),
        };
        let context_id = if seq.is_empty() {
            None
        } else {
            Some(seq.read_octet_string()?)
        };
        Ok(Self {
            before_count,
            after_count,
            target,
            context_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponseControl {
    pub target_position: i64,
    pub content_count: i64,
    pub result: i64,
    pub context_id: Option<Vec<u8>>,
}

impl VlvResponseControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(self.target_position);
        w.write_integer(self.content_count);
        w.write_enumerated(self.result);
        if let Some(id) = &self.context_id {
            w.write_octet_string(id);
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        let target_position = seq.read_integer()?;
        let content_count = seq.read_integer()?;
        let result = seq.read_enumerated()?;
        let context_id = if seq.is_empty() {
            None
        } else {
            Some(seq.read_octet_string()?)
        };
        Ok(Self {
            target_position,
            content_count,
            result,
            context_id,
        })
    }
}
