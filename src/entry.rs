//! Directory entries and attributes.

use crate::ber::{BerReader, BerResult, BerWriter, TAG_SET};
use crate::dn::Dn;

/// Attribute description (`type;option1;option2`) with its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn from_strs<S: AsRef<str>>(name: impl Into<String>, values: &[S]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.as_ref().as_bytes().to_vec()).collect(),
        }
    }

    /// Attribute type without options.
    pub fn base_name(&self) -> &str {
        self.name.split(';').next().unwrap_or("")
    }

    /// Options following the type, e.g. `binary` or `range=0-1499`.
    pub fn options(&self) -> Vec<AttributeOption> {
        self.name.split(';').skip(1).map(AttributeOption::parse).collect()
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options()
            .iter()
            .any(|o| o.to_string().eq_ignore_ascii_case(option))
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn first_str(&self) -> Option<&str> {
        self.values.first().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn strings(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| values_match(v, value))
    }

    /// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
    pub(crate) fn encode(&self, writer: &mut BerWriter) {
        let seq = writer.start_sequence();
        writer.write_string(&self.name);
        let set = writer.start_constructed(TAG_SET);
        for value in &self.values {
            writer.write_octet_string(value);
        }
        writer.end_constructed(set);
        writer.end_sequence(seq);
    }

    pub(crate) fn decode(reader: &mut BerReader<'_>) -> BerResult<Self> {
        let mut seq = reader.read_sequence()?;
        let name = seq.read_string()?;
        let mut set = seq.read_constructed(TAG_SET)?;
        let mut values = Vec::new();
        while !set.is_empty() {
            values.push(set.read_octet_string()?);
        }
        Ok(Self { name, values })
    }
}

/// Case-insensitive comparison for UTF-8 values, byte comparison otherwise.
pub(crate) fn values_match(a: &[u8], b: &[u8]) -> bool {
    match (std::str::from_utf8(a), std::str::from_utf8(b)) {
        (Ok(a), Ok(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => a == b,
    }
}

/// Attribute option, with a dedicated variant for range retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeOption {
    Range { low: u64, high: Option<u64> },
    Tag(String),
}

impl AttributeOption {
    pub fn parse(s: &str) -> Self {
        if let Some(range) = s.strip_prefix("range=").or_else(|| s.strip_prefix("Range=")) {
            if let Some((low, high)) = range.split_once('-') {
                if let Ok(low) = low.parse() {
                    let high = if high == "*" { None } else { high.parse().ok() };
                    if high.is_some() || range.ends_with('*') {
                        return AttributeOption::Range { low, high };
                    }
                }
            }
        }
        AttributeOption::Tag(s.to_string())
    }
}

impl std::fmt::Display for AttributeOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeOption::Range { low, high: Some(high) } => write!(f, "range={}-{}", low, high),
            AttributeOption::Range { low, high: None } => write!(f, "range={}-*", low),
            AttributeOption::Tag(tag) => f.write_str(tag),
        }
    }
}

/// An entry: DN plus attributes. The DN is kept verbatim since some
/// controls (extended DN) return strings that are not plain DNs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    pub fn parsed_dn(&self) -> crate::error::Result<Dn> {
        Dn::parse(&self.dn)
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_named(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.is_named(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Attribute::first_str)
    }

    /// Replace or insert an attribute.
    pub fn set(&mut self, attribute: Attribute) {
        match self.get_mut(&attribute.name) {
            Some(existing) => existing.values = attribute.values,
            None => self.attributes.push(attribute),
        }
    }

    /// Append values, creating the attribute when missing. Duplicates are skipped.
    pub fn add(&mut self, attribute: Attribute) {
        match self.get_mut(&attribute.name) {
            Some(existing) => {
                for value in attribute.values {
                    if !existing.contains(&value) {
                        existing.values.push(value);
                    }
                }
            }
            None => self.attributes.push(attribute),
        }
    }

    /// Remove the given values, or the whole attribute if `values` is empty.
    pub fn remove(&mut self, name: &str, values: &[Vec<u8>]) {
        if values.is_empty() {
            self.attributes.retain(|a| !a.is_named(name));
            return;
        }
        if let Some(existing) = self.get_mut(name) {
            existing.values.retain(|v| !values.iter().any(|r| values_match(v, r)));
        }
        self.attributes.retain(|a| !a.values.is_empty());
    }

    /// Copy restricted to the requested attribute list (`*` or empty = all user
    /// attributes, `1.1` = none), with values stripped when `types_only`.
    pub fn filtered(&self, requested: &[String], types_only: bool) -> Entry {
        let wants_all = requested.is_empty() || requested.iter().any(|a| a == "*");
        let wants_none = requested.len() == 1 && requested[0] == "1.1";
        let attributes = self
            .attributes
            .iter()
            .filter(|a| {
                !wants_none
                    && (wants_all || requested.iter().any(|r| r.eq_ignore_ascii_case(a.base_name())))
            })
            .map(|a| Attribute {
                name: a.name.clone(),
                values: if types_only { Vec::new() } else { a.values.clone() },
            })
            .collect();
        Entry {
            dn: self.dn.clone(),
            attributes,
        }
    }
}
