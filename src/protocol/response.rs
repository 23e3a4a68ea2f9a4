// Response operations and the LDAPResult component.

use crate::ber::{context, context_constructed, BerReader, BerResult, BerWriter};
use crate::entry::{Attribute, Entry};
use crate::error::{LdapError, Result};
use crate::result_code;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub code: u32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: u32, diagnostic_message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(result_code::SUCCESS, "")
    }

    pub fn referral(urls: Vec<String>) -> Self {
        Self {
            referrals: urls,
            ..Self::new(result_code::REFERRAL, "")
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == result_code::SUCCESS
    }

    pub fn is_referral(&self) -> bool {
        self.code == result_code::REFERRAL
    }

    /// Converts codes outside the non-error allow-list into an error.
    pub fn check(&self) -> Result<()> {
        if result_code::is_non_error(self.code) {
            return Ok(());
        }
        Err(self.to_error())
    }

    pub fn to_error(&self) -> LdapError {
        if self.is_referral() {
            return LdapError::Referral {
                urls: self.referrals.clone(),
                message: self.diagnostic_message.clone(),
            };
        }
        LdapError::Operation {
            code: self.code,
            message: self.diagnostic_message.clone(),
            matched_dn: self.matched_dn.clone(),
        }
    }

    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_enumerated(i64::from(self.code));
        w.write_string(&self.matched_dn);
        w.write_string(&self.diagnostic_message);
        if !self.referrals.is_empty() {
            let pos = w.start_constructed(context_constructed(3));
            for url in &self.referrals {
                w.write_string(url);
            }
            w.end_constructed(pos);
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let code = r.read_enumerated()?;
        let matched_dn = r.read_string()?;
        let diagnostic_message = r.read_string()?;
        let mut referrals = Vec::new();
        if r.peek_tag() == Some(context_constructed(3)) {
            let mut urls = r.read_constructed(context_constructed(3))?;
            while !urls.is_empty() {
                referrals.push(urls.read_string()?);
            }
        }
        Ok(Self {
            code: u32::try_from(code).unwrap_or(result_code::OTHER),
            matched_dn,
            diagnostic_message,
            referrals,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

impl BindResponse {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        self.result.encode(w);
        if let Some(creds) = &self.server_sasl_creds {
            w.write_element(context(7), creds);
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let result = LdapResult::decode(r)?;
        let server_sasl_creds = r.read_optional(context(7))?.map(<[u8]>::to_vec);
        Ok(Self {
            result,
            server_sasl_creds,
        })
    }
}

pub(super) fn encode_entry(entry: &Entry, w: &mut BerWriter) {
    w.write_string(&entry.dn);
    let attrs = w.start_sequence();
    for attr in &entry.attributes {
        attr.encode(w);
    }
    w.end_sequence(attrs);
}

pub(super) fn decode_entry(r: &mut BerReader<'_>) -> BerResult<Entry> {
    let dn = r.read_string()?;
    let mut seq = r.read_sequence()?;
    let mut attributes = Vec::new();
    while !seq.is_empty() {
        attributes.push(Attribute::decode(&mut seq)?);
    }
    Ok(Entry::with_attributes(dn, attributes))
}

pub(super) fn encode_urls(urls: &[String], w: &mut BerWriter) {
    for url in urls {
        w.write_string(url);
    }
}

pub(super) fn decode_urls(r: &mut BerReader<'_>) -> BerResult<Vec<String>> {
    let mut urls = Vec::new();
    while !r.is_empty() {
        urls.push(r.read_string()?);
    }
    Ok(urls)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            name: None,
            value: None,
        }
    }

    pub(super) fn encode(&self, w: &mut BerWriter) {
        self.result.encode(w);
        if let Some(name) = &self.name {
            w.write_element(context(10), name.as_bytes());
        }
        if let Some(value) = &self.value {
            w.write_element(context(11), value);
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let result = LdapResult::decode(r)?;
        let name = r
            .read_optional(context(10))?
            .map(crate::ber::decode_string)
            .transpose()?;
        let value = r.read_optional(context(11))?.map(<[u8]>::to_vec);
        Ok(Self {
            result,
            name,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl IntermediateResponse {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        if let Some(name) = &self.name {
            w.write_element(context(0), name.as_bytes());
        }
        if let Some(value) = &self.value {
            w.write_element(context(1), value);
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let name = r
            .read_optional(context(0))?
            .map(crate::ber::decode_string)
            .transpose()?;
        let value = r.read_optional(context(1))?.map(<[u8]>::to_vec);
        Ok(Self { name, value })
    }
}

/// Client-side aggregate of a completed search: the terminal result plus
/// every entry and continuation reference received before it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResponse {
    pub result: LdapResult,
    pub entries: Vec<Entry>,
    pub references: Vec<Vec<String>>,
}

impl SearchResponse {
    pub fn entry(&self) -> Option<&Entry> {
        self.entries.first()
    }

    pub fn referral_urls(&self) -> impl Iterator<Item = &String> {
        self.references.iter().flatten()
    }
}
