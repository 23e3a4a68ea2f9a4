// Request operations (RFC 4511 section 4).

use crate::ber::{context, context_constructed, BerError, BerReader, BerResult, BerWriter};
use crate::entry::{Attribute, Entry};
use crate::filter::Filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.as_ref().to_vec()),
        }
    }

    pub fn anonymous() -> Self {
        Self::simple("", "")
    }

    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    /// Anonymous when both name and simple password are empty.
    pub fn is_anonymous(&self) -> bool {
        match &self.authentication {
            BindAuthentication::Simple(password) => self.name.is_empty() && password.is_empty(),
            BindAuthentication::Sasl { .. } => false,
        }
    }

    pub fn is_sasl(&self) -> bool {
        matches!(self.authentication, BindAuthentication::Sasl { .. })
    }

    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_integer(i64::from(self.version));
        w.write_string(&self.name);
        match &self.authentication {
            BindAuthentication::Simple(password) => w.write_element(context(0), password),
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                let pos = w.start_constructed(context_constructed(3));
                w.write_string(mechanism);
                if let Some(creds) = credentials {
                    w.write_octet_string(creds);
                }
                w.end_constructed(pos);
            }
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let version = r.read_i32()?;
        let name = r.read_string()?;
        let authentication = match r.peek_tag() {
            Some(t) if t == context(0) => BindAuthentication::Simple(r.read_tagged(t)?.to_vec()),
            Some(t) if t == context_constructed(3) => {
                let mut sasl = r.read_constructed(t)?;
                let mechanism = sasl.read_string()?;
                let credentials = if sasl.is_empty() {
                    None
                } else {
                    Some(sasl.read_octet_string()?)
                };
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                }
            }
            Some(t) => {
                return Err(BerError::UnexpectedTag {
                    expected: context(0),
                    actual: t,
                })
            }
            None => return Err(BerError::Truncated { need: 1, remaining: 0 }),
        };
        Ok(Self {
            version,
            name,
            authentication,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    #[default]
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = BerError;

    fn try_from(value: i64) -> BerResult<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(BerError::Malformed(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = BerError;

    fn try_from(value: i64) -> BerResult<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => Err(BerError::Malformed(format!("invalid deref aliases: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    /// Base-scope read of a single entry.
    pub fn base(dn: impl Into<String>) -> Self {
        Self::new(dn, SearchScope::BaseObject, Filter::present("objectClass"))
    }

    pub fn with_attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size_limit(mut self, size_limit: i32) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// Base-scope search of the empty DN.
    pub fn is_root_dse(&self) -> bool {
        self.scope == SearchScope::BaseObject && self.base_dn.is_empty()
    }

    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_string(&self.base_dn);
        w.write_enumerated(self.scope as i64);
        w.write_enumerated(self.deref_aliases as i64);
        w.write_integer(i64::from(self.size_limit));
        w.write_integer(i64::from(self.time_limit));
        w.write_boolean(self.types_only);
        self.filter.encode(w);
        let attrs = w.start_sequence();
        for attr in &self.attributes {
            w.write_string(attr);
        }
        w.end_sequence(attrs);
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let base_dn = r.read_string()?;
        let scope = SearchScope::try_from(r.read_enumerated()?)?;
        let deref_aliases = DerefAliases::try_from(r.read_enumerated()?)?;
        let size_limit = r.read_i32()?;
        let time_limit = r.read_i32()?;
        let types_only = r.read_boolean()?;
        let filter = Filter::decode(r)?;
        let mut attrs = r.read_sequence()?;
        let mut attributes = Vec::new();
        while !attrs.is_empty() {
            attributes.push(attrs.read_string()?);
        }
        Ok(Self {
            base_dn,
            scope,
            deref_aliases,
            size_limit,
            time_limit,
            types_only,
            filter,
            attributes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl TryFrom<i64> for ModifyOperation {
    type Error = BerError;

    fn try_from(value: i64) -> BerResult<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            3 => Ok(ModifyOperation::Increment),
            _ => Err(BerError::Malformed(format!("invalid modify operation: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: Attribute,
}

impl Modification {
    pub fn add(attribute: Attribute) -> Self {
        Self {
            operation: ModifyOperation::Add,
            attribute,
        }
    }

    pub fn delete(attribute: Attribute) -> Self {
        Self {
            operation: ModifyOperation::Delete,
            attribute,
        }
    }

    pub fn replace(attribute: Attribute) -> Self {
        Self {
            operation: ModifyOperation::Replace,
            attribute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

impl ModifyRequest {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_string(&self.dn);
        let changes = w.start_sequence();
        for change in &self.changes {
            let seq = w.start_sequence();
            w.write_enumerated(change.operation as i64);
            change.attribute.encode(w);
            w.end_sequence(seq);
        }
        w.end_sequence(changes);
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let dn = r.read_string()?;
        let mut seq = r.read_sequence()?;
        let mut changes = Vec::new();
        while !seq.is_empty() {
            let mut change = seq.read_sequence()?;
            let operation = ModifyOperation::try_from(change.read_enumerated()?)?;
            let attribute = Attribute::decode(&mut change)?;
            changes.push(Modification {
                operation,
                attribute,
            });
        }
        Ok(Self { dn, changes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: Entry,
}

impl AddRequest {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_string(&self.entry.dn);
        let attrs = w.start_sequence();
        for attr in &self.entry.attributes {
            attr.encode(w);
        }
        w.end_sequence(attrs);
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let dn = r.read_string()?;
        let mut seq = r.read_sequence()?;
        let mut attributes = Vec::new();
        while !seq.is_empty() {
            attributes.push(Attribute::decode(&mut seq)?);
        }
        Ok(Self {
            entry: Entry::with_attributes(dn, attributes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ModifyDnRequest {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_string(&self.dn);
        w.write_string(&self.new_rdn);
        w.write_boolean(self.delete_old_rdn);
        if let Some(superior) = &self.new_superior {
            w.write_element(context(0), superior.as_bytes());
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        Ok(Self {
            dn: r.read_string()?,
            new_rdn: r.read_string()?,
            delete_old_rdn: r.read_boolean()?,
            new_superior: r
                .read_optional(context(0))?
                .map(crate::ber::decode_string)
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

impl CompareRequest {
    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_string(&self.dn);
        let ava = w.start_sequence();
        w.write_string(&self.attribute);
        w.write_octet_string(&self.value);
        w.end_sequence(ava);
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let dn = r.read_string()?;
        let mut ava = r.read_sequence()?;
        Ok(Self {
            dn,
            attribute: ava.read_string()?,
            value: ava.read_octet_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(name: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub(super) fn encode(&self, w: &mut BerWriter) {
        w.write_element(context(0), self.name.as_bytes());
        if let Some(value) = &self.value {
            w.write_element(context(1), value);
        }
    }

    pub(super) fn decode(r: &mut BerReader<'_>) -> BerResult<Self> {
        let name = crate::ber::decode_string(r.read_tagged(context(0))?)?;
        let value = r.read_optional(context(1))?.map(<[u8]>::to_vec);
        Ok(Self { name, value })
    }
}
