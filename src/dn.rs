//! Distinguished names (RFC 4514).

use crate::error::{LdapError, Result};
use crate::result_code;
use std::fmt;

/// One `type=value` pair inside an RDN.
#[derive(Debug, Clone)]
pub struct AttributeTypeAndValue {
    pub name: String,
    pub value: String,
}

/// Relative distinguished name; multi-valued RDNs are joined with `+`.
#[derive(Debug, Clone)]
pub struct Rdn {
    pub components: Vec<AttributeTypeAndValue>,
}

impl Rdn {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            components: vec![AttributeTypeAndValue {
                name: name.into(),
                value: value.into(),
            }],
        }
    }

    pub fn name(&self) -> &str {
        self.components.first().map(|c| c.name.as_str()).unwrap_or("")
    }

    pub fn value(&self) -> &str {
        self.components.first().map(|c| c.value.as_str()).unwrap_or("")
    }

    pub fn is_multivalued(&self) -> bool {
        self.components.len() > 1
    }

    fn normalized(&self) -> String {
        let mut parts: Vec<String> = self
            .components
            .iter()
            .map(|c| format!("{}={}", c.name.to_ascii_lowercase(), escape_value(&c.value.to_lowercase())))
            .collect();
        parts.sort();
        parts.join("+")
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .components
            .iter()
            .map(|c| format!("{}={}", c.name, escape_value(&c.value)))
            .collect();
        f.write_str(&parts.join("+"))
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Rdn {}

/// Parsed DN. Comparison ignores case of attribute names and values.
#[derive(Debug, Clone, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty (root) DN.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Self { rdns }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        for rdn in split_unescaped(trimmed, &[',', ';'])? {
            let mut components = Vec::new();
            for part in split_unescaped(&rdn, &['+'])? {
                components.push(parse_component(&part, s)?);
            }
            rdns.push(Rdn { components });
        }
        Ok(Self { rdns })
    }

    /// True when `s` is a syntactically valid, non-empty DN.
    pub fn is_valid(s: &str) -> bool {
        !s.trim().is_empty() && Dn::parse(s).is_ok()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// New DN with `rdn` prepended.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// True when `self` sits strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.ends_with(ancestor)
    }

    pub fn is_child_of(&self, parent: &Dn) -> bool {
        self.rdns.len() == parent.rdns.len() + 1 && self.ends_with(parent)
    }

    fn ends_with(&self, other: &Dn) -> bool {
        let offset = self.rdns.len() - other.rdns.len();
        self.rdns[offset..] == other.rdns[..]
    }

    /// Lower-cased canonical form, stable across spacing and escaping differences.
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.rdns.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl std::str::FromStr for Dn {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

fn invalid(dn: &str, reason: &str) -> LdapError {
    LdapError::operation(
        result_code::INVALID_DN_SYNTAX,
        format!("Invalid DN '{}': {}", dn, reason),
    )
}

/// Split on any of `separators` that are not escaped with a backslash or quoted.
fn split_unescaped(s: &str, separators: &[char]) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err(invalid(s, "trailing backslash")),
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if !quoted && separators.contains(&c) => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err(invalid(s, "unterminated quote"));
    }
    parts.push(current);
    Ok(parts)
}

fn parse_component(part: &str, dn: &str) -> Result<AttributeTypeAndValue> {
    let (name, value) = part
        .split_once('=')
        .ok_or_else(|| invalid(dn, "missing '='"))?;
    let name = name.trim();
    if !is_valid_attribute_name(name) {
        return Err(invalid(dn, "bad attribute type"));
    }
    let value = value.trim_start();
    // A trailing space is only significant when escaped.
    let value = if value.ends_with("\\ ") { value } else { value.trim_end() };
    let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        unescape_value(value).ok_or_else(|| invalid(dn, "bad escape sequence"))?
    };
    Ok(AttributeTypeAndValue {
        name: name.to_string(),
        value,
    })
}

fn is_valid_attribute_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric() || c == '-'),
        Some(c) if c.is_ascii_digit() => name.split('.').all(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        _ => false,
    }
}

fn unescape_value(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let next = *bytes.get(i + 1)?;
            if next.is_ascii_hexdigit() {
                let hex = value.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                out.push(next);
                i += 2;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Escape an attribute value for use inside a DN string.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dn() {
        let dn = Dn::parse("cn=foo,dc=example,dc=com").unwrap();
        assert_eq!(dn.len(), 3);
        assert_eq!(dn.rdn().unwrap().name(), "cn");
        assert_eq!(dn.rdn().unwrap().value(), "foo");
        assert_eq!(dn.to_string(), "cn=foo,dc=example,dc=com");
    }

    #[test]
    fn test_parse_escaped_values() {
        let dn = Dn::parse(r"cn=Smith\, John,ou=People\2bStaff,dc=example").unwrap();
        assert_eq!(dn.rdns()[0].value(), "Smith, John");
        assert_eq!(dn.rdns()[1].value(), "People+Staff");
        assert_eq!(dn.to_string(), r"cn=Smith\, John,ou=People\+Staff,dc=example");
    }

    #[test]
    fn test_multivalued_rdn() {
        let dn = Dn::parse("cn=a+sn=b,dc=x").unwrap();
        assert!(dn.rdn().unwrap().is_multivalued());
        assert_eq!(dn, Dn::parse("SN=B+CN=A,DC=X").unwrap());
    }

    #[test]
    fn test_comparison_is_case_insensitive() {
        let a = Dn::parse("CN=Foo, DC=Example,DC=com").unwrap();
        let b = Dn::parse("cn=foo,dc=example,dc=com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.normalized(), "cn=foo,dc=example,dc=com");
    }

    #[test]
    fn test_hierarchy() {
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let child = Dn::parse("ou=people,dc=example,dc=com").unwrap();
        let grandchild = Dn::parse("cn=a,ou=people,dc=example,dc=com").unwrap();
        assert!(child.is_child_of(&base));
        assert!(grandchild.is_descendant_of(&base));
        assert!(!grandchild.is_child_of(&base));
        assert!(!base.is_descendant_of(&base));
        assert_eq!(grandchild.parent().unwrap(), child);
        assert!(child.is_descendant_of(&Dn::root()));
    }

    #[test]
    fn test_invalid_dns() {
        assert!(!Dn::is_valid("foo@bar.local"));
        assert!(!Dn::is_valid("=foo"));
        assert!(!Dn::is_valid("cn=foo,"));
        assert!(!Dn::is_valid(r"cn=foo\"));
        assert!(!Dn::is_valid(""));
        assert!(Dn::is_valid("cn=foo,dc=bar"));
        assert!(Dn::is_valid("2.5.4.3=foo"));
        let err = Dn::parse("nonsense").unwrap_err();
        assert_eq!(err.code(), Some(result_code::INVALID_DN_SYNTAX));
    }

    #[test]
    fn test_root_dn() {
        let dn = Dn::parse("").unwrap();
        assert!(dn.is_root());
        assert_eq!(dn.to_string(), "");
        assert!(dn.parent().is_none());
    }

    #[test]
    fn test_escape_value_edges() {
        assert_eq!(escape_value(" lead"), r"\ lead");
        assert_eq!(escape_value("trail "), r"trail\ ");
        assert_eq!(escape_value("#hash"), r"\#hash");
        assert_eq!(escape_value("a=b"), r"a\=b");
    }
}
