//! LDAP URLs (RFC 4516): `ldap[s]://host:port/dn?attributes?scope?filter?extensions`

use crate::error::{LdapError, Result};
use std::fmt;

pub const DEFAULT_PORT: u16 = 389;
pub const DEFAULT_SSL_PORT: u16 = 636;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub use_ssl: bool,
    pub host: String,
    pub port: Option<u16>,
    pub dn: Option<String>,
    pub attributes: Vec<String>,
    pub scope: Option<String>,
    pub filter: Option<String>,
    pub extensions: Vec<String>,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let s = url.trim();
        let lower = s.to_ascii_lowercase();
        let (use_ssl, rest) = if lower.starts_with("ldaps://") {
            (true, &s[8..])
        } else if lower.starts_with("ldap://") {
            (false, &s[7..])
        } else {
            return Err(invalid(url, "expected ldap:// or ldaps://"));
        };

        let (hostport, path) = match rest.find('/') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => match rest.find('?') {
                Some(_) => return Err(invalid(url, "query without a DN part")),
                None => (rest, None),
            },
        };
        let (host, port) = split_host_port(hostport).ok_or_else(|| invalid(url, "bad host or port"))?;

        let mut result = LdapUrl {
            use_ssl,
            host: percent_decode(&host).ok_or_else(|| invalid(url, "bad percent encoding"))?,
            port,
            dn: None,
            attributes: Vec::new(),
            scope: None,
            filter: None,
            extensions: Vec::new(),
        };

        let path = match path {
            Some(p) => p,
            None => return Ok(result),
        };
        let mut parts = path.splitn(5, '?');
        let decode = |p: &str| percent_decode(p).ok_or_else(|| invalid(url, "bad percent encoding"));

        if let Some(dn) = parts.next() {
            if !dn.is_empty() {
                result.dn = Some(decode(dn)?);
            }
        }
        if let Some(attrs) = parts.next() {
            for attr in attrs.split(',').filter(|a| !a.is_empty()) {
                result.attributes.push(decode(attr)?);
            }
        }
        if let Some(scope) = parts.next() {
            if !scope.is_empty() {
                let scope = decode(scope)?.to_ascii_lowercase();
                if !matches!(scope.as_str(), "base" | "one" | "sub" | "children") {
                    return Err(invalid(url, "unknown scope"));
                }
                result.scope = Some(scope);
            }
        }
        if let Some(filter) = parts.next() {
            if !filter.is_empty() {
                result.filter = Some(decode(filter)?);
            }
        }
        if let Some(exts) = parts.next() {
            for ext in exts.split(',').filter(|e| !e.is_empty()) {
                result.extensions.push(decode(ext)?);
            }
        }
        Ok(result)
    }

    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.use_ssl { DEFAULT_SSL_PORT } else { DEFAULT_PORT })
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_ssl {
            "ldaps"
        } else {
            "ldap"
        }
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme())?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&percent_encode(&self.host))?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        let mut tail = vec![
            self.dn.as_deref().map(percent_encode).unwrap_or_default(),
            self.attributes
                .iter()
                .map(|a| percent_encode(a))
                .collect::<Vec<_>>()
                .join(","),
            self.scope.clone().unwrap_or_default(),
            self.filter.as_deref().map(percent_encode).unwrap_or_default(),
            self.extensions
                .iter()
                .map(|e| percent_encode(e))
                .collect::<Vec<_>>()
                .join(","),
        ];
        while tail.len() > 1 && tail.last().map(|s| s.is_empty()).unwrap_or(false) {
            tail.pop();
        }
        if tail.len() == 1 && tail[0].is_empty() {
            return Ok(());
        }
        write!(f, "/{}", tail.join("?"))
    }
}

impl std::str::FromStr for LdapUrl {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        LdapUrl::parse(s)
    }
}

fn invalid(url: &str, reason: &str) -> LdapError {
    LdapError::protocol(format!("Invalid LDAP URL '{}': {}", url, reason))
}

fn split_host_port(hostport: &str) -> Option<(String, Option<u16>)> {
    if hostport.is_empty() {
        return Some((String::new(), None));
    }
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((hostport.to_string(), None)),
    }
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Encode characters that would break URL structure.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'?' | b'%' | b'/' | b' ' | b'#' | b'"' | b'<' | b'>' => out.push_str(&format!("%{:02X}", b)),
            b if b < 0x20 || b >= 0x7F => out.push_str(&format!("%{:02X}", b)),
            b => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = LdapUrl::parse("ldap://ldap.example.com:3890/ou=People,dc=example,dc=com?cn,mail?sub?(uid=foo)?!x-ext").unwrap();
        assert!(!url.use_ssl);
        assert_eq!(url.host, "ldap.example.com");
        assert_eq!(url.port, Some(3890));
        assert_eq!(url.dn.as_deref(), Some("ou=People,dc=example,dc=com"));
        assert_eq!(url.attributes, vec!["cn", "mail"]);
        assert_eq!(url.scope.as_deref(), Some("sub"));
        assert_eq!(url.filter.as_deref(), Some("(uid=foo)"));
        assert_eq!(url.extensions, vec!["!x-ext"]);
    }

    #[test]
    fn test_parse_minimal_urls() {
        let url = LdapUrl::parse("ldaps://dc1.example.com").unwrap();
        assert!(url.use_ssl);
        assert_eq!(url.effective_port(), 636);
        assert_eq!(url.dn, None);

        let url = LdapUrl::parse("LDAP://host/dc=example??base").unwrap();
        assert_eq!(url.effective_port(), 389);
        assert_eq!(url.scope.as_deref(), Some("base"));
        assert!(url.attributes.is_empty());
    }

    #[test]
    fn test_percent_decoding() {
        let url = LdapUrl::parse("ldap://host/cn=John%20Smith,dc=x???(cn=John%20*)").unwrap();
        assert_eq!(url.dn.as_deref(), Some("cn=John Smith,dc=x"));
        assert_eq!(url.filter.as_deref(), Some("(cn=John *)"));
    }

    #[test]
    fn test_ipv6_host() {
        let url = LdapUrl::parse("ldap://[::1]:1389/").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, Some(1389));
        assert_eq!(url.to_string(), "ldap://[::1]:1389");
    }

    #[test]
    fn test_invalid_urls() {
        assert!(LdapUrl::parse("http://host").is_err());
        assert!(LdapUrl::parse("ldap://host:notaport/").is_err());
        assert!(LdapUrl::parse("ldap://host/dc=x??weird").is_err());
        assert!(LdapUrl::parse("ldap://host/cn=%zz").is_err());
    }

    #[test]
    fn test_display() {
        let url = LdapUrl::parse("ldap://host:389/cn=a%20b,dc=x?cn?one").unwrap();
        assert_eq!(url.to_string(), "ldap://host:389/cn=a%20b,dc=x?cn?one");
        let url = LdapUrl::parse("ldap://host").unwrap();
        assert_eq!(url.to_string(), "ldap://host");
    }
}
