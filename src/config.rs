use crate::error::{LdapError, Result as LdapResult};
use crate::url::LdapUrl;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What the client does when a result carries referrals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralPolicy {
    /// Surface `LdapError::Referral` with the URLs.
    #[default]
    Throw,
    /// Chase referrals on new connections.
    Follow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub version: i32,
    /// Hosts tried in order until one connects.
    pub servers: Vec<String>,
    /// Defaults to 389, or 636 with `use_ssl`.
    pub port: Option<u16>,
    pub base_dn: Option<String>,
    /// LDAPS from the first byte.
    pub use_ssl: bool,
    /// StartTLS right after connecting.
    pub use_tls: bool,
    pub ssl_validate_cert: bool,
    pub ssl_ca_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub timeout_connect_sec: u64,
    pub referral: ReferralPolicy,
    pub referral_limit: usize,
    /// Page size used by the paging helper when none is given.
    pub page_size: i64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            version: 3,
            servers: vec![],
            port: None,
            base_dn: None,
            use_ssl: false,
            use_tls: false,
            ssl_validate_cert: true,
            ssl_ca_file: None,
            ssl_cert_file: None,
            ssl_key_file: None,
            timeout_connect_sec: 3,
            referral: ReferralPolicy::Throw,
            referral_limit: 10,
            page_size: 1000,
        }
    }
}

impl ClientOptions {
    pub fn new<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.use_ssl {
            crate::url::DEFAULT_SSL_PORT
        } else {
            crate::url::DEFAULT_PORT
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_connect_sec)
    }

    pub fn tls_options(&self) -> crate::tls::ClientTlsOptions {
        crate::tls::ClientTlsOptions {
            ca_file: self.ssl_ca_file.clone(),
            cert_file: self.ssl_cert_file.clone(),
            key_file: self.ssl_key_file.clone(),
            skip_verify: !self.ssl_validate_cert,
        }
    }

    /// Options for chasing a referral to `url`, inheriting everything else.
    pub fn for_referral(&self, url: &LdapUrl) -> Self {
        Self {
            servers: vec![url.host.clone()],
            port: Some(url.effective_port()),
            use_ssl: url.use_ssl,
            use_tls: if url.use_ssl { false } else { self.use_tls },
            ..self.clone()
        }
    }

    pub fn validate(&self) -> LdapResult<()> {
        if self.version != 3 {
            return Err(LdapError::Config(format!("unsupported LDAP version {}", self.version)));
        }
        if self.servers.is_empty() {
            return Err(LdapError::Config("at least one server is required".into()));
        }
        if self.use_ssl && self.use_tls {
            return Err(LdapError::Config("use_ssl and use_tls are mutually exclusive".into()));
        }
        if self.ssl_cert_file.is_some() != self.ssl_key_file.is_some() {
            return Err(LdapError::Config("ssl_cert_file and ssl_key_file must be set together".into()));
        }
        if self.page_size <= 0 {
            return Err(LdapError::Config("page_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// `ldap://host:port` (plain, StartTLS capable) or `ldaps://host:port`.
    pub listen: String,
    pub require_authentication: bool,
    pub allow_anonymous: bool,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    /// Client certificates signed by this CA are requested during the handshake.
    pub ssl_ca_file: Option<String>,
    /// Close connections idle for this long.
    pub idle_timeout_sec: Option<u64>,
    pub dse_naming_contexts: Vec<String>,
    pub dse_vendor_name: String,
    pub dse_vendor_version: String,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "ldap://127.0.0.1:1389".to_string(),
            require_authentication: true,
            allow_anonymous: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            ssl_ca_file: None,
            idle_timeout_sec: None,
            dse_naming_contexts: vec![],
            dse_vendor_name: "ldap-engine".to_string(),
            dse_vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen: None,
        }
    }
}

impl ServerOptions {
    pub fn is_ldaps(&self) -> bool {
        self.listen.starts_with("ldaps://")
    }

    /// A certificate enables LDAPS and StartTLS.
    pub fn has_certificate(&self) -> bool {
        self.ssl_cert_file.is_some() && self.ssl_key_file.is_some()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_sec.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn validate(&self) -> LdapResult<()> {
        if !self.listen.starts_with("ldap://") && !self.is_ldaps() {
            return Err(LdapError::Config(format!(
                "listen must be ldap:// or ldaps://, got {}",
                self.listen
            )));
        }
        if self.ssl_cert_file.is_some() != self.ssl_key_file.is_some() {
            return Err(LdapError::Config("ssl_cert_file and ssl_key_file must be set together".into()));
        }
        if self.is_ldaps() && !self.has_certificate() {
            return Err(LdapError::Config("ldaps:// listener requires ssl_cert_file and ssl_key_file".into()));
        }
        Ok(())
    }
}

/// One entry of the demo directory: DN plus attribute name to values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl EntryConfig {
    pub fn to_entry(&self) -> crate::entry::Entry {
        let attributes = self
            .attributes
            .iter()
            .map(|(name, values)| crate::entry::Attribute::from_strs(name.clone(), values.as_slice()))
            .collect();
        crate::entry::Entry::with_attributes(self.dn.clone(), attributes)
    }
}

/// Configuration file of the `ldap-engine` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerOptions,
    /// Entries served by the in-memory directory.
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.server.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.listen, "ldap://127.0.0.1:1389");
        assert!(config.server.require_authentication);
        assert!(!config.server.allow_anonymous);
        assert!(config.entries.is_empty());
        assert!(config.server.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
server:
  listen: "ldap://0.0.0.0:389"
  allow_anonymous: true
  idle_timeout_sec: 300
  dse_naming_contexts:
    - "dc=example,dc=com"
entries:
  - dn: "dc=example,dc=com"
    attributes:
      objectClass: ["top", "domain"]
      dc: ["example"]
  - dn: "cn=admin,dc=example,dc=com"
    attributes:
      userPassword: ["secret"]
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.server.listen, "ldap://0.0.0.0:389");
        assert!(config.server.allow_anonymous);
        assert!(config.server.require_authentication);
        assert_eq!(config.server.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.server.dse_naming_contexts, vec!["dc=example,dc=com".to_string()]);
        assert_eq!(config.entries.len(), 2);
        let entry = config.entries[0].to_entry();
        assert_eq!(entry.dn, "dc=example,dc=com");
        assert_eq!(entry.first_str("dc"), Some("example"));
    }

    #[test]
    fn test_config_ldaps_requires_certificate() {
        let yaml = r#"
server:
  listen: "ldaps://0.0.0.0:636"
"#;
        assert!(Config::from_str(yaml).is_err());
        let yaml = r#"
server:
  listen: "ldaps://0.0.0.0:636"
  ssl_cert_file: "/etc/ssl/cert.pem"
  ssl_key_file: "/etc/ssl/key.pem"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.server.is_ldaps());
        assert!(config.server.has_certificate());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
server:
  listen: "ldap://127.0.0.1:1389"
  require_authentication: false
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(!config.server.require_authentication);
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
        assert!(Config::from_str("server:\n  listen: \"http://x:1\"\n").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }

    #[test]
    fn test_client_options_validate() {
        let options = ClientOptions::new(["ldap.example.com"]);
        assert!(options.validate().is_ok());
        assert_eq!(options.effective_port(), 389);
        assert!(ClientOptions::default().validate().is_err());
        let ssl = ClientOptions {
            use_ssl: true,
            ..ClientOptions::new(["h"])
        };
        assert_eq!(ssl.effective_port(), 636);
        let both = ClientOptions {
            use_tls: true,
            ..ssl
        };
        assert!(matches!(both.validate(), Err(LdapError::Config(_))));
    }

    #[test]
    fn test_client_options_for_referral() {
        let options = ClientOptions {
            base_dn: Some("dc=example,dc=com".into()),
            ..ClientOptions::new(["a"])
        };
        let url = LdapUrl::parse("ldaps://b.example.com/dc=b").unwrap();
        let chased = options.for_referral(&url);
        assert_eq!(chased.servers, vec!["b.example.com".to_string()]);
        assert_eq!(chased.effective_port(), 636);
        assert!(chased.use_ssl);
        assert_eq!(chased.base_dn, options.base_dn);
    }
}
