//! SASL mechanisms driven by the bind negotiation loop.
//!
//! A mechanism produces an initial response, answers server challenges, and
//! reports completion. Mechanisms that negotiate integrity or confidentiality
//! hand back a [`SecurityLayer`] that the message queue installs once the bind
//! succeeds.

use crate::error::{LdapError, Result};

/// Transforms whole buffers on the wire after a SASL security layer is negotiated.
pub trait SecurityLayer: Send {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

pub trait SaslMechanism: Send {
    /// Registered mechanism name, e.g. `PLAIN`.
    fn name(&self) -> &str;

    /// Credentials carried by the first bind request.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Answer a server challenge (the `serverSaslCreds` of a bind in progress).
    fn challenge(&mut self, server_credentials: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// True once the mechanism expects no further challenges.
    fn is_complete(&self) -> bool;

    /// Negotiated security layer, taken once after a successful bind.
    fn take_security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        None
    }
}

/// RFC 4616: `[authzid] NUL authcid NUL passwd` in a single message.
pub struct Plain {
    authzid: String,
    username: String,
    password: String,
    sent: bool,
}

impl Plain {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: String::new(),
            username: username.into(),
            password: password.into(),
            sent: false,
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = authzid.into();
        self
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        self.sent = true;
        let mut message = Vec::with_capacity(self.authzid.len() + self.username.len() + self.password.len() + 2);
        message.extend_from_slice(self.authzid.as_bytes());
        message.push(0);
        message.extend_from_slice(self.username.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        Ok(Some(message))
    }

    fn challenge(&mut self, _server_credentials: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Err(LdapError::Sasl("PLAIN does not accept server challenges".into()))
    }

    fn is_complete(&self) -> bool {
        self.sent
    }
}

/// Credentials decoded from a PLAIN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub username: String,
    pub password: String,
}

/// Server-side decoding of a PLAIN message.
pub fn decode_plain(message: &[u8]) -> Result<PlainCredentials> {
    let mut parts = message.split(|b| *b == 0);
    let (Some(authzid), Some(username), Some(password), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(LdapError::Sasl("malformed PLAIN message".into()));
    };
    let text = |bytes: &[u8]| String::from_utf8(bytes.to_vec()).map_err(|_| LdapError::Sasl("PLAIN message is not UTF-8".into()));
    Ok(PlainCredentials {
        authzid: text(authzid)?,
        username: text(username)?,
        password: text(password)?,
    })
}

/// RFC 4422 appendix A: identity is established by the TLS layer; the
/// optional authzid asks to act as someone else.
#[derive(Default)]
pub struct External {
    authzid: Option<String>,
    sent: bool,
}

impl External {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authzid(authzid: impl Into<String>) -> Self {
        Self {
            authzid: Some(authzid.into()),
            sent: false,
        }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        self.sent = true;
        Ok(Some(self.authzid.clone().unwrap_or_default().into_bytes()))
    }

    fn challenge(&mut self, _server_credentials: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Vec::new()))
    }

    fn is_complete(&self) -> bool {
        self.sent
    }
}
