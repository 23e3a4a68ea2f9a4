//! Error taxonomy shared by the client and server sides.

use crate::ber::BerError;
use crate::result_code;
use thiserror::Error;

pub type Result<T, E = LdapError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LdapError {
    /// Malformed PDU, unexpected tag, or a message id mismatch on a filtered read.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Non-success result code outside the non-error allow-list.
    #[error("{message} (result code {code}: {})", result_code::name(*code))]
    Operation {
        code: u32,
        message: String,
        matched_dn: String,
    },

    /// Failed bind attempt.
    #[error("bind failed: {message} (result code {code}: {})", result_code::name(*code))]
    Bind { code: u32, message: String },

    /// Transport failure; the connection must be discarded.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Server-initiated notice (message id 0), e.g. Notice of Disconnection.
    #[error("unsolicited notification {name}: {message} (result code {code})")]
    UnsolicitedNotification {
        name: String,
        code: u32,
        message: String,
    },

    /// A referral was returned and the referral policy is `throw`.
    #[error("referral received: {message} ({})", urls.join(", "))]
    Referral { urls: Vec<String>, message: String },

    /// Raised by a referral chaser to move on to the next referral.
    #[error("referral skipped")]
    SkipReferral,

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("SASL error: {0}")]
    Sasl(String),

    /// Options rejected by `validate()`.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LdapError {
    pub fn protocol(message: impl Into<String>) -> Self {
        LdapError::Protocol {
            message: message.into(),
        }
    }

    pub fn operation(code: u32, message: impl Into<String>) -> Self {
        LdapError::Operation {
            code,
            message: message.into(),
            matched_dn: String::new(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        LdapError::Connection {
            message: message.into(),
        }
    }

    /// LDAP result code carried by this error, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            LdapError::Operation { code, .. }
            | LdapError::Bind { code, .. }
            | LdapError::UnsolicitedNotification { code, .. } => Some(*code),
            LdapError::Referral { .. } => Some(result_code::REFERRAL),
            LdapError::Protocol { .. } => Some(result_code::PROTOCOL_ERROR),
            _ => None,
        }
    }

    /// Diagnostic message suitable for an LdapResult.
    pub fn diagnostic(&self) -> String {
        match self {
            LdapError::Operation { message, .. }
            | LdapError::Bind { message, .. }
            | LdapError::Connection { message }
            | LdapError::Protocol { message }
            | LdapError::Referral { message, .. }
            | LdapError::UnsolicitedNotification { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True when the connection can no longer be used.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LdapError::Connection { .. } | LdapError::UnsolicitedNotification { .. } | LdapError::Io(_)
        )
    }
}

impl From<BerError> for LdapError {
    fn from(e: BerError) -> Self {
        LdapError::protocol(e.to_string())
    }
}
