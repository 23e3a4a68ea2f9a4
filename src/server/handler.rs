//! Pluggable request handling.
//!
//! The server owns the protocol; a [`RequestHandler`] owns the data. Handlers
//! pick wire result codes by returning [`LdapError::Operation`]; any other
//! error tears the connection down.

use crate::control::Control;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::protocol::{
    AddRequest, BindRequest, CompareRequest, ExtendedRequest, ExtendedResponse, LdapResult, ModifyDnRequest,
    ModifyRequest, SearchRequest,
};
use crate::result_code;
use async_trait::async_trait;
use std::sync::Arc;

use super::paging::PagingRequest;

/// Authentication state of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Token {
    #[default]
    Anonymous,
    /// `identity` is a DN for simple binds, or the SASL username.
    Bound { identity: String },
}

impl Token {
    pub fn bound(identity: impl Into<String>) -> Self {
        Token::Bound {
            identity: identity.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Token::Anonymous)
    }

    /// RFC 4532 authzId: `dn:` when the identity is a DN, `u:` otherwise,
    /// empty when anonymous or the identity is empty.
    pub fn authz_id(&self) -> String {
        match self {
            Token::Anonymous => String::new(),
            Token::Bound { identity } if identity.is_empty() => String::new(),
            Token::Bound { identity } if Dn::is_valid(identity) => format!("dn:{}", identity),
            Token::Bound { identity } => format!("u:{}", identity),
        }
    }
}

/// What a handler sees about the request being served.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub message_id: i32,
    pub controls: Vec<Control>,
    pub token: Token,
    pub peer: String,
    pub encrypted: bool,
}

/// Entries and references produced by a search, plus the terminal result.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub entries: Vec<Entry>,
    pub references: Vec<Vec<String>>,
    pub result: LdapResult,
    /// Response controls attached to SearchResultDone.
    pub controls: Vec<Control>,
}

impl SearchOutcome {
    pub fn entries(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }
}

fn unsupported(operation: &str) -> LdapError {
    LdapError::operation(
        result_code::UNWILLING_TO_PERFORM,
        format!("The {} operation is not supported.", operation),
    )
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Validate simple credentials (also used for SASL PLAIN) and return the
    /// resulting identity.
    async fn bind(&self, request: &BindRequest, context: &RequestContext) -> Result<Token>;

    async fn search(&self, request: &SearchRequest, context: &RequestContext) -> Result<SearchOutcome>;

    async fn add(&self, _request: AddRequest, _context: &RequestContext) -> Result<LdapResult> {
        Err(unsupported("add"))
    }

    async fn delete(&self, _dn: String, _context: &RequestContext) -> Result<LdapResult> {
        Err(unsupported("delete"))
    }

    async fn modify(&self, _request: ModifyRequest, _context: &RequestContext) -> Result<LdapResult> {
        Err(unsupported("modify"))
    }

    async fn modify_dn(&self, _request: ModifyDnRequest, _context: &RequestContext) -> Result<LdapResult> {
        Err(unsupported("modify DN"))
    }

    /// True when the entry holds the asserted value.
    async fn compare(&self, _request: &CompareRequest, _context: &RequestContext) -> Result<bool> {
        Err(unsupported("compare"))
    }

    /// Extended operations other than StartTLS and WhoAmI.
    async fn extended(&self, request: ExtendedRequest, _context: &RequestContext) -> Result<ExtendedResponse> {
        Err(LdapError::operation(
            result_code::PROTOCOL_ERROR,
            format!("The extended operation {} is not supported.", request.name),
        ))
    }
}

/// Customizes the synthesized RootDSE before it is filtered and sent.
#[async_trait]
pub trait RootDseHandler: Send + Sync {
    async fn root_dse(&self, entry: Entry, request: &SearchRequest, context: &RequestContext) -> Result<Entry>;
}

/// One page of a paged search.
#[derive(Debug, Clone, Default)]
pub struct PagingResponse {
    pub entries: Vec<Entry>,
    /// No further pages follow.
    pub complete: bool,
    /// Estimate of the entries left, 0 when unknown.
    pub remaining: i64,
}

/// Serves RFC 2696 paged searches. Without one, the server falls back to a
/// full search (or rejects a critical paging control).
#[async_trait]
pub trait PagingHandler: Send + Sync {
    /// Produce the next page of `request`. The request persists across pages
    /// of one paged search and may carry handler progress in `offset`.
    async fn page(&self, request: &mut PagingRequest, context: &RequestContext) -> Result<PagingResponse>;

    /// Release state held for a finished, failed or abandoned paged search.
    async fn remove(&self, request: &PagingRequest, context: &RequestContext) -> Result<()>;
}

/// Builds handler instances for each accepted connection.
pub trait HandlerFactory: Send + Sync {
    fn request_handler(&self) -> Arc<dyn RequestHandler>;

    fn root_dse_handler(&self) -> Option<Arc<dyn RootDseHandler>> {
        None
    }

    fn paging_handler(&self) -> Option<Arc<dyn PagingHandler>> {
        None
    }
}

/// The handler set of one connection.
#[derive(Clone)]
pub struct Handlers {
    pub request: Arc<dyn RequestHandler>,
    pub root_dse: Option<Arc<dyn RootDseHandler>>,
    pub paging: Option<Arc<dyn PagingHandler>>,
}

impl Handlers {
    pub fn from_factory(factory: &dyn HandlerFactory) -> Self {
        Self {
            request: factory.request_handler(),
            root_dse: factory.root_dse_handler(),
            paging: factory.paging_handler(),
        }
    }
}
