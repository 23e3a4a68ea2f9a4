//! Server side of RFC 2696 simple paged results.
//!
//! Each in-flight paged search lives in a per-connection [`PagingRegistry`]
//! keyed by the cookie last handed to the client. Cookies are random and
//! rotate on every page; a follow-up page must carry a search request and
//! controls whose encoding is byte-identical to the first one.

use super::handler::{PagingHandler, RequestContext};
use super::search::result_stream;
use crate::control::{Control, PagingControl, PAGING_OID};
use crate::error::{LdapError, Result};
use crate::protocol::{LdapMessage, LdapResult, ProtocolOp, SearchRequest};
use crate::queue::MessageChannel;
use crate::result_code;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use tracing::debug;

pub const COOKIE_LENGTH: usize = 16;

pub fn generate_cookie() -> Vec<u8> {
    let mut cookie = vec![0u8; COOKIE_LENGTH];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// Encoded form of a search request and its controls, used to check that
/// follow-up pages ask for the same thing.
fn fingerprint(search: &SearchRequest, controls: &[Control]) -> Result<Vec<u8>> {
    LdapMessage::new(0, ProtocolOp::SearchRequest(search.clone()))
        .with_controls(controls.to_vec())
        .encode()
}

/// State of one paged search between pages.
#[derive(Debug, Clone)]
pub struct PagingRequest {
    cookie: Vec<u8>,
    pub search: SearchRequest,
    /// Request controls without the paging control.
    pub controls: Vec<Control>,
    /// Page size requested by the latest page.
    pub size: i64,
    /// Progress marker owned by the paging handler.
    pub offset: usize,
    processed: bool,
    fingerprint: Vec<u8>,
}

impl PagingRequest {
    pub fn new(search: SearchRequest, controls: Vec<Control>, size: i64) -> Result<Self> {
        let fingerprint = fingerprint(&search, &controls)?;
        Ok(Self {
            cookie: Vec::new(),
            search,
            controls,
            size,
            offset: 0,
            processed: false,
            fingerprint,
        })
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// True once at least one page has been served.
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn matches(&self, search: &SearchRequest, controls: &[Control]) -> Result<bool> {
        Ok(fingerprint(search, controls)? == self.fingerprint)
    }

    fn rotate(&mut self) -> Vec<u8> {
        self.cookie = generate_cookie();
        self.cookie.clone()
    }
}

#[derive(Debug, Default)]
pub struct PagingRegistry {
    requests: HashMap<Vec<u8>, PagingRequest>,
}

impl PagingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the request under its current cookie.
    pub fn register(&mut self, request: PagingRequest) {
        self.requests.insert(request.cookie.clone(), request);
    }

    pub fn find(&self, cookie: &[u8]) -> Option<&PagingRequest> {
        self.requests.get(cookie)
    }

    pub fn take(&mut self, cookie: &[u8]) -> Option<PagingRequest> {
        self.requests.remove(cookie)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drains every pending request, e.g. when the connection ends.
    pub fn drain(&mut self) -> Vec<PagingRequest> {
        self.requests.drain().map(|(_, request)| request).collect()
    }
}

/// Serves one page of a paged search. Returns the result code sent.
pub(super) async fn paged_search(
    channel: &mut dyn MessageChannel,
    handler: &dyn PagingHandler,
    registry: &mut PagingRegistry,
    search: SearchRequest,
    paging: PagingControl,
    context: &RequestContext,
) -> Result<u32> {
    let controls: Vec<Control> = context
        .controls
        .iter()
        .filter(|c| c.oid != PAGING_OID)
        .cloned()
        .collect();

    let mut request = if paging.cookie.is_empty() {
        PagingRequest::new(search, controls, paging.size)?
    } else {
        let existing = registry.take(&paging.cookie).ok_or_else(|| {
            LdapError::operation(result_code::OPERATIONS_ERROR, "The supplied paging cookie is not valid.")
        })?;
        if !existing.matches(&search, &controls)? {
            handler.remove(&existing, context).await?;
            return Err(LdapError::operation(
                result_code::OPERATIONS_ERROR,
                "The search request and controls must be identical between paging requests.",
            ));
        }
        PagingRequest {
            size: paging.size,
            ..existing
        }
    };

    if paging.size == 0 {
        debug!("Paged search abandoned by client (message {})", context.message_id);
        if request.is_processed() {
            handler.remove(&request, context).await?;
        }
        let done = LdapMessage::new(context.message_id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .with_controls(vec![Control::paging(0, Vec::new(), false)]);
        channel.send_message(std::slice::from_ref(&done)).await?;
        return Ok(result_code::SUCCESS);
    }

    let page = match handler.page(&mut request, context).await {
        Ok(page) => page,
        Err(e) => {
            let _ = handler.remove(&request, context).await;
            return Err(e);
        }
    };
    request.processed = true;

    let cookie = if page.complete {
        handler.remove(&request, context).await?;
        Vec::new()
    } else {
        let cookie = request.rotate();
        registry.register(request);
        cookie
    };
    debug!(
        "Paged search page of {} entries (complete: {}, pending searches: {})",
        page.entries.len(),
        page.complete,
        registry.len()
    );

    let messages = result_stream(
        context.message_id,
        page.entries,
        Vec::new(),
        LdapResult::success(),
        vec![Control::paging(page.remaining, cookie, false)],
    );
    channel.send_message(&messages).await?;
    Ok(result_code::SUCCESS)
}
