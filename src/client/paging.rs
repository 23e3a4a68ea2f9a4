// Simple paged results (RFC 2696) on top of the client.

use super::LdapClient;
use crate::control::{find_paging, Control};
use crate::entry::Entry;
use crate::error::Result;
use crate::protocol::{ProtocolOp, SearchRequest};
use tracing::debug;

/// Pages through a search. Each call to [`Paging::get_entries`] sends the
/// search again with the cookie returned by the previous page.
pub struct Paging<'c> {
    client: &'c mut LdapClient,
    request: SearchRequest,
    controls: Vec<Control>,
    size: i64,
    critical: bool,
    cookie: Vec<u8>,
    size_estimate: Option<i64>,
    started: bool,
    ended: bool,
}

impl<'c> Paging<'c> {
    pub(super) fn new(client: &'c mut LdapClient, request: SearchRequest, controls: Vec<Control>, size: i64) -> Self {
        Self {
            client,
            request,
            controls,
            size,
            critical: false,
            cookie: Vec::new(),
            size_estimate: None,
            started: false,
            ended: false,
        }
    }

    /// Mark the paging control critical.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// True until the server has returned the last page.
    pub fn has_entries(&self) -> bool {
        !self.ended
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// The server's estimate of the total result set size, if it sent one.
    pub fn size_estimate(&self) -> Option<i64> {
        self.size_estimate
    }

    /// Fetch the next page. `size` overrides the page size for this page only.
    pub async fn get_entries(&mut self, size: Option<i64>) -> Result<Vec<Entry>> {
        if self.ended {
            return Ok(Vec::new());
        }
        let mut controls = self.controls.clone();
        controls.push(Control::paging(size.unwrap_or(self.size), self.cookie.clone(), self.critical));
        let response = self
            .client
            .send_search(self.request.clone(), controls)
            .await?;
        self.started = true;
        match find_paging(&response.1) {
            Some(paging) => {
                self.cookie = paging.cookie.clone();
                self.size_estimate = (paging.size > 0).then_some(paging.size);
                self.ended = self.cookie.is_empty();
            }
            None => {
                debug!("Server ignored the paging control; all results returned");
                self.cookie.clear();
                self.ended = true;
            }
        }
        Ok(response.0.entries)
    }

    /// Abandon the paged search by sending a size of zero with the current
    /// cookie, letting the server release its state.
    pub async fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        if self.started && !self.cookie.is_empty() {
            let mut controls = self.controls.clone();
            controls.push(Control::paging(0, self.cookie.clone(), self.critical));
            self.client
                .send(ProtocolOp::SearchRequest(self.request.clone()), controls)
                .await?;
        }
        self.cookie.clear();
        self.ended = true;
        Ok(())
    }
}
