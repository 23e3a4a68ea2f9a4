//! Search response aggregation.
//!
//! A search produces any number of entries, continuation references and
//! intermediate responses before exactly one SearchResultDone. Without
//! callbacks everything is collected into a [`SearchResponse`]; with
//! callbacks each item is handed over as it arrives and only the final
//! result is kept.

use super::basic::check_result;
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::protocol::{IntermediateResponse, LdapMessage, ProtocolOp, SearchResponse};
use crate::queue::{MessageChannel, Messages};
use tracing::debug;

pub type EntryCallback = Box<dyn FnMut(Entry, &LdapMessage) -> Result<()> + Send>;
pub type ReferenceCallback = Box<dyn FnMut(Vec<String>, &LdapMessage) -> Result<()> + Send>;
pub type IntermediateCallback = Box<dyn FnMut(IntermediateResponse, &LdapMessage) -> Result<()> + Send>;

/// Streaming handlers for search results. Items without a handler are
/// collected into the returned response.
#[derive(Default)]
pub struct SearchCallbacks {
    pub on_entry: Option<EntryCallback>,
    pub on_reference: Option<ReferenceCallback>,
    pub on_intermediate: Option<IntermediateCallback>,
}

impl SearchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entry(mut self, f: impl FnMut(Entry, &LdapMessage) -> Result<()> + Send + 'static) -> Self {
        self.on_entry = Some(Box::new(f));
        self
    }

    pub fn on_reference(mut self, f: impl FnMut(Vec<String>, &LdapMessage) -> Result<()> + Send + 'static) -> Self {
        self.on_reference = Some(Box::new(f));
        self
    }

    pub fn on_intermediate(
        mut self,
        f: impl FnMut(IntermediateResponse, &LdapMessage) -> Result<()> + Send + 'static,
    ) -> Self {
        self.on_intermediate = Some(Box::new(f));
        self
    }
}

/// Reads until SearchResultDone. The returned message carries a
/// `ProtocolOp::SearchResponse` and the controls of the done message.
pub async fn receive(
    channel: &mut dyn MessageChannel,
    request: &LdapMessage,
    mut callbacks: Option<&mut SearchCallbacks>,
) -> Result<LdapMessage> {
    let id = request.message_id;
    let mut aggregate = SearchResponse::default();
    let mut messages = Messages::new(channel, id);
    while let Some(message) = messages.next().await {
        let message = message?;
        match &message.op {
            ProtocolOp::SearchResultEntry(entry) => {
                match callbacks.as_deref_mut().and_then(|c| c.on_entry.as_mut()) {
                    Some(f) => f(entry.clone(), &message)?,
                    None => aggregate.entries.push(entry.clone()),
                }
            }
            ProtocolOp::SearchResultReference(urls) => {
                match callbacks.as_deref_mut().and_then(|c| c.on_reference.as_mut()) {
                    Some(f) => f(urls.clone(), &message)?,
                    None => aggregate.references.push(urls.clone()),
                }
            }
            ProtocolOp::IntermediateResponse(response) => {
                if let Some(f) = callbacks.as_deref_mut().and_then(|c| c.on_intermediate.as_mut()) {
                    f(response.clone(), &message)?;
                }
            }
            ProtocolOp::SearchResultDone(result) => {
                check_result(&request.op, result)?;
                debug!(
                    "Search {} done: {} entries, {} references",
                    id,
                    aggregate.entries.len(),
                    aggregate.references.len()
                );
                aggregate.result = result.clone();
                return Ok(LdapMessage::new(id, ProtocolOp::SearchResponse(aggregate)).with_controls(message.controls));
            }
            other => {
                return Err(LdapError::protocol(format!(
                    "unexpected {} in search response",
                    other.name()
                )))
            }
        }
    }
    Err(LdapError::protocol("search ended without SearchResultDone"))
}

pub async fn send(
    channel: &mut dyn MessageChannel,
    request: LdapMessage,
    callbacks: Option<&mut SearchCallbacks>,
) -> Result<LdapMessage> {
    channel.send_message(std::slice::from_ref(&request)).await?;
    receive(channel, &request, callbacks).await
}
