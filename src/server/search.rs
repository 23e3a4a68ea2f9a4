// Non-paged search: one envelope per entry and reference, then SearchResultDone.

use super::handler::{RequestContext, RequestHandler};
use crate::control::Control;
use crate::entry::Entry;
use crate::error::Result;
use crate::protocol::{LdapMessage, LdapResult, ProtocolOp, SearchRequest};
use crate::queue::MessageChannel;
use tracing::debug;

/// Envelopes for a search result stream terminated by `result`.
pub(super) fn result_stream(
    message_id: i32,
    entries: Vec<Entry>,
    references: Vec<Vec<String>>,
    result: LdapResult,
    controls: Vec<Control>,
) -> Vec<LdapMessage> {
    let mut messages = Vec::with_capacity(entries.len() + references.len() + 1);
    messages.extend(
        entries
            .into_iter()
            .map(|entry| LdapMessage::new(message_id, ProtocolOp::SearchResultEntry(entry))),
    );
    messages.extend(
        references
            .into_iter()
            .map(|urls| LdapMessage::new(message_id, ProtocolOp::SearchResultReference(urls))),
    );
    messages.push(LdapMessage::new(message_id, ProtocolOp::SearchResultDone(result)).with_controls(controls));
    messages
}

/// Runs the handler search once and streams the outcome. Returns the result
/// code sent in SearchResultDone.
pub(super) async fn search(
    channel: &mut dyn MessageChannel,
    handler: &dyn RequestHandler,
    request: &SearchRequest,
    context: &RequestContext,
) -> Result<u32> {
    let outcome = handler.search(request, context).await?;
    let code = outcome.result.code;
    debug!(
        "Search under '{}' returned {} entries and {} references",
        request.base_dn,
        outcome.entries.len(),
        outcome.references.len()
    );
    let messages = result_stream(
        context.message_id,
        outcome.entries,
        outcome.references,
        outcome.result,
        outcome.controls,
    );
    channel.send_message(&messages).await?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LdapError;
    use crate::filter::Filter;
    use crate::protocol::{BindRequest, SearchScope};
    use crate::result_code;
    use crate::server::handler::{SearchOutcome, Token};
    use crate::testing::ScriptedChannel;
    use async_trait::async_trait;

    struct Fixed(SearchOutcome);

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn bind(&self, _request: &BindRequest, _context: &RequestContext) -> Result<Token> {
            Err(LdapError::operation(result_code::INVALID_CREDENTIALS, "no"))
        }

        async fn search(&self, _request: &SearchRequest, _context: &RequestContext) -> Result<SearchOutcome> {
            Ok(self.0.clone())
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            message_id: 7,
            controls: vec![],
            token: Token::Anonymous,
            peer: "test".into(),
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_entries_then_references_then_done() {
        let handler = Fixed(SearchOutcome {
            entries: vec![Entry::new("cn=a"), Entry::new("cn=b")],
            references: vec![vec!["ldap://b/dc=b".into()]],
            ..Default::default()
        });
        let (mut channel, handle) = ScriptedChannel::new(vec![]);
        let request = SearchRequest::new("dc=a", SearchScope::WholeSubtree, Filter::present("objectClass"));
        let code = search(&mut channel, &handler, &request, &context()).await.unwrap();
        assert_eq!(code, result_code::SUCCESS);

        let sent = handle.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|m| m.message_id == 7));
        assert!(matches!(sent[0].op, ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(sent[2].op, ProtocolOp::SearchResultReference(_)));
        assert_eq!(sent[3].op, ProtocolOp::SearchResultDone(LdapResult::success()));
    }

    #[tokio::test]
    async fn test_handler_error_sends_nothing() {
        struct Failing;

        #[async_trait]
        impl RequestHandler for Failing {
            async fn bind(&self, _request: &BindRequest, _context: &RequestContext) -> Result<Token> {
                Ok(Token::Anonymous)
            }

            async fn search(&self, _request: &SearchRequest, _context: &RequestContext) -> Result<SearchOutcome> {
                Err(LdapError::operation(result_code::NO_SUCH_OBJECT, "missing"))
            }
        }

        let (mut channel, handle) = ScriptedChannel::new(vec![]);
        let request = SearchRequest::base("cn=x");
        let err = search(&mut channel, &Failing, &request, &context()).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::NO_SUCH_OBJECT));
        assert!(handle.sent().is_empty());
    }
}
