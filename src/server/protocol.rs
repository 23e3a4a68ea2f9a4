//! Per-connection server protocol handler.
//!
//! Reads one request at a time, validates its message id, applies the
//! authentication gate and runs the matching strategy. Operation errors are
//! answered on the triggering message; anything else ends the connection
//! with a Notice of Disconnection when the peer can still hear it.

use super::handler::{Handlers, RequestContext, Token};
use super::paging::PagingRegistry;
use super::{bind, dispatch, extended, root_dse, search};
use crate::config::ServerOptions;
use crate::control::{find, PAGING_OID};
use crate::error::{LdapError, Result};
use crate::metrics::Metrics;
use crate::protocol::{
    BindResponse, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp, SearchRequest, START_TLS_OID, WHOAMI_OID,
};
use crate::queue::MessageChannel;
use crate::result_code;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

enum Flow {
    Continue,
    Stop,
}

/// Label used for metrics.
fn operation_label(op: &ProtocolOp) -> &'static str {
    match op {
        ProtocolOp::BindRequest(_) => "bind",
        ProtocolOp::SearchRequest(_) => "search",
        ProtocolOp::AddRequest(_) => "add",
        ProtocolOp::ModifyRequest(_) => "modify",
        ProtocolOp::DeleteRequest(_) => "delete",
        ProtocolOp::ModifyDnRequest(_) => "modify_dn",
        ProtocolOp::CompareRequest(_) => "compare",
        ProtocolOp::ExtendedRequest(_) => "extended",
        _ => "other",
    }
}

/// Operations allowed before authenticating.
fn is_always_allowed(op: &ProtocolOp) -> bool {
    match op {
        ProtocolOp::BindRequest(_) | ProtocolOp::UnbindRequest => true,
        ProtocolOp::ExtendedRequest(request) => request.name == START_TLS_OID || request.name == WHOAMI_OID,
        ProtocolOp::SearchRequest(request) => request.is_root_dse(),
        _ => false,
    }
}

/// Result sent back for an error, or None when the error must end the
/// connection.
fn error_result(error: &LdapError) -> Option<LdapResult> {
    match error {
        LdapError::Operation {
            code,
            message,
            matched_dn,
        } => Some(LdapResult {
            matched_dn: matched_dn.clone(),
            ..LdapResult::new(*code, message.clone())
        }),
        LdapError::Bind { code, message } => Some(LdapResult::new(*code, message.clone())),
        LdapError::Referral { urls, message } => Some(LdapResult {
            diagnostic_message: message.clone(),
            ..LdapResult::referral(urls.clone())
        }),
        _ => None,
    }
}

pub struct ServerProtocol {
    channel: Box<dyn MessageChannel>,
    options: Arc<ServerOptions>,
    handlers: Handlers,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    metrics: Arc<Metrics>,
    peer: String,
    token: Token,
    seen_ids: HashSet<i32>,
    paging: PagingRegistry,
}

impl ServerProtocol {
    pub fn new(
        channel: Box<dyn MessageChannel>,
        options: Arc<ServerOptions>,
        handlers: Handlers,
        metrics: Arc<Metrics>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            options,
            handlers,
            tls_config: None,
            metrics,
            peer: peer.into(),
            token: Token::Anonymous,
            seen_ids: HashSet::new(),
            paging: PagingRegistry::new(),
        }
    }

    /// Enables StartTLS.
    pub fn with_tls_config(mut self, config: Option<Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = config;
        self
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Serve the connection until unbind, disconnect or a fatal error. The
    /// channel is always closed on return.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.serve().await;
        self.release_paging().await;
        let _ = self.channel.close().await;
        debug!("Connection from {} closed", self.peer);
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let message = match self.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("Closing idle connection from {}", self.peer);
                    self.notify_disconnect(result_code::UNAVAILABLE, "The connection was idle for too long.")
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_connection_error() => {
                    debug!("Client {} disconnected: {}", self.peer, e);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Invalid LDAP message from {}: {}", self.peer, e);
                    self.metrics.inc_parse_error();
                    self.notify_disconnect(result_code::PROTOCOL_ERROR, &e.diagnostic()).await;
                    return Err(e);
                }
            };
            match self.handle(message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Ok(()),
                Err(e) => {
                    let code = match e {
                        LdapError::Protocol { .. } => result_code::PROTOCOL_ERROR,
                        _ => result_code::UNAVAILABLE,
                    };
                    self.notify_disconnect(code, &e.diagnostic()).await;
                    return Err(e);
                }
            }
        }
    }

    /// None when the idle timeout elapsed.
    async fn receive(&mut self) -> Result<Option<LdapMessage>> {
        let idle = self.options.idle_timeout();
        let read = self.channel.get_message(None);
        match idle {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(message) => message.map(Some),
                Err(_) => Ok(None),
            },
            None => read.await.map(Some),
        }
    }

    async fn notify_disconnect(&mut self, code: u32, message: &str) {
        if !self.channel.is_connected() {
            return;
        }
        let notice = ExtendedResponse::notice_of_disconnection(code, message);
        if let Err(e) = self
            .channel
            .send_message(&[LdapMessage::new(0, ProtocolOp::ExtendedResponse(notice))])
            .await
        {
            debug!("Could not send notice of disconnection to {}: {}", self.peer, e);
        }
    }

    async fn handle(&mut self, message: LdapMessage) -> Result<Flow> {
        let LdapMessage {
            message_id,
            op,
            controls,
        } = message;

        if message_id == 0 || !self.seen_ids.insert(message_id) {
            warn!("Rejecting reused or reserved message id {} from {}", message_id, self.peer);
            let error = LdapError::operation(
                result_code::PROTOCOL_ERROR,
                format!("The message id {} is not valid on this connection.", message_id),
            );
            self.respond_error(message_id, &op, &error).await?;
            return Ok(Flow::Continue);
        }
        debug!("Received {} (id {}) from {}", op.name(), message_id, self.peer);

        match op {
            ProtocolOp::UnbindRequest => {
                info!("Unbind from {}", self.peer);
                self.channel.close().await?;
                return Ok(Flow::Stop);
            }
            ProtocolOp::AbandonRequest(target) => {
                debug!("Ignoring abandon of message {} from {}", target, self.peer);
                return Ok(Flow::Continue);
            }
            _ if !op.is_request() => {
                return Err(LdapError::protocol(format!(
                    "clients may not send {}",
                    op.name()
                )));
            }
            _ => {}
        }

        let label = operation_label(&op);
        let context = RequestContext {
            message_id,
            controls,
            token: self.token.clone(),
            peer: self.peer.clone(),
            encrypted: self.channel.is_encrypted(),
        };
        let start = Instant::now();
        let outcome = if self.is_permitted(&op) {
            self.execute(&op, &context).await
        } else {
            debug!("Rejecting unauthenticated {} from {}", op.name(), self.peer);
            Err(LdapError::operation(
                result_code::INSUFFICIENT_ACCESS_RIGHTS,
                "Authentication is required for this operation.",
            ))
        };
        self.metrics.observe_duration(label, start.elapsed());

        match outcome {
            Ok(code) => {
                self.metrics.inc_request(label);
                self.metrics.inc_result(label, code);
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.metrics.inc_error(label);
                if error_result(&e).is_none() {
                    return Err(e);
                }
                debug!("{} (id {}) from {} failed: {}", op.name(), message_id, self.peer, e);
                self.respond_error(message_id, &op, &e).await?;
                Ok(Flow::Continue)
            }
        }
    }

    fn is_permitted(&self, op: &ProtocolOp) -> bool {
        !self.options.require_authentication || !self.token.is_anonymous() || is_always_allowed(op)
    }

    /// Runs the strategy for `op`; returns the result code it sent.
    async fn execute(&mut self, op: &ProtocolOp, context: &RequestContext) -> Result<u32> {
        match op {
            ProtocolOp::BindRequest(request) => {
                self.token = Token::Anonymous;
                let token =
                    bind::authenticate(self.handlers.request.as_ref(), &self.options, request, context).await?;
                info!("Bind from {} as '{}'", self.peer, token.authz_id());
                self.token = token;
                let response = ProtocolOp::BindResponse(BindResponse {
                    result: LdapResult::success(),
                    server_sasl_creds: None,
                });
                self.channel
                    .send_message(&[LdapMessage::new(context.message_id, response)])
                    .await?;
                Ok(result_code::SUCCESS)
            }
            ProtocolOp::SearchRequest(request) if request.is_root_dse() => {
                root_dse::send(self.channel.as_mut(), &self.options, &self.handlers, request, context).await
            }
            ProtocolOp::SearchRequest(request) => self.search(request, context).await,
            ProtocolOp::ExtendedRequest(request) if request.name == START_TLS_OID => {
                extended::start_tls(self.channel.as_mut(), self.tls_config.clone(), context.message_id).await
            }
            ProtocolOp::ExtendedRequest(request) if request.name == WHOAMI_OID => {
                extended::whoami(self.channel.as_mut(), &self.token, context.message_id).await
            }
            other => {
                dispatch::dispatch(self.channel.as_mut(), self.handlers.request.as_ref(), other, context).await
            }
        }
    }

    async fn search(&mut self, request: &SearchRequest, context: &RequestContext) -> Result<u32> {
        let paging = find(&context.controls, PAGING_OID);
        match (paging, &self.handlers.paging) {
            (Some(control), Some(handler)) => {
                let Some(value) = control.as_paging().cloned() else {
                    return Err(LdapError::operation(result_code::PROTOCOL_ERROR, "Malformed paging control."));
                };
                super::paging::paged_search(
                    self.channel.as_mut(),
                    handler.as_ref(),
                    &mut self.paging,
                    request.clone(),
                    value,
                    context,
                )
                .await
            }
            (Some(control), None) if control.criticality => Err(LdapError::operation(
                result_code::UNAVAILABLE_CRITICAL_EXTENSION,
                "The paging control is not supported.",
            )),
            _ => search::search(self.channel.as_mut(), self.handlers.request.as_ref(), request, context).await,
        }
    }

    async fn respond_error(&mut self, message_id: i32, op: &ProtocolOp, error: &LdapError) -> Result<()> {
        let Some(result) = error_result(error) else {
            return Ok(());
        };
        let Some(response) = op.response_for(result) else {
            debug!("No response exists for {}; dropping error '{}'", op.name(), error);
            return Ok(());
        };
        self.channel
            .send_message(&[LdapMessage::new(message_id, response)])
            .await
    }

    async fn release_paging(&mut self) {
        let Some(handler) = self.handlers.paging.clone() else {
            return;
        };
        for request in self.paging.drain() {
            let context = RequestContext {
                message_id: 0,
                controls: request.controls.clone(),
                token: self.token.clone(),
                peer: self.peer.clone(),
                encrypted: self.channel.is_encrypted(),
            };
            if let Err(e) = handler.remove(&request, &context).await {
                warn!("Failed to release paged search for {}: {}", self.peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use crate::entry::Entry;
    use crate::protocol::{BindRequest, ExtendedRequest, WhoAmIResponse};
    use crate::server::handler::{RequestHandler, SearchOutcome};
    use crate::testing::{dummy_server_config, ScriptHandle, ScriptedChannel};
    use async_trait::async_trait;

    struct Directory;

    #[async_trait]
    impl RequestHandler for Directory {
        async fn bind(&self, request: &BindRequest, _context: &RequestContext) -> Result<Token> {
            match &request.authentication {
                crate::protocol::BindAuthentication::Simple(pw) if request.name == "foo" && pw == b"bar" => {
                    Ok(Token::bound("cn=foo,dc=example,dc=com"))
                }
                _ => Err(LdapError::operation(result_code::INVALID_CREDENTIALS, "Invalid credentials.")),
            }
        }

        async fn search(&self, _request: &SearchRequest, _context: &RequestContext) -> Result<SearchOutcome> {
            Ok(SearchOutcome::entries(vec![Entry::new("cn=foo,dc=example,dc=com")]))
        }
    }

    fn handlers() -> Handlers {
        Handlers {
            request: Arc::new(Directory),
            root_dse: None,
            paging: None,
        }
    }

    fn server(script: Vec<LdapMessage>, options: ServerOptions) -> (ServerProtocol, ScriptHandle, Arc<Metrics>) {
        let (channel, handle) = ScriptedChannel::new(script);
        let metrics = Arc::new(Metrics::new());
        let protocol = ServerProtocol::new(Box::new(channel), Arc::new(options), handlers(), metrics.clone(), "test");
        (protocol, handle, metrics)
    }

    fn search_request() -> ProtocolOp {
        ProtocolOp::SearchRequest(SearchRequest::new(
            "dc=example,dc=com",
            crate::protocol::SearchScope::WholeSubtree,
            crate::filter::Filter::present("objectClass"),
        ))
    }

    #[tokio::test]
    async fn test_simple_bind_success() {
        let (protocol, handle, metrics) = server(
            vec![LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("foo", "bar")))],
            ServerOptions::default(),
        );
        protocol.run().await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, 1);
        match &sent[0].op {
            ProtocolOp::BindResponse(response) => assert!(response.result.is_success()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.is_closed());
        assert_eq!(metrics.requests("bind"), 1);
    }

    #[tokio::test]
    async fn test_authentication_gate() {
        let (protocol, handle, _) = server(
            vec![
                LdapMessage::new(1, search_request()),
                LdapMessage::new(2, ProtocolOp::SearchRequest(SearchRequest::base(""))),
                LdapMessage::new(3, ProtocolOp::BindRequest(BindRequest::simple("foo", "bar"))),
                LdapMessage::new(4, search_request()),
            ],
            ServerOptions::default(),
        );
        protocol.run().await.unwrap();
        let sent = handle.sent();
        assert_eq!(
            sent[0],
            LdapMessage::new(
                1,
                ProtocolOp::SearchResultDone(LdapResult::new(
                    result_code::INSUFFICIENT_ACCESS_RIGHTS,
                    "Authentication is required for this operation."
                ))
            )
        );
        assert!(matches!(sent[1].op, ProtocolOp::SearchResultEntry(ref e) if e.dn.is_empty()));
        assert_eq!(sent[2].message_id, 2);
        assert_eq!(sent[3].message_id, 3);
        assert!(matches!(sent[4].op, ProtocolOp::SearchResultEntry(_)));
        assert_eq!(sent[5].op, ProtocolOp::SearchResultDone(LdapResult::success()));
    }

    #[tokio::test]
    async fn test_gate_can_be_disabled() {
        let options = ServerOptions {
            require_authentication: false,
            ..Default::default()
        };
        let (protocol, handle, _) = server(vec![LdapMessage::new(1, search_request())], options);
        protocol.run().await.unwrap();
        assert_eq!(handle.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_reused_and_zero_message_ids() {
        let bind = || ProtocolOp::BindRequest(BindRequest::simple("foo", "bar"));
        let (protocol, handle, _) = server(
            vec![
                LdapMessage::new(1, bind()),
                LdapMessage::new(1, bind()),
                LdapMessage::new(0, bind()),
                LdapMessage::new(2, bind()),
            ],
            ServerOptions::default(),
        );
        protocol.run().await.unwrap();
        let codes: Vec<(i32, u32)> = handle
            .sent()
            .iter()
            .map(|m| (m.message_id, m.op.result().unwrap().code))
            .collect();
        assert_eq!(
            codes,
            vec![
                (1, result_code::SUCCESS),
                (1, result_code::PROTOCOL_ERROR),
                (0, result_code::PROTOCOL_ERROR),
                (2, result_code::SUCCESS),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_bind_resets_identity() {
        let whoami = || ProtocolOp::ExtendedRequest(ExtendedRequest::whoami());
        let (protocol, handle, metrics) = server(
            vec![
                LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("foo", "bar"))),
                LdapMessage::new(2, whoami()),
                LdapMessage::new(3, ProtocolOp::BindRequest(BindRequest::simple("foo", "wrong"))),
                LdapMessage::new(4, whoami()),
            ],
            ServerOptions::default(),
        );
        protocol.run().await.unwrap();
        let sent = handle.sent();
        let authz = |m: &LdapMessage| match &m.op {
            ProtocolOp::ExtendedResponse(r) => WhoAmIResponse::from_extended(r.clone()).unwrap().authz_id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(authz(&sent[1]), "dn:cn=foo,dc=example,dc=com");
        assert_eq!(sent[2].op.result().unwrap().code, result_code::INVALID_CREDENTIALS);
        assert_eq!(authz(&sent[3]), "");
        assert_eq!(metrics.errors("bind"), 1);
    }

    #[tokio::test]
    async fn test_unbind_closes_without_response() {
        let (protocol, handle, _) = server(
            vec![
                LdapMessage::new(1, ProtocolOp::UnbindRequest),
                LdapMessage::new(2, ProtocolOp::BindRequest(BindRequest::simple("foo", "bar"))),
            ],
            ServerOptions::default(),
        );
        protocol.run().await.unwrap();
        assert!(handle.sent().is_empty());
        assert!(handle.is_closed());
        assert_eq!(handle.unread(), 1);
    }

    #[tokio::test]
    async fn test_critical_paging_without_handler() {
        let options = ServerOptions {
            require_authentication: false,
            ..Default::default()
        };
        let paged = |critical| {
            LdapMessage::new(1, search_request()).with_controls(vec![Control::paging(10, vec![], critical)])
        };
        let (protocol, handle, _) = server(vec![paged(true)], options.clone());
        protocol.run().await.unwrap();
        assert_eq!(
            handle.sent()[0].op.result().unwrap().code,
            result_code::UNAVAILABLE_CRITICAL_EXTENSION
        );

        let (protocol, handle, _) = server(vec![paged(false)], options);
        protocol.run().await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].controls.is_empty());
    }

    #[tokio::test]
    async fn test_start_tls_upgrades_channel() {
        let (channel, handle) = ScriptedChannel::new(vec![LdapMessage::new(
            1,
            ProtocolOp::ExtendedRequest(ExtendedRequest::start_tls()),
        )]);
        let protocol = ServerProtocol::new(
            Box::new(channel),
            Arc::new(ServerOptions::default()),
            handlers(),
            Arc::new(Metrics::new()),
            "test",
        )
        .with_tls_config(Some(dummy_server_config()));
        protocol.run().await.unwrap();
        assert!(handle.is_encrypted());
        assert!(handle.sent()[0].op.result().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_idle_timeout_sends_notice() {
        use crate::queue::Queue;
        use crate::transport::Transport;

        let (client_side, server_side) = tokio::io::duplex(4096);
        let options = ServerOptions {
            idle_timeout_sec: Some(1),
            ..Default::default()
        };
        let protocol = ServerProtocol::new(
            Box::new(Queue::new(Transport::memory(server_side))),
            Arc::new(options),
            handlers(),
            Arc::new(Metrics::new()),
            "test",
        );
        let mut client = Queue::new(Transport::memory(client_side));
        protocol.run().await.unwrap();
        match client.get_message(None).await {
            Err(LdapError::UnsolicitedNotification { code, .. }) => assert_eq!(code, result_code::UNAVAILABLE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_from_client_ends_connection() {
        let (protocol, handle, _) = server(
            vec![LdapMessage::new(1, ProtocolOp::DeleteResponse(LdapResult::success()))],
            ServerOptions::default(),
        );
        assert!(protocol.run().await.is_err());
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, 0);
        match &sent[0].op {
            ProtocolOp::ExtendedResponse(notice) => {
                assert_eq!(notice.name.as_deref(), Some(crate::protocol::NOTICE_OF_DISCONNECTION_OID));
                assert_eq!(notice.result.code, result_code::PROTOCOL_ERROR);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
