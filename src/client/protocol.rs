//! Connection-owning request dispatcher.
//!
//! Connects lazily to the first reachable server, hands each request to the
//! strategy for its type, and applies the referral policy to the result.
//! Connection-level failures close the channel; the next request reconnects.

use super::cancel::{self, CancelStrategy, MessageProcessor};
use super::referral::{self, DefaultChaser, ReferralChaser, ReferralContext};
use super::search::SearchCallbacks;
use super::sync::{self, SyncListener, SyncOutcome, SyncRequest};
use super::{basic, extended, sasl};
use crate::config::{ClientOptions, ReferralPolicy};
use crate::control::Control;
use crate::error::{LdapError, Result};
use crate::protocol::{ExtendedRequest, LdapMessage, ProtocolOp, MAX_MESSAGE_ID, START_TLS_OID};
use crate::queue::{MessageChannel, Queue};
use crate::sasl::SaslMechanism;
use crate::transport::{TlsUpgrade, Transport};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-connection message id allocator. Ids start at 1 and wrap after
/// 2^31 - 1.
#[derive(Debug, Default)]
pub struct MessageIds {
    last: i32,
}

impl MessageIds {
    pub fn next(&mut self) -> i32 {
        self.last = if self.last >= MAX_MESSAGE_ID { 1 } else { self.last + 1 };
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}

pub struct ClientProtocol {
    pub(super) options: ClientOptions,
    channel: Option<Box<dyn MessageChannel>>,
    host: Option<String>,
    ids: MessageIds,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    pub(super) last_bind: Option<crate::protocol::BindRequest>,
    pub(super) chaser: Arc<dyn ReferralChaser>,
}

impl ClientProtocol {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            channel: None,
            host: None,
            ids: MessageIds::default(),
            tls_config: None,
            last_bind: None,
            chaser: Arc::new(DefaultChaser),
        }
    }

    /// Uses an already established channel instead of connecting.
    pub fn with_channel(options: ClientOptions, channel: Box<dyn MessageChannel>) -> Self {
        let host = options.servers.first().cloned();
        Self {
            channel: Some(channel),
            host,
            ..Self::new(options)
        }
    }

    pub fn set_tls_config(&mut self, config: Arc<rustls::ClientConfig>) {
        self.tls_config = Some(config);
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().map(|c| c.is_connected()).unwrap_or(false)
    }

    pub fn is_encrypted(&self) -> bool {
        self.channel.as_ref().map(|c| c.is_encrypted()).unwrap_or(false)
    }

    /// Host of the current connection.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn tls_config(&mut self) -> Result<Arc<rustls::ClientConfig>> {
        if let Some(config) = &self.tls_config {
            return Ok(config.clone());
        }
        let config = crate::tls::load_client_config(&self.options.tls_options())
            .map_err(|e| LdapError::connection(format!("TLS setup failed: {:#}", e)))?;
        self.tls_config = Some(config.clone());
        Ok(config)
    }

    async fn connect(&mut self) -> Result<()> {
        let port = self.options.effective_port();
        let timeout = self.options.connect_timeout();
        let mut last_error = None;
        for host in self.options.servers.clone() {
            let upgrade = if self.options.use_ssl {
                Some(TlsUpgrade::client(self.tls_config()?, &host)?)
            } else {
                None
            };
            match Transport::connect(&host, port, timeout, upgrade).await {
                Ok(transport) => {
                    info!("Connected to {}:{}", host, port);
                    self.channel = Some(Box::new(Queue::new(transport)));
                    self.host = Some(host);
                    self.ids.reset();
                    if self.options.use_tls {
                        self.start_tls_connected(Vec::new()).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection to {}:{} failed: {}", host, port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LdapError::connection("no servers configured")))
    }

    fn connected_parts(&mut self) -> Result<(&mut dyn MessageChannel, &mut MessageIds)> {
        match self.channel.as_deref_mut() {
            Some(channel) => Ok((channel, &mut self.ids)),
            None => Err(LdapError::connection("not connected")),
        }
    }

    async fn parts(&mut self) -> Result<(&mut dyn MessageChannel, &mut MessageIds)> {
        if self.channel.is_none() {
            self.connect().await?;
        }
        self.connected_parts()
    }

    /// Closes the channel after a failure that leaves it unusable.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!("Closing connection after error: {}", e);
                let _ = self.close().await;
            }
        }
        result
    }

    /// Idempotent. The message id counter starts over on the next connection.
    pub async fn close(&mut self) -> Result<()> {
        let channel = self.channel.take();
        self.ids.reset();
        self.host = None;
        if let Some(mut channel) = channel {
            channel.close().await?;
            debug!("Connection closed");
        }
        Ok(())
    }

    async fn start_tls_connected(&mut self, controls: Vec<Control>) -> Result<LdapMessage> {
        let host = self.host.clone().unwrap_or_default();
        let upgrade = TlsUpgrade::client(self.tls_config()?, &host)?;
        let (channel, ids) = self.connected_parts()?;
        let request = LdapMessage::new(ids.next(), ProtocolOp::ExtendedRequest(ExtendedRequest::start_tls()))
            .with_controls(controls);
        let result = extended::start_tls(channel, request, upgrade).await;
        self.settle(result).await
    }

    pub async fn start_tls(&mut self, controls: Vec<Control>) -> Result<LdapMessage> {
        if self.channel.is_none() {
            self.connect().await?;
        }
        self.start_tls_connected(controls).await
    }

    pub async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<Option<LdapMessage>> {
        let mut context = ReferralContext::new();
        self.send_with_context(op, controls, None, &mut context).await
    }

    /// Sends `op` and applies the referral policy. Referral hops reuse
    /// `context`, so chained referrals share one visited set and limit.
    pub fn send_with_context<'a>(
        &'a mut self,
        op: ProtocolOp,
        controls: Vec<Control>,
        mut callbacks: Option<&'a mut SearchCallbacks>,
        context: &'a mut ReferralContext,
    ) -> BoxFuture<'a, Result<Option<LdapMessage>>> {
        Box::pin(async move {
            let request = op.clone();
            let dispatched = self.dispatch(op, controls.clone(), callbacks.as_deref_mut()).await;
            let response = match self.settle(dispatched).await? {
                Some(response) => response,
                None => return Ok(None),
            };
            let urls = match response.op.result() {
                Some(result) if result.is_referral() => result.referrals.clone(),
                _ => return Ok(Some(response)),
            };
            match self.options.referral {
                ReferralPolicy::Throw => Err(LdapError::Referral {
                    urls,
                    message: response.op.result().map(|r| r.diagnostic_message.clone()).unwrap_or_default(),
                }),
                ReferralPolicy::Follow => {
                    let chaser = self.chaser.clone();
                    referral::follow(
                        &urls,
                        &request,
                        &controls,
                        &self.options,
                        chaser,
                        self.last_bind.as_ref(),
                        context,
                        callbacks,
                    )
                    .await
                    .map(Some)
                }
            }
        })
    }

    async fn dispatch(
        &mut self,
        op: ProtocolOp,
        controls: Vec<Control>,
        callbacks: Option<&mut SearchCallbacks>,
    ) -> Result<Option<LdapMessage>> {
        if let ProtocolOp::ExtendedRequest(request) = &op {
            if request.name == START_TLS_OID {
                return self.start_tls(controls).await.map(Some);
            }
        }
        let (channel, ids) = self.parts().await?;
        let message = LdapMessage::new(ids.next(), op).with_controls(controls);
        debug!("Sending {} (id {})", message.op.name(), message.message_id);
        match &message.op {
            ProtocolOp::UnbindRequest => {
                basic::send_only(channel, message).await?;
                self.close().await?;
                Ok(None)
            }
            ProtocolOp::AbandonRequest(_) => {
                basic::send_only(channel, message).await?;
                Ok(None)
            }
            ProtocolOp::SearchRequest(_) => super::search::send(channel, message, callbacks).await.map(Some),
            ProtocolOp::ExtendedRequest(_) => extended::send(channel, message).await.map(Some),
            ProtocolOp::BindRequest(bind) => {
                let bind = bind.clone();
                let response = basic::send(channel, message).await?;
                self.last_bind = Some(bind);
                Ok(Some(response))
            }
            op if op.is_request() => basic::send(channel, message).await.map(Some),
            other => Err(LdapError::protocol(format!("{} is not a request", other.name()))),
        }
    }

    /// Sends a request without waiting for its response. Returns the message id.
    pub async fn send_only(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<i32> {
        let (channel, ids) = self.parts().await?;
        let message = LdapMessage::new(ids.next(), op).with_controls(controls);
        let id = message.message_id;
        let result = basic::send_only(channel, message).await.map(|_| id);
        self.settle(result).await
    }

    /// Next message of an operation started with `send_only`.
    pub async fn receive(&mut self, message_id: i32) -> Result<LdapMessage> {
        let (channel, _) = self.connected_parts()?;
        let result = channel.get_message(Some(message_id)).await;
        self.settle(result).await
    }

    pub async fn sasl_bind(&mut self, name: &str, mechanism: &mut dyn SaslMechanism) -> Result<LdapMessage> {
        let (channel, ids) = self.parts().await?;
        let mut next_id = || ids.next();
        let result = sasl::bind(channel, &mut next_id, name, mechanism).await;
        self.settle(result).await
    }

    pub async fn sync(&mut self, request: &mut SyncRequest, listener: Option<&mut SyncListener>) -> Result<SyncOutcome> {
        let (channel, ids) = self.parts().await?;
        let mut next_id = || ids.next();
        let result = sync::poll(channel, &mut next_id, request, listener).await;
        self.settle(result).await
    }

    pub async fn cancel(
        &mut self,
        target: i32,
        strategy: CancelStrategy,
        processor: Option<&mut MessageProcessor>,
    ) -> Result<LdapMessage> {
        let (channel, ids) = self.connected_parts()?;
        let cancel_id = ids.next();
        let result = cancel::cancel(channel, cancel_id, target, strategy, processor).await;
        self.settle(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BindRequest, BindResponse, LdapResult};
    use crate::result_code;
    use crate::testing::ScriptedChannel;

    fn protocol(responses: Vec<LdapMessage>) -> (ClientProtocol, crate::testing::ScriptHandle) {
        let (channel, handle) = ScriptedChannel::new(responses);
        (
            ClientProtocol::with_channel(ClientOptions::new(["a.example.com"]), Box::new(channel)),
            handle,
        )
    }

    #[test]
    fn test_message_ids_wrap() {
        let mut ids = MessageIds::default();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        ids.last = MAX_MESSAGE_ID;
        assert_eq!(ids.next(), 1);
        ids.reset();
        assert_eq!(ids.next(), 1);
    }

    #[tokio::test]
    async fn test_unbind_closes_and_resets_ids() {
        let (mut protocol, handle) = protocol(vec![LdapMessage::new(
            1,
            ProtocolOp::DeleteResponse(LdapResult::success()),
        )]);
        protocol
            .send(ProtocolOp::DeleteRequest("cn=a".into()), vec![])
            .await
            .unwrap();
        assert!(protocol.send(ProtocolOp::UnbindRequest, vec![]).await.unwrap().is_none());
        assert!(handle.is_closed());
        assert!(!protocol.is_connected());
        assert_eq!(protocol.ids.next(), 1);
        let sent = handle.sent();
        assert_eq!(sent[1].message_id, 2);
        assert_eq!(sent[1].op, ProtocolOp::UnbindRequest);
    }

    #[tokio::test]
    async fn test_abandon_expects_no_response() {
        let (mut protocol, handle) = protocol(vec![]);
        assert!(protocol.send(ProtocolOp::AbandonRequest(3), vec![]).await.unwrap().is_none());
        assert_eq!(handle.sent().len(), 1);
        assert!(protocol.is_connected());
    }

    #[tokio::test]
    async fn test_referral_throw_policy() {
        let (mut protocol, _) = protocol(vec![LdapMessage::new(
            1,
            ProtocolOp::ModifyResponse(LdapResult::referral(vec!["ldap://b/dc=b".into()])),
        )]);
        let op = ProtocolOp::ModifyRequest(crate::protocol::ModifyRequest {
            dn: "cn=a".into(),
            changes: vec![],
        });
        match protocol.send(op, vec![]).await {
            Err(LdapError::Referral { urls, .. }) => assert_eq!(urls, vec!["ldap://b/dc=b".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_error_closes_channel() {
        let (mut protocol, handle) = protocol(vec![]);
        let err = protocol
            .send(ProtocolOp::DeleteRequest("cn=a".into()), vec![])
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(handle.is_closed());
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_successful_bind_is_remembered() {
        let (mut protocol, _) = protocol(vec![LdapMessage::new(
            1,
            ProtocolOp::BindResponse(BindResponse::default()),
        )]);
        let bind = BindRequest::simple("cn=admin", "secret");
        protocol.send(ProtocolOp::BindRequest(bind.clone()), vec![]).await.unwrap();
        assert_eq!(protocol.last_bind, Some(bind));
    }

    #[tokio::test]
    async fn test_failed_bind_is_not_remembered() {
        let (mut protocol, _) = protocol(vec![LdapMessage::new(
            1,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(result_code::INVALID_CREDENTIALS, ""),
                server_sasl_creds: None,
            }),
        )]);
        let bind = BindRequest::simple("cn=admin", "wrong");
        assert!(protocol.send(ProtocolOp::BindRequest(bind), vec![]).await.is_err());
        assert!(protocol.last_bind.is_none());
        assert!(protocol.is_connected());
    }
}
