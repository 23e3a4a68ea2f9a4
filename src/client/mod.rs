//! LDAP client.
//!
//! [`LdapClient`] is the entry point: typed helpers for every operation on
//! top of [`ClientProtocol`], which owns the connection and routes each
//! request through its strategy (basic, search, extended, SASL, sync,
//! cancel) and the referral policy.

pub mod basic;
pub mod cancel;
pub mod extended;
pub mod paging;
pub mod protocol;
pub mod referral;
pub mod sasl;
pub mod search;
pub mod sync;

pub use cancel::{CancelStrategy, MessageProcessor};
pub use paging::Paging;
pub use protocol::{ClientProtocol, MessageIds};
pub use referral::{DefaultChaser, ReferralChaser, ReferralContext};
pub use search::SearchCallbacks;
pub use sync::{SyncContext, SyncEvent, SyncListener, SyncOutcome, SyncPhase, SyncRequest};

use crate::config::ClientOptions;
use crate::control::Control;
use crate::dn::Dn;
use crate::entry::{Attribute, Entry};
use crate::error::{LdapError, Result};
use crate::protocol::{
    AddRequest, BindRequest, CompareRequest, ExtendedRequest, LdapMessage, Modification, ModifyDnRequest,
    ModifyRequest, ProtocolOp, SearchRequest, SearchResponse,
};
use crate::result_code;
use crate::sasl::SaslMechanism;
use std::sync::Arc;

pub struct LdapClient {
    pub(crate) protocol: ClientProtocol,
    root_dse: Option<Entry>,
}

fn expect_response(response: Option<LdapMessage>) -> Result<LdapMessage> {
    response.ok_or_else(|| LdapError::protocol("operation produced no response"))
}

impl LdapClient {
    /// Validates the options. Nothing connects until the first request.
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            protocol: ClientProtocol::new(options),
            root_dse: None,
        })
    }

    /// Client over an established channel, e.g. an in-memory transport.
    pub fn with_channel(options: ClientOptions, channel: Box<dyn crate::queue::MessageChannel>) -> Self {
        Self {
            protocol: ClientProtocol::with_channel(options, channel),
            root_dse: None,
        }
    }

    pub fn with_chaser(mut self, chaser: Arc<dyn ReferralChaser>) -> Self {
        self.protocol.chaser = chaser;
        self
    }

    /// TLS settings used for LDAPS and StartTLS instead of the ones built
    /// from the options.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.protocol.set_tls_config(config);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.protocol.options
    }

    pub fn is_connected(&self) -> bool {
        self.protocol.is_connected()
    }

    pub fn is_encrypted(&self) -> bool {
        self.protocol.is_encrypted()
    }

    /// Send any request. Unbind and abandon return `None`.
    pub async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<Option<LdapMessage>> {
        self.protocol.send(op, controls).await
    }

    pub async fn bind(&mut self, dn: &str, password: &str) -> Result<LdapMessage> {
        let op = ProtocolOp::BindRequest(BindRequest::simple(dn, password));
        expect_response(self.send(op, Vec::new()).await?)
    }

    pub async fn anonymous_bind(&mut self) -> Result<LdapMessage> {
        expect_response(self.send(ProtocolOp::BindRequest(BindRequest::anonymous()), Vec::new()).await?)
    }

    pub async fn sasl_bind(&mut self, mechanism: &mut dyn SaslMechanism) -> Result<LdapMessage> {
        self.protocol.sasl_bind("", mechanism).await
    }

    pub(crate) async fn send_search(
        &mut self,
        request: SearchRequest,
        controls: Vec<Control>,
    ) -> Result<(SearchResponse, Vec<Control>)> {
        let response = expect_response(self.send(ProtocolOp::SearchRequest(request), controls).await?)?;
        match response.op {
            ProtocolOp::SearchResponse(aggregate) => Ok((aggregate, response.controls)),
            other => Err(LdapError::protocol(format!("search answered with {}", other.name()))),
        }
    }

    /// Search and collect every entry and reference.
    pub async fn search(&mut self, request: SearchRequest, controls: Vec<Control>) -> Result<SearchResponse> {
        Ok(self.send_search(request, controls).await?.0)
    }

    /// Search, streaming results to `callbacks`.
    pub async fn search_with(
        &mut self,
        request: SearchRequest,
        controls: Vec<Control>,
        callbacks: &mut SearchCallbacks,
    ) -> Result<LdapMessage> {
        let mut context = ReferralContext::new();
        let response = self
            .protocol
            .send_with_context(ProtocolOp::SearchRequest(request), controls, Some(callbacks), &mut context)
            .await?;
        expect_response(response)
    }

    /// Base-scope read. A missing entry yields `None`.
    pub async fn read(&mut self, dn: &str, attributes: &[&str]) -> Result<Option<Entry>> {
        let request = SearchRequest::base(dn).with_attributes(attributes.iter().copied());
        match self.search(request, Vec::new()).await {
            Ok(response) => Ok(response.entries.into_iter().next()),
            Err(e) if e.code() == Some(result_code::NO_SUCH_OBJECT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read_or_fail(&mut self, dn: &str, attributes: &[&str]) -> Result<Entry> {
        self.read(dn, attributes)
            .await?
            .ok_or_else(|| LdapError::operation(result_code::NO_SUCH_OBJECT, format!("entry {} not found", dn)))
    }

    pub async fn add(&mut self, entry: Entry) -> Result<LdapMessage> {
        expect_response(self.send(ProtocolOp::AddRequest(AddRequest { entry }), Vec::new()).await?)
    }

    pub async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<LdapMessage> {
        let op = ProtocolOp::ModifyRequest(ModifyRequest {
            dn: dn.to_string(),
            changes,
        });
        expect_response(self.send(op, Vec::new()).await?)
    }

    pub async fn delete(&mut self, dn: &str) -> Result<LdapMessage> {
        expect_response(self.send(ProtocolOp::DeleteRequest(dn.to_string()), Vec::new()).await?)
    }

    pub async fn rename(&mut self, dn: &str, new_rdn: &str, delete_old_rdn: bool) -> Result<LdapMessage> {
        let op = ProtocolOp::ModifyDnRequest(ModifyDnRequest {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            delete_old_rdn,
            new_superior: None,
        });
        expect_response(self.send(op, Vec::new()).await?)
    }

    /// Move under `new_parent`, keeping the RDN.
    pub async fn move_entry(&mut self, dn: &str, new_parent: &str) -> Result<LdapMessage> {
        let parsed = Dn::parse(dn)?;
        let rdn = parsed
            .rdn()
            .ok_or_else(|| LdapError::operation(result_code::NAMING_VIOLATION, "cannot move the root DSE"))?;
        let op = ProtocolOp::ModifyDnRequest(ModifyDnRequest {
            dn: dn.to_string(),
            new_rdn: rdn.to_string(),
            delete_old_rdn: true,
            new_superior: Some(new_parent.to_string()),
        });
        expect_response(self.send(op, Vec::new()).await?)
    }

    pub async fn compare(&mut self, dn: &str, attribute: &str, value: impl AsRef<[u8]>) -> Result<bool> {
        let op = ProtocolOp::CompareRequest(CompareRequest {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value: value.as_ref().to_vec(),
        });
        let response = expect_response(self.send(op, Vec::new()).await?)?;
        match response.op.result().map(|r| r.code) {
            Some(result_code::COMPARE_TRUE) => Ok(true),
            Some(result_code::COMPARE_FALSE) => Ok(false),
            _ => Err(LdapError::protocol("compare returned neither compareTrue nor compareFalse")),
        }
    }

    /// The authorization identity of this connection; empty when anonymous.
    pub async fn whoami(&mut self) -> Result<String> {
        let response = expect_response(
            self.send(ProtocolOp::ExtendedRequest(ExtendedRequest::whoami()), Vec::new())
                .await?,
        )?;
        match response.op {
            ProtocolOp::WhoAmIResponse(whoami) => Ok(whoami.authz_id),
            other => Err(LdapError::protocol(format!("WhoAmI answered with {}", other.name()))),
        }
    }

    /// Returns the server-generated password when `new_password` is `None`.
    pub async fn password_modify(
        &mut self,
        user: Option<&str>,
        old_password: Option<&str>,
        new_password: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let request = ExtendedRequest::password_modify(
            user,
            old_password.map(str::as_bytes),
            new_password.map(str::as_bytes),
        );
        let response = expect_response(self.send(ProtocolOp::ExtendedRequest(request), Vec::new()).await?)?;
        match response.op {
            ProtocolOp::PasswordModifyResponse(modify) => Ok(modify.generated_password),
            other => Err(LdapError::protocol(format!("password modify answered with {}", other.name()))),
        }
    }

    pub async fn start_tls(&mut self) -> Result<()> {
        self.protocol.start_tls(Vec::new()).await.map(|_| ())
    }

    pub async fn unbind(&mut self) -> Result<()> {
        if !self.protocol.is_connected() {
            return self.protocol.close().await;
        }
        self.root_dse = None;
        self.send(ProtocolOp::UnbindRequest, Vec::new()).await.map(|_| ())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.root_dse = None;
        self.protocol.close().await
    }

    /// The server's RootDSE, cached after the first read.
    pub async fn root_dse(&mut self, reload: bool) -> Result<Entry> {
        if !reload {
            if let Some(entry) = &self.root_dse {
                return Ok(entry.clone());
            }
        }
        let entry = self.read_or_fail("", &["*", "+"]).await?;
        self.root_dse = Some(entry.clone());
        Ok(entry)
    }

    /// Start an operation without waiting for its response; pair with
    /// [`LdapClient::receive`] and [`LdapClient::cancel`].
    pub async fn send_only(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<i32> {
        self.protocol.send_only(op, controls).await
    }

    pub async fn receive(&mut self, message_id: i32) -> Result<LdapMessage> {
        self.protocol.receive(message_id).await
    }

    pub async fn cancel(
        &mut self,
        message_id: i32,
        strategy: CancelStrategy,
        processor: Option<&mut MessageProcessor>,
    ) -> Result<LdapMessage> {
        self.protocol.cancel(message_id, strategy, processor).await
    }

    /// Run one sync poll. `request.cookie` is advanced for the next poll.
    pub async fn sync(&mut self, request: &mut SyncRequest, listener: Option<&mut SyncListener>) -> Result<SyncOutcome> {
        self.protocol.sync(request, listener).await
    }

    /// Paged search; `size` defaults to `page_size` from the options.
    pub fn paging(&mut self, request: SearchRequest, size: Option<i64>) -> Paging<'_> {
        let size = size.unwrap_or(self.protocol.options.page_size);
        Paging::new(self, request, Vec::new(), size)
    }

    pub fn paging_with(&mut self, request: SearchRequest, controls: Vec<Control>, size: i64) -> Paging<'_> {
        Paging::new(self, request, controls, size)
    }
}

/// Convenience for building modification lists.
pub fn replace(name: &str, values: &[&str]) -> Modification {
    Modification::replace(Attribute::from_strs(name, values))
}
