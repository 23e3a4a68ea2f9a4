// Test doubles shared by the client strategy tests.

use crate::error::{LdapError, Result};
use crate::protocol::LdapMessage;
use crate::queue::MessageChannel;
use crate::sasl::SecurityLayer;
use crate::transport::TlsUpgrade;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    pending: VecDeque<LdapMessage>,
    sent: Vec<LdapMessage>,
    encrypted: bool,
    wrapped: bool,
    closed: bool,
}

/// Replays canned responses and records everything sent.
pub struct ScriptedChannel {
    script: Arc<Mutex<Script>>,
}

/// Inspection handle that outlives the boxed channel.
#[derive(Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

impl ScriptedChannel {
    pub fn new(responses: Vec<LdapMessage>) -> (Self, ScriptHandle) {
        let script = Arc::new(Mutex::new(Script {
            pending: responses.into(),
            ..Default::default()
        }));
        (
            Self {
                script: script.clone(),
            },
            ScriptHandle { script },
        )
    }
}

impl ScriptHandle {
    pub fn sent(&self) -> Vec<LdapMessage> {
        self.script.lock().unwrap().sent.clone()
    }

    /// Responses never read by the code under test.
    pub fn unread(&self) -> usize {
        self.script.lock().unwrap().pending.len()
    }

    pub fn push(&self, message: LdapMessage) {
        self.script.lock().unwrap().pending.push_back(message);
    }

    pub fn is_encrypted(&self) -> bool {
        self.script.lock().unwrap().encrypted
    }

    pub fn is_wrapped(&self) -> bool {
        self.script.lock().unwrap().wrapped
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().unwrap().closed
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn send_message(&mut self, messages: &[LdapMessage]) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        if script.closed {
            return Err(LdapError::connection("channel closed"));
        }
        script.sent.extend_from_slice(messages);
        Ok(())
    }

    async fn get_message(&mut self, id: Option<i32>) -> Result<LdapMessage> {
        let message = self
            .script
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .ok_or_else(|| LdapError::connection("script exhausted"))?;
        if let Some(expected) = id {
            if message.message_id != expected {
                return Err(LdapError::protocol(format!(
                    "expected message id {}, received {}",
                    expected, message.message_id
                )));
            }
        }
        Ok(message)
    }

    async fn encrypt(&mut self, _upgrade: TlsUpgrade) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        if script.encrypted {
            return Err(LdapError::operation(crate::result_code::OPERATIONS_ERROR, "already encrypted"));
        }
        script.encrypted = true;
        Ok(())
    }

    fn set_message_wrapper(&mut self, _wrapper: Box<dyn SecurityLayer>) {
        self.script.lock().unwrap().wrapped = true;
    }

    fn is_encrypted(&self) -> bool {
        self.script.lock().unwrap().encrypted
    }

    fn is_connected(&self) -> bool {
        !self.script.lock().unwrap().closed
    }

    async fn close(&mut self) -> Result<()> {
        self.script.lock().unwrap().closed = true;
        Ok(())
    }
}

/// A TLS upgrade that is never actually performed against a socket.
pub fn dummy_client_upgrade() -> TlsUpgrade {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    TlsUpgrade::client(Arc::new(config), "localhost").unwrap()
}

/// Server TLS configuration without certificates; only usable where the
/// handshake never runs.
pub fn dummy_server_config() -> Arc<rustls::ServerConfig> {
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
    )
}
