//! Frame-level reads and writes over a transport, with message id checks,
//! unsolicited notification detection and an optional SASL security layer.

use crate::ber::peek_frame_length;
use crate::error::{LdapError, Result};
use crate::protocol::{LdapMessage, ProtocolOp};
use crate::sasl::SecurityLayer;
use crate::transport::{TlsUpgrade, Transport};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Writes are flushed in chunks of this size.
pub const WRITE_CHUNK_SIZE: usize = 8192;

const READ_CHUNK_SIZE: usize = 8192;

/// The receive/send seam every protocol strategy talks to. `Queue` is the
/// socket-backed implementation; tests substitute scripted channels.
#[async_trait]
pub trait MessageChannel: Send {
    /// Encode and write all messages as one buffer.
    async fn send_message(&mut self, messages: &[LdapMessage]) -> Result<()>;

    /// Read the next complete message. With `id`, a different message id is a
    /// protocol error. A message with id 0 carrying an extended response is
    /// returned as `LdapError::UnsolicitedNotification`.
    async fn get_message(&mut self, id: Option<i32>) -> Result<LdapMessage>;

    /// Switch the transport to TLS.
    async fn encrypt(&mut self, upgrade: TlsUpgrade) -> Result<()>;

    /// Install a SASL security layer for all subsequent traffic.
    fn set_message_wrapper(&mut self, wrapper: Box<dyn SecurityLayer>);

    fn is_encrypted(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Messages for one id, pulled one at a time. Ends after the first message
/// carrying an LDAPResult, or after an error.
pub struct Messages<'a> {
    channel: &'a mut dyn MessageChannel,
    id: i32,
    finished: bool,
}

impl<'a> Messages<'a> {
    pub fn new(channel: &'a mut dyn MessageChannel, id: i32) -> Self {
        Self {
            channel,
            id,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<LdapMessage>> {
        if self.finished {
            return None;
        }
        let message = self.channel.get_message(Some(self.id)).await;
        self.finished = match &message {
            Ok(m) => m.op.result().is_some(),
            Err(_) => true,
        };
        Some(message)
    }
}

pub struct Queue {
    transport: Transport,
    buffer: BytesMut,
    wrapped: BytesMut,
    wrapper: Option<Box<dyn SecurityLayer>>,
}

impl Queue {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            wrapped: BytesMut::new(),
            wrapper: None,
        }
    }

    /// Pop one complete frame from the plain buffer, if available.
    fn take_frame(&mut self) -> Result<Option<BytesMut>> {
        match peek_frame_length(&self.buffer)? {
            Some(len) if self.buffer.len() >= len => Ok(Some(self.buffer.split_to(len))),
            _ => Ok(None),
        }
    }

    /// Move fully received SASL buffers from `wrapped` into `buffer`.
    fn unwrap_pending(&mut self) -> Result<()> {
        let Some(wrapper) = self.wrapper.as_mut() else {
            return Ok(());
        };
        while self.wrapped.len() >= 4 {
            let len = u32::from_be_bytes([self.wrapped[0], self.wrapped[1], self.wrapped[2], self.wrapped[3]]) as usize;
            if len > crate::ber::MAX_FRAME_LENGTH {
                return Err(LdapError::protocol(format!("SASL buffer of {} bytes exceeds limit", len)));
            }
            if self.wrapped.len() < 4 + len {
                break;
            }
            self.wrapped.advance(4);
            let sealed = self.wrapped.split_to(len);
            let plain = wrapper.unwrap(&sealed)?;
            self.buffer.extend_from_slice(&plain);
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self
            .transport
            .read(&mut chunk)
            .await
            .map_err(|e| LdapError::connection(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(LdapError::connection("connection closed by peer"));
        }
        if self.wrapper.is_some() {
            self.wrapped.extend_from_slice(&chunk[..n]);
            self.unwrap_pending()
        } else {
            self.buffer.extend_from_slice(&chunk[..n]);
            Ok(())
        }
    }

    async fn read_frame(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            self.transport
                .write_all(chunk)
                .await
                .map_err(|e| LdapError::connection(format!("write failed: {}", e)))?;
        }
        self.transport
            .flush()
            .await
            .map_err(|e| LdapError::connection(format!("flush failed: {}", e)))
    }
}

fn unsolicited(message: &LdapMessage) -> Option<LdapError> {
    if message.message_id != 0 {
        return None;
    }
    match &message.op {
        ProtocolOp::ExtendedResponse(resp) => Some(LdapError::UnsolicitedNotification {
            name: resp.name.clone().unwrap_or_default(),
            code: resp.result.code,
            message: resp.result.diagnostic_message.clone(),
        }),
        _ => None,
    }
}

#[async_trait]
impl MessageChannel for Queue {
    async fn send_message(&mut self, messages: &[LdapMessage]) -> Result<()> {
        let mut data = Vec::new();
        for message in messages {
            data.extend_from_slice(&message.encode()?);
        }
        if let Some(wrapper) = self.wrapper.as_mut() {
            let sealed = wrapper.wrap(&data)?;
            let len = u32::try_from(sealed.len()).map_err(|_| LdapError::Encode("SASL buffer too large".into()))?;
            let mut framed = Vec::with_capacity(4 + sealed.len());
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(&sealed);
            data = framed;
        }
        self.write_all(&data).await
    }

    async fn get_message(&mut self, id: Option<i32>) -> Result<LdapMessage> {
        let frame = self.read_frame().await?;
        let message = LdapMessage::decode(&frame)?;
        if let Some(err) = unsolicited(&message) {
            warn!("Received unsolicited notification: {}", err);
            return Err(err);
        }
        if let Some(expected) = id {
            if message.message_id != expected {
                return Err(LdapError::protocol(format!(
                    "expected message id {}, received {}",
                    expected, message.message_id
                )));
            }
        }
        debug!("Received {} (id {})", message.op.name(), message.message_id);
        Ok(message)
    }

    async fn encrypt(&mut self, upgrade: TlsUpgrade) -> Result<()> {
        if self.transport.is_encrypted() {
            return Err(LdapError::operation(crate::result_code::OPERATIONS_ERROR, "already encrypted"));
        }
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);
        self.transport = transport.upgrade(upgrade).await?;
        self.buffer.clear();
        debug!("Transport upgraded to TLS");
        Ok(())
    }

    fn set_message_wrapper(&mut self, wrapper: Box<dyn SecurityLayer>) {
        self.wrapper = Some(wrapper);
    }

    fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    fn is_connected(&self) -> bool {
        !self.transport.is_closed()
    }

    async fn close(&mut self) -> Result<()> {
        if self.transport.is_closed() {
            return Ok(());
        }
        let _ = self.transport.shutdown().await;
        self.transport = Transport::Closed;
        self.buffer.clear();
        self.wrapped.clear();
        self.wrapper = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExtendedResponse, NOTICE_OF_DISCONNECTION_OID};
    use crate::result_code;

    fn pair() -> (Queue, Queue) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Queue::new(Transport::memory(a)), Queue::new(Transport::memory(b)))
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let (mut client, mut server) = pair();
        client
            .send_message(&[
                LdapMessage::new(1, ProtocolOp::DeleteRequest("cn=a".into())),
                LdapMessage::new(2, ProtocolOp::UnbindRequest),
            ])
            .await
            .unwrap();
        assert_eq!(server.get_message(Some(1)).await.unwrap().message_id, 1);
        assert_eq!(server.get_message(None).await.unwrap().op, ProtocolOp::UnbindRequest);
    }

    #[tokio::test]
    async fn test_messages_stop_at_terminal_response() {
        let (mut client, mut server) = pair();
        server
            .send_message(&[
                LdapMessage::new(3, ProtocolOp::SearchResultEntry(crate::entry::Entry::new("cn=a"))),
                LdapMessage::new(3, ProtocolOp::SearchResultDone(crate::protocol::LdapResult::success())),
                LdapMessage::new(4, ProtocolOp::DeleteResponse(crate::protocol::LdapResult::success())),
            ])
            .await
            .unwrap();
        let mut messages = Messages::new(&mut client, 3);
        assert!(matches!(messages.next().await, Some(Ok(_))));
        assert!(matches!(messages.next().await, Some(Ok(ref m)) if m.op.result().is_some()));
        assert!(messages.next().await.is_none());
        assert_eq!(client.get_message(Some(4)).await.unwrap().message_id, 4);
    }

    #[tokio::test]
    async fn test_id_mismatch_is_protocol_error() {
        let (mut client, mut server) = pair();
        client.send_message(&[LdapMessage::new(5, ProtocolOp::UnbindRequest)]).await.unwrap();
        assert!(matches!(server.get_message(Some(4)).await, Err(LdapError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_unsolicited_notification() {
        let (mut client, mut server) = pair();
        let notice = ExtendedResponse::notice_of_disconnection(result_code::UNAVAILABLE, "shutting down");
        server
            .send_message(&[LdapMessage::new(0, ProtocolOp::ExtendedResponse(notice))])
            .await
            .unwrap();
        match client.get_message(Some(1)).await {
            Err(LdapError::UnsolicitedNotification { name, code, .. }) => {
                assert_eq!(name, NOTICE_OF_DISCONNECTION_OID);
                assert_eq!(code, result_code::UNAVAILABLE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_message_spans_chunks() {
        let (mut client, mut server) = pair();
        let dn = "x".repeat(WRITE_CHUNK_SIZE * 2);
        let reader = tokio::spawn(async move { server.get_message(None).await });
        client
            .send_message(&[LdapMessage::new(1, ProtocolOp::DeleteRequest(dn.clone()))])
            .await
            .unwrap();
        let message = reader.await.unwrap().unwrap();
        assert_eq!(message.op, ProtocolOp::DeleteRequest(dn));
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_error() {
        let (mut client, mut server) = pair();
        server.close().await.unwrap();
        server.close().await.unwrap();
        assert!(!server.is_connected());
        drop(server);
        assert!(client.get_message(None).await.unwrap_err().is_connection_error());
    }

    struct Xor;

    impl SecurityLayer for Xor {
        fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().map(|b| b ^ 0x5A).collect())
        }

        fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            self.wrap(data)
        }
    }

    #[tokio::test]
    async fn test_security_layer_wraps_traffic() {
        let (mut client, mut server) = pair();
        client.set_message_wrapper(Box::new(Xor));
        server.set_message_wrapper(Box::new(Xor));
        client
            .send_message(&[LdapMessage::new(3, ProtocolOp::AbandonRequest(2))])
            .await
            .unwrap();
        let message = server.get_message(Some(3)).await.unwrap();
        assert_eq!(message.op, ProtocolOp::AbandonRequest(2));
    }
}
