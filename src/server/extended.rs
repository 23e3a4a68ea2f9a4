// StartTLS and WhoAmI, answered by the server itself.

use super::handler::Token;
use crate::error::{LdapError, Result};
use crate::protocol::{ExtendedResponse, LdapMessage, LdapResult, ProtocolOp, START_TLS_OID};
use crate::queue::MessageChannel;
use crate::result_code;
use crate::transport::TlsUpgrade;
use std::sync::Arc;
use tracing::info;

/// Confirms StartTLS, then performs the server side of the handshake.
pub(super) async fn start_tls(
    channel: &mut dyn MessageChannel,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    message_id: i32,
) -> Result<u32> {
    let Some(config) = tls_config else {
        return Err(LdapError::operation(
            result_code::PROTOCOL_ERROR,
            "StartTLS is not supported: no server certificate is configured.",
        ));
    };
    if channel.is_encrypted() {
        return Err(LdapError::operation(
            result_code::OPERATIONS_ERROR,
            "The connection is already encrypted.",
        ));
    }
    let response = ExtendedResponse {
        name: Some(START_TLS_OID.to_string()),
        ..ExtendedResponse::new(LdapResult::success())
    };
    channel
        .send_message(&[LdapMessage::new(message_id, ProtocolOp::ExtendedResponse(response))])
        .await?;
    channel.encrypt(TlsUpgrade::server(config)).await?;
    info!("Connection upgraded to TLS via StartTLS");
    Ok(result_code::SUCCESS)
}

pub(super) async fn whoami(channel: &mut dyn MessageChannel, token: &Token, message_id: i32) -> Result<u32> {
    let response = ExtendedResponse::whoami(LdapResult::success(), &token.authz_id());
    channel
        .send_message(&[LdapMessage::new(message_id, ProtocolOp::ExtendedResponse(response))])
        .await?;
    Ok(result_code::SUCCESS)
}
