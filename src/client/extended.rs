// Extended operations: typed response mapping and StartTLS.

use super::basic;
use crate::error::{LdapError, Result};
use crate::protocol::{map_extended_response, ExtendedRequest, LdapMessage, ProtocolOp};
use crate::queue::MessageChannel;
use crate::transport::TlsUpgrade;
use tracing::info;

/// Sends an extended request and converts the response to the typed
/// operation registered for the request name.
pub async fn send(channel: &mut dyn MessageChannel, request: LdapMessage) -> Result<LdapMessage> {
    let name = match &request.op {
        ProtocolOp::ExtendedRequest(ExtendedRequest { name, .. }) => name.clone(),
        other => return Err(LdapError::protocol(format!("{} is not an extended request", other.name()))),
    };
    let mut response = basic::send(channel, request).await?;
    response.op = map_extended_response(&name, response.op)?;
    Ok(response)
}

/// Sends the StartTLS request and upgrades the channel on success. Any
/// other result leaves the connection unusable.
pub async fn start_tls(
    channel: &mut dyn MessageChannel,
    request: LdapMessage,
    upgrade: TlsUpgrade,
) -> Result<LdapMessage> {
    if channel.is_encrypted() {
        return Err(LdapError::connection("the connection is already encrypted"));
    }
    let id = request.message_id;
    channel.send_message(std::slice::from_ref(&request)).await?;
    let response = channel.get_message(Some(id)).await?;
    match response.op.result() {
        Some(result) if result.is_success() => {}
        Some(result) => {
            return Err(LdapError::connection(format!(
                "StartTLS rejected: {} (result code {})",
                result.diagnostic_message, result.code
            )))
        }
        None => return Err(LdapError::connection(format!("StartTLS answered with {}", response.op.name()))),
    }
    channel.encrypt(upgrade).await?;
    info!("StartTLS negotiated");
    Ok(response)
}
