// Single request, single response.

use crate::error::{LdapError, Result};
use crate::protocol::{LdapMessage, LdapResult, ProtocolOp};
use crate::queue::MessageChannel;
use crate::result_code;

/// Maps a terminal result onto the error taxonomy. Codes in the non-error
/// allow-list pass through; bind failures become `LdapError::Bind`.
pub fn check_result(request: &ProtocolOp, result: &LdapResult) -> Result<()> {
    if result_code::is_non_error(result.code) {
        return Ok(());
    }
    if matches!(request, ProtocolOp::BindRequest(_)) {
        return Err(LdapError::Bind {
            code: result.code,
            message: result.diagnostic_message.clone(),
        });
    }
    Err(LdapError::Operation {
        code: result.code,
        message: result.diagnostic_message.clone(),
        matched_dn: result.matched_dn.clone(),
    })
}

/// The response must be the one paired with the request and carry a result.
pub fn check_response(request: &ProtocolOp, response: &LdapMessage) -> Result<()> {
    if let Some(expected) = request.response_for(LdapResult::default()) {
        if expected.tag() != response.op.tag() {
            return Err(LdapError::protocol(format!(
                "expected {} for {} request, received {}",
                expected.name(),
                request.name(),
                response.op.name()
            )));
        }
    }
    let result = response
        .op
        .result()
        .ok_or_else(|| LdapError::protocol(format!("{} carries no result", response.op.name())))?;
    check_result(request, result)
}

pub async fn send(channel: &mut dyn MessageChannel, message: LdapMessage) -> Result<LdapMessage> {
    let id = message.message_id;
    channel.send_message(std::slice::from_ref(&message)).await?;
    let response = channel.get_message(Some(id)).await?;
    check_response(&message.op, &response)?;
    Ok(response)
}

/// Fire-and-forget requests (unbind, abandon).
pub async fn send_only(channel: &mut dyn MessageChannel, message: LdapMessage) -> Result<()> {
    channel.send_message(std::slice::from_ref(&message)).await
}
