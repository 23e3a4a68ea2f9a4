// Single-response operations handed to the request handler.

use super::handler::{RequestContext, RequestHandler};
use crate::error::{LdapError, Result};
use crate::protocol::{LdapMessage, LdapResult, ProtocolOp};
use crate::queue::MessageChannel;
use crate::result_code;

/// Runs add, compare, delete, modify, modify DN or an extended operation
/// and sends its one response. Returns the result code sent.
pub(super) async fn dispatch(
    channel: &mut dyn MessageChannel,
    handler: &dyn RequestHandler,
    op: &ProtocolOp,
    context: &RequestContext,
) -> Result<u32> {
    let response = match op {
        ProtocolOp::AddRequest(request) => ProtocolOp::AddResponse(handler.add(request.clone(), context).await?),
        ProtocolOp::DeleteRequest(dn) => ProtocolOp::DeleteResponse(handler.delete(dn.clone(), context).await?),
        ProtocolOp::ModifyRequest(request) => {
            ProtocolOp::ModifyResponse(handler.modify(request.clone(), context).await?)
        }
        ProtocolOp::ModifyDnRequest(request) => {
            ProtocolOp::ModifyDnResponse(handler.modify_dn(request.clone(), context).await?)
        }
        ProtocolOp::CompareRequest(request) => {
            let code = if handler.compare(request, context).await? {
                result_code::COMPARE_TRUE
            } else {
                result_code::COMPARE_FALSE
            };
            ProtocolOp::CompareResponse(LdapResult::new(code, ""))
        }
        ProtocolOp::ExtendedRequest(request) => {
            ProtocolOp::ExtendedResponse(handler.extended(request.clone(), context).await?)
        }
        other => {
            return Err(LdapError::operation(
                result_code::PROTOCOL_ERROR,
                format!("The {} operation is not supported.", other.name()),
            ))
        }
    };
    let code = response.result().map(|r| r.code).unwrap_or(result_code::SUCCESS);
    channel
        .send_message(&[LdapMessage::new(context.message_id, response)])
        .await?;
    Ok(code)
}
