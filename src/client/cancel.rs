// Cancel operation (RFC 3909).

use crate::error::{LdapError, Result};
use crate::protocol::{map_extended_response, ExtendedRequest, LdapMessage, ProtocolOp, CANCEL_OID};
use crate::queue::MessageChannel;
use crate::result_code;
use tracing::debug;

/// What happens to responses of the operation being cancelled that arrive
/// before the cancel response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelStrategy {
    /// Discard them.
    #[default]
    Stop,
    /// Hand them to the message processor.
    Continue,
}

pub type MessageProcessor = Box<dyn FnMut(LdapMessage) -> Result<()> + Send>;

/// What one incoming message means for the cancel exchange.
enum Step {
    /// A late response of the operation being cancelled.
    Target(LdapMessage),
    /// The cancel response itself.
    Done(LdapMessage),
}

fn step(mut message: LdapMessage, cancel_id: i32, target: i32) -> Result<Step> {
    if message.message_id == target {
        return Ok(Step::Target(message));
    }
    if message.message_id != cancel_id {
        return Err(LdapError::protocol(format!(
            "unexpected message id {} while cancelling {}",
            message.message_id, target
        )));
    }
    message.op = map_extended_response(CANCEL_OID, message.op)?;
    let result = message
        .op
        .result()
        .ok_or_else(|| LdapError::protocol(format!("cancel answered with {}", message.op.name())))?;
    if !matches!(result.code, result_code::CANCELED | result_code::SUCCESS) {
        return Err(LdapError::Operation {
            code: result.code,
            message: result.diagnostic_message.clone(),
            matched_dn: result.matched_dn.clone(),
        });
    }
    Ok(Step::Done(message))
}

/// Sends a cancel for `target` as message `cancel_id` and reads until the
/// cancel response, which must report CANCELED or SUCCESS.
pub async fn cancel(
    channel: &mut dyn MessageChannel,
    cancel_id: i32,
    target: i32,
    strategy: CancelStrategy,
    mut processor: Option<&mut MessageProcessor>,
) -> Result<LdapMessage> {
    let request = LdapMessage::new(cancel_id, ProtocolOp::ExtendedRequest(ExtendedRequest::cancel(target)));
    channel.send_message(std::slice::from_ref(&request)).await?;
    loop {
        let message = channel.get_message(None).await?;
        match step(message, cancel_id, target)? {
            Step::Done(response) => return Ok(response),
            Step::Target(message) => match (strategy, processor.as_deref_mut()) {
                (CancelStrategy::Continue, Some(process)) => process(message)?,
                _ => debug!("Discarding {} of cancelled operation {}", message.op.name(), target),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::protocol::{ExtendedResponse, LdapResult};
    use crate::testing::ScriptedChannel;
    use std::sync::{Arc, Mutex};

    fn script(cancel_code: u32) -> Vec<LdapMessage> {
        vec![
            LdapMessage::new(4, ProtocolOp::SearchResultEntry(Entry::new("cn=a"))),
            LdapMessage::new(4, ProtocolOp::SearchResultDone(LdapResult::new(result_code::CANCELED, ""))),
            LdapMessage::new(
                5,
                ProtocolOp::ExtendedResponse(ExtendedResponse::new(LdapResult::new(cancel_code, ""))),
            ),
        ]
    }

    #[tokio::test]
    async fn test_stop_discards_target_responses() {
        let (mut channel, handle) = ScriptedChannel::new(script(result_code::SUCCESS));
        let response = cancel(&mut channel, 5, 4, CancelStrategy::Stop, None).await.unwrap();
        assert_eq!(response.message_id, 5);
        let sent = handle.sent();
        let ProtocolOp::ExtendedRequest(request) = &sent[0].op else {
            panic!("expected extended request");
        };
        assert_eq!(request.name, CANCEL_OID);
        assert_eq!(request.cancel_id().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_continue_forwards_target_responses() {
        let (mut channel, _) = ScriptedChannel::new(script(result_code::CANCELED));
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let mut processor: MessageProcessor = Box::new(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        cancel(&mut channel, 5, 4, CancelStrategy::Continue, Some(&mut processor))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_too_late_is_an_error() {
        let (mut channel, _) = ScriptedChannel::new(script(result_code::TOO_LATE));
        let err = cancel(&mut channel, 5, 4, CancelStrategy::Stop, None).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::TOO_LATE));
    }

    #[tokio::test]
    async fn test_stray_message_id_is_protocol_error() {
        let (mut channel, _) = ScriptedChannel::new(vec![LdapMessage::new(
            9,
            ProtocolOp::SearchResultEntry(Entry::new("cn=a")),
        )]);
        let err = cancel(&mut channel, 5, 4, CancelStrategy::Stop, None).await.unwrap_err();
        assert!(matches!(err, LdapError::Protocol { .. }));
    }
}
