// SASL bind negotiation (RFC 4513 section 5.2.1).

use super::basic;
use crate::error::{LdapError, Result};
use crate::protocol::{BindRequest, LdapMessage, ProtocolOp};
use crate::queue::MessageChannel;
use crate::result_code;
use crate::sasl::SaslMechanism;
use tracing::debug;

/// Where the negotiation stands between round trips.
enum SaslState {
    /// Nothing sent yet.
    Start,
    /// The server answered bind-in-progress with these credentials.
    AwaitingChallenge(Option<Vec<u8>>),
    Complete(LdapMessage),
    Failed(LdapError),
}

impl SaslState {
    /// State after the server's answer to one round.
    fn after(response: LdapMessage, mechanism: &mut dyn SaslMechanism) -> Result<Self> {
        let ProtocolOp::BindResponse(bind) = &response.op else {
            return Ok(SaslState::Failed(LdapError::protocol(
                "SASL bind answered without a bind response",
            )));
        };
        match bind.result.code {
            result_code::SUCCESS => {
                if let Some(creds) = bind.server_sasl_creds.as_deref() {
                    if !mechanism.is_complete() {
                        mechanism.challenge(Some(creds))?;
                    }
                }
                Ok(SaslState::Complete(response))
            }
            result_code::SASL_BIND_IN_PROGRESS if mechanism.is_complete() => Ok(SaslState::Complete(response)),
            result_code::SASL_BIND_IN_PROGRESS => Ok(SaslState::AwaitingChallenge(bind.server_sasl_creds.clone())),
            code => Ok(SaslState::Failed(LdapError::Bind {
                code,
                message: bind.result.diagnostic_message.clone(),
            })),
        }
    }
}

/// Drives the challenge/response exchange until the server reports a
/// terminal code or the mechanism completes. `next_id` allocates one message
/// id per round trip.
///
/// A success installs the mechanism's security layer, if any. A mechanism
/// that finishes while the server still reports bind-in-progress returns
/// that last response unchanged.
pub async fn bind(
    channel: &mut dyn MessageChannel,
    next_id: &mut (dyn FnMut() -> i32 + Send),
    name: &str,
    mechanism: &mut dyn SaslMechanism,
) -> Result<LdapMessage> {
    let mut state = SaslState::Start;
    loop {
        let credentials = match state {
            SaslState::Start => mechanism.initial_response()?,
            SaslState::AwaitingChallenge(server) => {
                debug!("SASL {} challenge received", mechanism.name());
                mechanism.challenge(server.as_deref())?
            }
            SaslState::Complete(response) => {
                let succeeded = response.op.result().is_some_and(|r| r.is_success());
                if succeeded {
                    if let Some(layer) = mechanism.take_security_layer() {
                        debug!("Installing SASL {} security layer", mechanism.name());
                        channel.set_message_wrapper(layer);
                    }
                }
                return Ok(response);
            }
            SaslState::Failed(e) => return Err(e),
        };
        let request = BindRequest {
            name: name.to_string(),
            ..BindRequest::sasl(mechanism.name(), credentials)
        };
        let message = LdapMessage::new(next_id(), ProtocolOp::BindRequest(request));
        state = match basic::send(channel, message).await {
            Ok(response) => SaslState::after(response, mechanism)?,
            Err(e) => SaslState::Failed(e),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BindAuthentication, BindResponse, LdapResult};
    use crate::sasl::{Plain, SecurityLayer};
    use crate::testing::ScriptedChannel;

    fn bind_response(id: i32, code: u32, creds: Option<&[u8]>) -> LdapMessage {
        LdapMessage::new(
            id,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(code, ""),
                server_sasl_creds: creds.map(<[u8]>::to_vec),
            }),
        )
    }

    fn counter() -> impl FnMut() -> i32 + Send {
        let mut id = 0;
        move || {
            id += 1;
            id
        }
    }

    /// Two rounds: answers the challenge by echoing it reversed, then
    /// negotiates a no-op security layer.
    struct Echo {
        rounds: usize,
    }

    struct Identity;

    impl SecurityLayer for Identity {
        fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    impl SaslMechanism for Echo {
        fn name(&self) -> &str {
            "X-ECHO"
        }
        fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
            self.rounds = 1;
            Ok(None)
        }
        fn challenge(&mut self, server: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
            self.rounds += 1;
            let mut reply = server.unwrap_or_default().to_vec();
            reply.reverse();
            Ok(Some(reply))
        }
        fn is_complete(&self) -> bool {
            self.rounds >= 2
        }
        fn take_security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
            Some(Box::new(Identity))
        }
    }

    #[tokio::test]
    async fn test_plain_single_round() {
        let (mut channel, handle) = ScriptedChannel::new(vec![bind_response(1, result_code::SUCCESS, None)]);
        let mut plain = Plain::new("alice", "secret");
        bind(&mut channel, &mut counter(), "", &mut plain).await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        let ProtocolOp::BindRequest(request) = &sent[0].op else {
            panic!("expected bind");
        };
        assert_eq!(
            request.authentication,
            BindAuthentication::Sasl {
                mechanism: "PLAIN".into(),
                credentials: Some(b"\0alice\0secret".to_vec()),
            }
        );
        assert!(!handle.is_wrapped());
    }

    #[tokio::test]
    async fn test_challenge_loop_and_security_layer() {
        let (mut channel, handle) = ScriptedChannel::new(vec![
            bind_response(1, result_code::SASL_BIND_IN_PROGRESS, Some(b"abc")),
            bind_response(2, result_code::SUCCESS, None),
        ]);
        let mut mechanism = Echo { rounds: 0 };
        bind(&mut channel, &mut counter(), "", &mut mechanism).await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message_id, 2);
        let ProtocolOp::BindRequest(request) = &sent[1].op else {
            panic!("expected bind");
        };
        assert_eq!(
            request.authentication,
            BindAuthentication::Sasl {
                mechanism: "X-ECHO".into(),
                credentials: Some(b"cba".to_vec()),
            }
        );
        assert!(handle.is_wrapped());
    }

    #[tokio::test]
    async fn test_stops_when_mechanism_completes() {
        let (mut channel, handle) = ScriptedChannel::new(vec![
            bind_response(1, result_code::SASL_BIND_IN_PROGRESS, Some(b"x")),
            bind_response(2, result_code::SUCCESS, None),
        ]);
        let mut plain = Plain::new("alice", "secret");
        let response = bind(&mut channel, &mut counter(), "", &mut plain).await.unwrap();
        assert_eq!(response.op.result().unwrap().code, result_code::SASL_BIND_IN_PROGRESS);
        assert_eq!(handle.sent().len(), 1);
        assert_eq!(handle.unread(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_bind_error() {
        let (mut channel, _) = ScriptedChannel::new(vec![bind_response(1, result_code::INVALID_CREDENTIALS, None)]);
        let mut plain = Plain::new("alice", "wrong");
        let err = bind(&mut channel, &mut counter(), "", &mut plain).await.unwrap_err();
        assert!(matches!(err, LdapError::Bind { code: 49, .. }));
    }

    #[tokio::test]
    async fn test_failure_after_challenge_ends_negotiation() {
        let (mut channel, handle) = ScriptedChannel::new(vec![
            bind_response(1, result_code::SASL_BIND_IN_PROGRESS, Some(b"abc")),
            bind_response(2, result_code::INVALID_CREDENTIALS, None),
        ]);
        let mut mechanism = Echo { rounds: 0 };
        let err = bind(&mut channel, &mut counter(), "", &mut mechanism).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::INVALID_CREDENTIALS));
        assert_eq!(handle.sent().len(), 2);
        assert!(!handle.is_wrapped());
    }
}
