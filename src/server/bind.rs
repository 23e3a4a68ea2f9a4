// Bind authentication (RFC 4513): simple, anonymous and SASL PLAIN.

use super::handler::{RequestContext, RequestHandler, Token};
use crate::config::ServerOptions;
use crate::error::{LdapError, Result};
use crate::protocol::{BindAuthentication, BindRequest};
use crate::result_code;
use crate::sasl::decode_plain;
use tracing::debug;

/// Authenticates a bind request. Errors are Operation errors carrying the
/// result code for the BindResponse.
pub(super) async fn authenticate(
    handler: &dyn RequestHandler,
    options: &ServerOptions,
    request: &BindRequest,
    context: &RequestContext,
) -> Result<Token> {
    if request.version != 3 {
        return Err(LdapError::operation(
            result_code::PROTOCOL_ERROR,
            format!("LDAP version {} is not supported.", request.version),
        ));
    }
    match &request.authentication {
        BindAuthentication::Simple(_) if request.is_anonymous() => {
            if !options.allow_anonymous {
                return Err(LdapError::operation(
                    result_code::INAPPROPRIATE_AUTHENTICATION,
                    "Anonymous binds are not allowed.",
                ));
            }
            debug!("Anonymous bind from {}", context.peer);
            Ok(Token::Anonymous)
        }
        BindAuthentication::Simple(password) if password.is_empty() => Err(LdapError::operation(
            result_code::UNWILLING_TO_PERFORM,
            "Unauthenticated binds are not allowed.",
        )),
        BindAuthentication::Simple(_) => handler.bind(request, context).await,
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } if mechanism.eq_ignore_ascii_case("PLAIN") => {
            let plain = decode_plain(credentials.as_deref().unwrap_or_default())
                .map_err(|e| LdapError::operation(result_code::INVALID_CREDENTIALS, e.to_string()))?;
            if !plain.authzid.is_empty() && plain.authzid != plain.username {
                return Err(LdapError::operation(
                    result_code::INSUFFICIENT_ACCESS_RIGHTS,
                    "Acting as another identity is not supported.",
                ));
            }
            handler
                .bind(&BindRequest::simple(plain.username, plain.password), context)
                .await
        }
        BindAuthentication::Sasl { mechanism, .. } => Err(LdapError::operation(
            result_code::AUTH_METHOD_NOT_SUPPORTED,
            format!("The SASL mechanism {} is not supported.", mechanism),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SearchRequest;
    use crate::sasl::{Plain, SaslMechanism};
    use crate::server::handler::SearchOutcome;
    use async_trait::async_trait;

    /// Accepts foo/bar only.
    struct Users;

    #[async_trait]
    impl RequestHandler for Users {
        async fn bind(&self, request: &BindRequest, _context: &RequestContext) -> Result<Token> {
            match (&request.name[..], &request.authentication) {
                ("foo", BindAuthentication::Simple(pw)) if pw == b"bar" => Ok(Token::bound("foo")),
                _ => Err(LdapError::operation(result_code::INVALID_CREDENTIALS, "Invalid credentials.")),
            }
        }

        async fn search(&self, _request: &SearchRequest, _context: &RequestContext) -> Result<SearchOutcome> {
            Ok(SearchOutcome::default())
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            message_id: 1,
            controls: vec![],
            token: Token::Anonymous,
            peer: "test".into(),
            encrypted: false,
        }
    }

    async fn run(options: &ServerOptions, request: BindRequest) -> Result<Token> {
        authenticate(&Users, options, &request, &context()).await
    }

    #[tokio::test]
    async fn test_simple_bind() {
        let options = ServerOptions::default();
        assert_eq!(run(&options, BindRequest::simple("foo", "bar")).await.unwrap(), Token::bound("foo"));
        let err = run(&options, BindRequest::simple("foo", "nope")).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::INVALID_CREDENTIALS));
        let err = run(&options, BindRequest::simple("foo", "")).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::UNWILLING_TO_PERFORM));
    }

    #[tokio::test]
    async fn test_version_must_be_three() {
        let mut request = BindRequest::simple("foo", "bar");
        request.version = 2;
        let err = run(&ServerOptions::default(), request).await.unwrap_err();
        assert_eq!(err.code(), Some(result_code::PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn test_anonymous_toggle() {
        let denied = run(&ServerOptions::default(), BindRequest::anonymous()).await.unwrap_err();
        assert_eq!(denied.code(), Some(result_code::INAPPROPRIATE_AUTHENTICATION));
        let options = ServerOptions {
            allow_anonymous: true,
            ..Default::default()
        };
        assert_eq!(run(&options, BindRequest::anonymous()).await.unwrap(), Token::Anonymous);
    }

    #[tokio::test]
    async fn test_sasl_plain_and_unknown_mechanism() {
        let credentials = Plain::new("foo", "bar").initial_response().unwrap();
        let token = run(&ServerOptions::default(), BindRequest::sasl("PLAIN", credentials))
            .await
            .unwrap();
        assert_eq!(token.authz_id(), "u:foo");

        let err = run(&ServerOptions::default(), BindRequest::sasl("PLAIN", Some(b"garbage".to_vec())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(result_code::INVALID_CREDENTIALS));

        let err = run(&ServerOptions::default(), BindRequest::sasl("GSSAPI", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(result_code::AUTH_METHOD_NOT_SUPPORTED));
    }
}
