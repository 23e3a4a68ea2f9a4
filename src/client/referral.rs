//! Referral chasing.
//!
//! Each referral URL is tried in order on a fresh connection. The
//! [`ReferralContext`] travels with the operation so every hop shares one
//! visited set and one hop counter; revisiting a URL is skipped and going
//! past `referral_limit` hops is fatal.

use super::{ClientProtocol, LdapClient, SearchCallbacks};
use crate::config::ClientOptions;
use crate::control::Control;
use crate::error::{LdapError, Result};
use crate::filter::Filter;
use crate::protocol::{BindRequest, LdapMessage, ProtocolOp, SearchScope};
use crate::result_code;
use crate::url::LdapUrl;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
pub struct ReferralContext {
    visited: HashSet<String>,
    count: usize,
}

impl ReferralContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive.
    pub fn has_referral(&self, url: &str) -> bool {
        self.visited.contains(&url.to_ascii_lowercase())
    }

    pub fn add_referral(&mut self, url: &str) {
        self.visited.insert(url.to_ascii_lowercase());
        self.count += 1;
    }

    /// Number of referrals chased so far.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Decides how each referral hop is made.
#[async_trait]
pub trait ReferralChaser: Send + Sync {
    /// Bind request for the new connection, or None to stay anonymous.
    /// Returning `LdapError::SkipReferral` moves on to the next URL.
    async fn chase(&self, request: &ProtocolOp, url: &LdapUrl, bind: Option<&BindRequest>) -> Result<Option<BindRequest>>;

    /// Client used for the hop.
    async fn client(&self, options: ClientOptions) -> Result<LdapClient> {
        LdapClient::new(options)
    }
}

/// Re-binds with the credentials of the original connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChaser;

#[async_trait]
impl ReferralChaser for DefaultChaser {
    async fn chase(&self, _request: &ProtocolOp, _url: &LdapUrl, bind: Option<&BindRequest>) -> Result<Option<BindRequest>> {
        Ok(bind.cloned())
    }
}

/// LDAP URL scope names mapped onto the request scope.
fn remap_scope(scope: &str) -> SearchScope {
    match scope {
        "sub" => SearchScope::WholeSubtree,
        "base" => SearchScope::SingleLevel,
        _ => SearchScope::BaseObject,
    }
}

/// Copy of the request retargeted at the URL's DN, scope and filter.
pub fn retarget(request: &ProtocolOp, url: &LdapUrl) -> Result<ProtocolOp> {
    let mut op = request.clone();
    let Some(dn) = url.dn.clone() else {
        if let ProtocolOp::SearchRequest(search) = &mut op {
            apply_search_overrides(search, url)?;
        }
        return Ok(op);
    };
    match &mut op {
        ProtocolOp::SearchRequest(search) => {
            search.base_dn = dn;
            apply_search_overrides(search, url)?;
        }
        ProtocolOp::AddRequest(add) => add.entry.dn = dn,
        ProtocolOp::DeleteRequest(target) => *target = dn,
        ProtocolOp::ModifyRequest(modify) => modify.dn = dn,
        ProtocolOp::ModifyDnRequest(modify_dn) => modify_dn.dn = dn,
        ProtocolOp::CompareRequest(compare) => compare.dn = dn,
        _ => {}
    }
    Ok(op)
}

fn apply_search_overrides(search: &mut crate::protocol::SearchRequest, url: &LdapUrl) -> Result<()> {
    if let Some(scope) = &url.scope {
        search.scope = remap_scope(scope);
    }
    if let Some(filter) = &url.filter {
        search.filter = Filter::parse(filter)?;
    }
    Ok(())
}

/// Tries each URL until one hop yields a response. Connection failures and
/// referrals that could not be resolved further down move on to the next
/// URL; any other error ends the chase. Going past the hop limit is checked
/// before each URL, so a limit hit deeper in the chain stays fatal here too.
#[allow(clippy::too_many_arguments)]
pub(super) async fn follow(
    urls: &[String],
    request: &ProtocolOp,
    controls: &[Control],
    options: &ClientOptions,
    chaser: Arc<dyn ReferralChaser>,
    bind: Option<&BindRequest>,
    context: &mut ReferralContext,
    mut callbacks: Option<&mut SearchCallbacks>,
) -> Result<LdapMessage> {
    let mut last_error = String::from("no referral could be followed");
    for raw in urls {
        if context.has_referral(raw) {
            debug!("Skipping already visited referral {}", raw);
            continue;
        }
        if context.count() >= options.referral_limit {
            return Err(LdapError::operation(
                result_code::REFERRAL,
                format!("referral limit of {} exceeded", options.referral_limit),
            ));
        }
        context.add_referral(raw);

        let url = match LdapUrl::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring invalid referral {}: {}", raw, e);
                last_error = e.diagnostic();
                continue;
            }
        };
        let hop_bind = match chaser.chase(request, &url, bind).await {
            Ok(b) => b,
            Err(LdapError::SkipReferral) => {
                debug!("Chaser skipped referral {}", raw);
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut client = match chaser.client(options.for_referral(&url)).await {
            Ok(client) => client,
            Err(e) if e.is_connection_error() => {
                last_error = e.diagnostic();
                continue;
            }
            Err(e) => return Err(e),
        };
        client.protocol.chaser = chaser.clone();
        let op = retarget(request, &url)?;
        info!("Following referral to {}", url);

        let outcome = hop(
            &mut client.protocol,
            hop_bind,
            op,
            controls,
            context,
            callbacks.as_deref_mut(),
        )
        .await;
        let _ = client.protocol.close().await;
        match outcome {
            Ok(response) => return Ok(response),
            Err(e) if is_unresolved(&e) => {
                warn!("Referral {} failed: {}", raw, e);
                last_error = e.diagnostic();
            }
            Err(e) => return Err(e),
        }
    }
    Err(LdapError::operation(result_code::REFERRAL, last_error))
}

/// Errors after which the remaining URLs are still worth trying.
fn is_unresolved(error: &LdapError) -> bool {
    match error {
        LdapError::Referral { .. } => true,
        LdapError::Operation { code, .. } => *code == result_code::REFERRAL,
        e => e.is_connection_error(),
    }
}

async fn hop(
    protocol: &mut ClientProtocol,
    bind: Option<BindRequest>,
    op: ProtocolOp,
    controls: &[Control],
    context: &mut ReferralContext,
    callbacks: Option<&mut SearchCallbacks>,
) -> Result<LdapMessage> {
    if let Some(bind) = bind {
        if !matches!(op, ProtocolOp::BindRequest(_)) {
            protocol
                .send_with_context(ProtocolOp::BindRequest(bind), Vec::new(), None, context)
                .await?;
        }
    }
    protocol
        .send_with_context(op, controls.to_vec(), callbacks, context)
        .await?
        .ok_or_else(|| LdapError::protocol("referred operation produced no response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferralPolicy;
    use crate::protocol::{BindResponse, DerefAliases, LdapResult, SearchRequest};
    use crate::testing::{ScriptHandle, ScriptedChannel};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Hands out scripted connections per host. Hosts without a script are
    /// unreachable.
    #[derive(Default)]
    struct Hosts {
        scripts: Mutex<HashMap<String, Vec<LdapMessage>>>,
        skip: Vec<String>,
        opened: Mutex<Vec<(String, ScriptHandle)>>,
    }

    impl Hosts {
        fn with(mut self, host: &str, responses: Vec<LdapMessage>) -> Self {
            self.scripts.get_mut().unwrap().insert(host.to_string(), responses);
            self
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().iter().map(|(host, _)| host.clone()).collect()
        }

        fn handle(&self, host: &str) -> ScriptHandle {
            let opened = self.opened.lock().unwrap();
            opened.iter().find(|(h, _)| h == host).map(|(_, handle)| handle.clone()).unwrap()
        }
    }

    #[async_trait]
    impl ReferralChaser for Hosts {
        async fn chase(&self, _request: &ProtocolOp, url: &LdapUrl, bind: Option<&BindRequest>) -> Result<Option<BindRequest>> {
            if self.skip.contains(&url.host) {
                return Err(LdapError::SkipReferral);
            }
            Ok(bind.cloned())
        }

        async fn client(&self, options: ClientOptions) -> Result<LdapClient> {
            let host = options.servers[0].clone();
            let script = self
                .scripts
                .lock()
                .unwrap()
                .remove(&host)
                .ok_or_else(|| LdapError::connection(format!("{} unreachable", host)))?;
            let (channel, handle) = ScriptedChannel::new(script);
            self.opened.lock().unwrap().push((host, handle));
            Ok(LdapClient::with_channel(options, Box::new(channel)))
        }
    }

    fn follow_options() -> ClientOptions {
        ClientOptions {
            referral: ReferralPolicy::Follow,
            ..ClientOptions::new(["origin"])
        }
    }

    fn deleted(id: i32, result: LdapResult) -> LdapMessage {
        LdapMessage::new(id, ProtocolOp::DeleteResponse(result))
    }

    fn bound(id: i32) -> LdapMessage {
        LdapMessage::new(
            id,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            }),
        )
    }

    async fn chase_delete(
        hosts: &Arc<Hosts>,
        urls: &[&str],
        options: &ClientOptions,
        bind: Option<&BindRequest>,
        context: &mut ReferralContext,
    ) -> Result<LdapMessage> {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        let chaser: Arc<dyn ReferralChaser> = hosts.clone();
        let request = ProtocolOp::DeleteRequest("cn=x,dc=origin".into());
        follow(&urls, &request, &[], options, chaser, bind, context, None).await
    }

    #[test]
    fn test_context_is_case_insensitive_and_counts_adds() {
        let mut context = ReferralContext::new();
        assert!(!context.has_referral("ldap://A/dc=x"));
        context.add_referral("ldap://A/dc=x");
        assert!(context.has_referral("LDAP://a/DC=X"));
        context.add_referral("ldap://b/dc=x");
        context.add_referral("ldap://b/dc=x");
        assert_eq!(context.count(), 3);
    }

    #[test]
    fn test_retarget_search() {
        let request = ProtocolOp::SearchRequest(SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::SingleLevel,
            Filter::present("objectClass"),
        ));
        let url = LdapUrl::parse("ldap://b.example.com/ou=people,dc=b??sub?(uid=alice)").unwrap();
        let ProtocolOp::SearchRequest(search) = retarget(&request, &url).unwrap() else {
            panic!("expected search");
        };
        assert_eq!(search.base_dn, "ou=people,dc=b");
        assert_eq!(search.scope, SearchScope::WholeSubtree);
        assert_eq!(search.filter, Filter::equality("uid", "alice"));
        assert_eq!(search.deref_aliases, DerefAliases::Never);

        let base = LdapUrl::parse("ldap://b/dc=b??base").unwrap();
        let ProtocolOp::SearchRequest(search) = retarget(&request, &base).unwrap() else {
            panic!("expected search");
        };
        assert_eq!(search.scope, SearchScope::SingleLevel);
        let one = LdapUrl::parse("ldap://b/dc=b??one").unwrap();
        let ProtocolOp::SearchRequest(search) = retarget(&request, &one).unwrap() else {
            panic!("expected search");
        };
        assert_eq!(search.scope, SearchScope::BaseObject);
    }

    #[test]
    fn test_retarget_keeps_original_untouched() {
        let request = ProtocolOp::DeleteRequest("cn=a,dc=a".into());
        let url = LdapUrl::parse("ldap://b/cn=a,dc=b").unwrap();
        assert_eq!(retarget(&request, &url).unwrap(), ProtocolOp::DeleteRequest("cn=a,dc=b".into()));
        assert_eq!(request, ProtocolOp::DeleteRequest("cn=a,dc=a".into()));
        let no_dn = LdapUrl::parse("ldap://b").unwrap();
        assert_eq!(retarget(&request, &no_dn).unwrap(), request);
    }

    #[tokio::test]
    async fn test_default_chaser_reuses_bind() {
        let bind = BindRequest::simple("cn=admin", "secret");
        let url = LdapUrl::parse("ldap://b").unwrap();
        let chosen = DefaultChaser
            .chase(&ProtocolOp::DeleteRequest("cn=a".into()), &url, Some(&bind))
            .await
            .unwrap();
        assert_eq!(chosen, Some(bind));
    }

    #[tokio::test]
    async fn test_follow_moves_on_when_nested_referral_fails() {
        let hosts = Arc::new(
            Hosts::default()
                .with("a", vec![deleted(1, LdapResult::referral(vec!["ldap://c/cn=x".into()]))])
                .with("b", vec![deleted(1, LdapResult::success())]),
        );
        let mut context = ReferralContext::new();
        let response = chase_delete(
            &hosts,
            &["ldap://a/cn=x", "ldap://b/cn=x"],
            &follow_options(),
            None,
            &mut context,
        )
        .await
        .unwrap();
        assert!(response.op.result().unwrap().is_success());
        assert_eq!(hosts.opened(), vec!["a", "b"]);
        assert!(context.has_referral("ldap://c/cn=x"));
        assert_eq!(context.count(), 3);
        assert_eq!(
            hosts.handle("b").sent()[0].op,
            ProtocolOp::DeleteRequest("cn=x".into())
        );
    }

    #[tokio::test]
    async fn test_follow_moves_on_after_connection_failure() {
        let hosts = Arc::new(Hosts::default().with("b", vec![deleted(1, LdapResult::success())]));
        let mut context = ReferralContext::new();
        let response = chase_delete(
            &hosts,
            &["ldap://a/cn=x", "ldap://b/cn=x"],
            &follow_options(),
            None,
            &mut context,
        )
        .await
        .unwrap();
        assert!(response.op.result().unwrap().is_success());
        assert_eq!(hosts.opened(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_follow_skips_visited_urls() {
        let hosts = Arc::new(
            Hosts::default()
                .with("a", vec![deleted(1, LdapResult::success())])
                .with("b", vec![deleted(1, LdapResult::success())]),
        );
        let mut context = ReferralContext::new();
        context.add_referral("LDAP://A/CN=X");
        chase_delete(
            &hosts,
            &["ldap://a/cn=x", "ldap://b/cn=x"],
            &follow_options(),
            None,
            &mut context,
        )
        .await
        .unwrap();
        assert_eq!(hosts.opened(), vec!["b"]);
        assert_eq!(context.count(), 2);
    }

    #[tokio::test]
    async fn test_follow_skip_referral_moves_on() {
        let mut hosts = Hosts::default()
            .with("a", vec![deleted(1, LdapResult::success())])
            .with("b", vec![deleted(1, LdapResult::success())]);
        hosts.skip.push("a".into());
        let hosts = Arc::new(hosts);
        let mut context = ReferralContext::new();
        chase_delete(
            &hosts,
            &["ldap://a/cn=x", "ldap://b/cn=x"],
            &follow_options(),
            None,
            &mut context,
        )
        .await
        .unwrap();
        assert_eq!(hosts.opened(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_follow_limit_is_fatal() {
        let options = ClientOptions {
            referral_limit: 1,
            ..follow_options()
        };
        let hosts = Arc::new(
            Hosts::default()
                .with("a", vec![deleted(1, LdapResult::referral(vec!["ldap://b/cn=x".into()]))])
                .with("b", vec![deleted(1, LdapResult::success())])
                .with("d", vec![deleted(1, LdapResult::success())]),
        );
        let mut context = ReferralContext::new();
        let err = chase_delete(
            &hosts,
            &["ldap://a/cn=x", "ldap://d/cn=x"],
            &options,
            None,
            &mut context,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(result_code::REFERRAL));
        assert_eq!(err.diagnostic(), "referral limit of 1 exceeded");
        assert_eq!(hosts.opened(), vec!["a"]);

        let mut full = ReferralContext::new();
        full.add_referral("ldap://z");
        let err = chase_delete(&hosts, &["ldap://d/cn=x"], &options, None, &mut full)
            .await
            .unwrap_err();
        assert_eq!(err.diagnostic(), "referral limit of 1 exceeded");
        assert_eq!(hosts.opened(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_follow_exhausted_reports_last_diagnostic() {
        let hosts = Arc::new(Hosts::default());
        let mut context = ReferralContext::new();
        let err = chase_delete(
            &hosts,
            &["http://a/cn=x", "ldap://a/cn=x", "ldap://b/cn=x"],
            &follow_options(),
            None,
            &mut context,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(result_code::REFERRAL));
        assert_eq!(err.diagnostic(), "b unreachable");
        assert!(hosts.opened().is_empty());
    }

    #[tokio::test]
    async fn test_follow_binds_before_request() {
        let bind = BindRequest::simple("cn=admin", "secret");
        let hosts = Arc::new(Hosts::default().with("a", vec![bound(1), deleted(2, LdapResult::success())]));
        let mut context = ReferralContext::new();
        chase_delete(&hosts, &["ldap://a/cn=x"], &follow_options(), Some(&bind), &mut context)
            .await
            .unwrap();
        let sent = hosts.handle("a").sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].op, ProtocolOp::BindRequest(bind));
        assert_eq!(sent[1].op, ProtocolOp::DeleteRequest("cn=x".into()));
        assert!(hosts.handle("a").is_closed());
    }

    #[tokio::test]
    async fn test_follow_does_not_bind_twice_for_bind_request() {
        let bind = BindRequest::simple("cn=admin", "secret");
        let hosts = Arc::new(Hosts::default().with("a", vec![bound(1)]));
        let chaser: Arc<dyn ReferralChaser> = hosts.clone();
        let mut context = ReferralContext::new();
        let request = ProtocolOp::BindRequest(bind.clone());
        follow(
            &["ldap://a".to_string()],
            &request,
            &[],
            &follow_options(),
            chaser,
            Some(&bind),
            &mut context,
            None,
        )
        .await
        .unwrap();
        let sent = hosts.handle("a").sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].op, request);
    }
}
