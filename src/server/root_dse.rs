// RootDSE synthesis (RFC 4512 section 5.1).

use super::handler::{Handlers, RequestContext};
use super::search::result_stream;
use crate::config::ServerOptions;
use crate::control::PAGING_OID;
use crate::entry::{Attribute, Entry};
use crate::error::Result;
use crate::protocol::{LdapResult, SearchRequest, START_TLS_OID, WHOAMI_OID};
use crate::queue::MessageChannel;
use crate::result_code;

pub const SUPPORTED_SASL_MECHANISMS: [&str; 1] = ["PLAIN"];

/// The RootDSE as advertised by this server, before any customization.
pub fn build(options: &ServerOptions, paging: bool) -> Entry {
    let mut extensions = vec![WHOAMI_OID];
    if options.has_certificate() && !options.is_ldaps() {
        extensions.push(START_TLS_OID);
    }
    let mut attributes = vec![
        Attribute::from_strs("objectClass", &["top"]),
        Attribute::from_strs("supportedLDAPVersion", &["3"]),
        Attribute::from_strs("supportedExtension", extensions.as_slice()),
        Attribute::from_strs("supportedSASLMechanisms", &SUPPORTED_SASL_MECHANISMS),
        Attribute::from_strs("vendorName", &[options.dse_vendor_name.as_str()]),
        Attribute::from_strs("vendorVersion", &[options.dse_vendor_version.as_str()]),
    ];
    if !options.dse_naming_contexts.is_empty() {
        attributes.push(Attribute::from_strs(
            "namingContexts",
            options.dse_naming_contexts.as_slice(),
        ));
    }
    if paging {
        attributes.push(Attribute::from_strs("supportedControl", &[PAGING_OID]));
    }
    Entry::with_attributes("", attributes)
}

/// Every RootDSE attribute is operational, so `+` selects all of them.
fn requested_attributes(request: &SearchRequest) -> Vec<String> {
    if request.attributes.iter().any(|a| a == "+") {
        return Vec::new();
    }
    request.attributes.clone()
}

pub(super) async fn send(
    channel: &mut dyn MessageChannel,
    options: &ServerOptions,
    handlers: &Handlers,
    request: &SearchRequest,
    context: &RequestContext,
) -> Result<u32> {
    // The hook sees the filtered entry and may add attributes of its own.
    let mut entry =
        build(options, handlers.paging.is_some()).filtered(&requested_attributes(request), request.types_only);
    if let Some(hook) = &handlers.root_dse {
        entry = hook.root_dse(entry, request, context).await?;
    }
    let messages = result_stream(
        context.message_id,
        vec![entry],
        Vec::new(),
        LdapResult::success(),
        Vec::new(),
    );
    channel.send_message(&messages).await?;
    Ok(result_code::SUCCESS)
}
