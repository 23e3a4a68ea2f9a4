//! LDAPMessage envelope and protocol operations (RFC 4511 section 4.1.1).
//!
//! ```text
//! LDAPMessage ::= SEQUENCE {
//!      messageID       MessageID,
//!      protocolOp      CHOICE { ... },
//!      controls        [0] Controls OPTIONAL }
//! ```

mod extended;
mod request;
mod response;

pub use extended::{
    map_extended_response, PasswordModifyResponse, SyncInfo, WhoAmIResponse, CANCEL_OID,
    NOTICE_OF_DISCONNECTION_OID, PASSWORD_MODIFY_OID, START_TLS_OID, SYNC_INFO_OID, WHOAMI_OID,
};
pub use request::{
    AddRequest, BindAuthentication, BindRequest, CompareRequest, DerefAliases, ExtendedRequest,
    ModifyDnRequest, ModifyOperation, ModifyRequest, Modification, SearchRequest, SearchScope,
};
pub use response::{
    BindResponse, ExtendedResponse, IntermediateResponse, LdapResult, SearchResponse,
};

use crate::ber::{self, application, application_constructed, context_constructed, BerReader, BerResult, BerWriter};
use crate::control::Control;
use crate::entry::Entry;
use crate::error::{LdapError, Result};

pub const BIND_REQUEST: u8 = application_constructed(0);
pub const BIND_RESPONSE: u8 = application_constructed(1);
pub const UNBIND_REQUEST: u8 = application(2);
pub const SEARCH_REQUEST: u8 = application_constructed(3);
pub const SEARCH_RESULT_ENTRY: u8 = application_constructed(4);
pub const SEARCH_RESULT_DONE: u8 = application_constructed(5);
pub const MODIFY_REQUEST: u8 = application_constructed(6);
pub const MODIFY_RESPONSE: u8 = application_constructed(7);
pub const ADD_REQUEST: u8 = application_constructed(8);
pub const ADD_RESPONSE: u8 = application_constructed(9);
pub const DELETE_REQUEST: u8 = application(10);
pub const DELETE_RESPONSE: u8 = application_constructed(11);
pub const MODIFY_DN_REQUEST: u8 = application_constructed(12);
pub const MODIFY_DN_RESPONSE: u8 = application_constructed(13);
pub const COMPARE_REQUEST: u8 = application_constructed(14);
pub const COMPARE_RESPONSE: u8 = application_constructed(15);
pub const ABANDON_REQUEST: u8 = application(16);
pub const SEARCH_RESULT_REFERENCE: u8 = application_constructed(19);
pub const EXTENDED_REQUEST: u8 = application_constructed(23);
pub const EXTENDED_RESPONSE: u8 = application_constructed(24);
pub const INTERMEDIATE_RESPONSE: u8 = application_constructed(25);

const CONTROLS_TAG: u8 = context_constructed(0);

/// Highest valid message id (2^31 - 1).
pub const MAX_MESSAGE_ID: i32 = i32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(Entry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DeleteRequest(String),
    DeleteResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
    /// Client-side only; never encoded.
    SearchResponse(SearchResponse),
    WhoAmIResponse(WhoAmIResponse),
    PasswordModifyResponse(PasswordModifyResponse),
}

impl ProtocolOp {
    /// Operation name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind",
            ProtocolOp::BindResponse(_) => "bind_response",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_) => "search",
            ProtocolOp::SearchResultEntry(_) => "search_entry",
            ProtocolOp::SearchResultReference(_) => "search_reference",
            ProtocolOp::SearchResultDone(_) => "search_done",
            ProtocolOp::ModifyRequest(_) => "modify",
            ProtocolOp::ModifyResponse(_) => "modify_response",
            ProtocolOp::AddRequest(_) => "add",
            ProtocolOp::AddResponse(_) => "add_response",
            ProtocolOp::DeleteRequest(_) => "delete",
            ProtocolOp::DeleteResponse(_) => "delete_response",
            ProtocolOp::ModifyDnRequest(_) => "modify_dn",
            ProtocolOp::ModifyDnResponse(_) => "modify_dn_response",
            ProtocolOp::CompareRequest(_) => "compare",
            ProtocolOp::CompareResponse(_) => "compare_response",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) => "extended",
            ProtocolOp::ExtendedResponse(_) => "extended_response",
            ProtocolOp::IntermediateResponse(_) => "intermediate_response",
            ProtocolOp::SearchResponse(_) => "search_response",
            ProtocolOp::WhoAmIResponse(_) => "whoami_response",
            ProtocolOp::PasswordModifyResponse(_) => "password_modify_response",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => BIND_REQUEST,
            ProtocolOp::BindResponse(_) => BIND_RESPONSE,
            ProtocolOp::UnbindRequest => UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) | ProtocolOp::SearchResponse(_) => SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => ADD_REQUEST,
            ProtocolOp::AddResponse(_) => ADD_RESPONSE,
            ProtocolOp::DeleteRequest(_) => DELETE_REQUEST,
            ProtocolOp::DeleteResponse(_) => DELETE_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_)
            | ProtocolOp::WhoAmIResponse(_)
            | ProtocolOp::PasswordModifyResponse(_) => EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => INTERMEDIATE_RESPONSE,
        }
    }

    /// The LDAPResult of a terminal response, if this is one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DeleteResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResponse(r) => Some(&r.result),
            ProtocolOp::WhoAmIResponse(r) => Some(&r.result),
            ProtocolOp::PasswordModifyResponse(r) => Some(&r.result),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindRequest(_)
                | ProtocolOp::UnbindRequest
                | ProtocolOp::SearchRequest(_)
                | ProtocolOp::ModifyRequest(_)
                | ProtocolOp::AddRequest(_)
                | ProtocolOp::DeleteRequest(_)
                | ProtocolOp::ModifyDnRequest(_)
                | ProtocolOp::CompareRequest(_)
                | ProtocolOp::AbandonRequest(_)
                | ProtocolOp::ExtendedRequest(_)
        )
    }

    /// True for operations that produce no response (unbind, abandon).
    pub fn expects_no_response(&self) -> bool {
        matches!(self, ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_))
    }

    /// Builds the terminal response that pairs with this request, carrying `result`.
    pub fn response_for(&self, result: LdapResult) -> Option<ProtocolOp> {
        Some(match self {
            ProtocolOp::BindRequest(_) => ProtocolOp::BindResponse(BindResponse {
                result,
                server_sasl_creds: None,
            }),
            ProtocolOp::SearchRequest(_) => ProtocolOp::SearchResultDone(result),
            ProtocolOp::ModifyRequest(_) => ProtocolOp::ModifyResponse(result),
            ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(result),
            ProtocolOp::DeleteRequest(_) => ProtocolOp::DeleteResponse(result),
            ProtocolOp::ModifyDnRequest(_) => ProtocolOp::ModifyDnResponse(result),
            ProtocolOp::CompareRequest(_) => ProtocolOp::CompareResponse(result),
            ProtocolOp::ExtendedRequest(_) => ProtocolOp::ExtendedResponse(ExtendedResponse::new(result)),
            _ => return None,
        })
    }

    fn encode(&self, w: &mut BerWriter) -> Result<()> {
        let tag = self.tag();
        match self {
            ProtocolOp::UnbindRequest => w.write_element(tag, &[]),
            ProtocolOp::DeleteRequest(dn) => w.write_element(tag, dn.as_bytes()),
            ProtocolOp::AbandonRequest(id) => w.write_tagged_integer(tag, i64::from(*id)),
            ProtocolOp::SearchResponse(_) => {
                return Err(LdapError::Encode("search response aggregates are not encodable".into()))
            }
            _ => {
                let pos = w.start_constructed(tag);
                match self {
                    ProtocolOp::BindRequest(op) => op.encode(w),
                    ProtocolOp::BindResponse(op) => op.encode(w),
                    ProtocolOp::SearchRequest(op) => op.encode(w),
                    ProtocolOp::SearchResultEntry(entry) => response::encode_entry(entry, w),
                    ProtocolOp::SearchResultReference(urls) => response::encode_urls(urls, w),
                    ProtocolOp::SearchResultDone(r)
                    | ProtocolOp::ModifyResponse(r)
                    | ProtocolOp::AddResponse(r)
                    | ProtocolOp::DeleteResponse(r)
                    | ProtocolOp::ModifyDnResponse(r)
                    | ProtocolOp::CompareResponse(r) => r.encode(w),
                    ProtocolOp::ModifyRequest(op) => op.encode(w),
                    ProtocolOp::AddRequest(op) => op.encode(w),
                    ProtocolOp::ModifyDnRequest(op) => op.encode(w),
                    ProtocolOp::CompareRequest(op) => op.encode(w),
                    ProtocolOp::ExtendedRequest(op) => op.encode(w),
                    ProtocolOp::ExtendedResponse(op) => op.encode(w),
                    ProtocolOp::WhoAmIResponse(op) => {
                        ExtendedResponse::whoami(op.result.clone(), &op.authz_id).encode(w)
                    }
                    ProtocolOp::PasswordModifyResponse(op) => {
                        let value = op.generated_password.as_ref().map(|pw| {
                            let mut inner = BerWriter::new();
                            let seq = inner.start_sequence();
                            inner.write_element(crate::ber::context(0), pw);
                            inner.end_sequence(seq);
                            inner.into_vec()
                        });
                        ExtendedResponse {
                            result: op.result.clone(),
                            name: None,
                            value,
                        }
                        .encode(w)
                    }
                    ProtocolOp::IntermediateResponse(op) => op.encode(w),
                    ProtocolOp::UnbindRequest
                    | ProtocolOp::DeleteRequest(_)
                    | ProtocolOp::AbandonRequest(_)
                    | ProtocolOp::SearchResponse(_) => {}
                }
                w.end_constructed(pos);
            }
        }
        Ok(())
    }
}

type OpDecoder = fn(&[u8]) -> BerResult<ProtocolOp>;

fn decode_bind_request(c: &[u8]) -> BerResult<ProtocolOp> {
    BindRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::BindRequest)
}

fn decode_bind_response(c: &[u8]) -> BerResult<ProtocolOp> {
    BindResponse::decode(&mut BerReader::new(c)).map(ProtocolOp::BindResponse)
}

fn decode_unbind(_: &[u8]) -> BerResult<ProtocolOp> {
    Ok(ProtocolOp::UnbindRequest)
}

fn decode_search_request(c: &[u8]) -> BerResult<ProtocolOp> {
    SearchRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::SearchRequest)
}

fn decode_search_entry(c: &[u8]) -> BerResult<ProtocolOp> {
    response::decode_entry(&mut BerReader::new(c)).map(ProtocolOp::SearchResultEntry)
}

fn decode_search_reference(c: &[u8]) -> BerResult<ProtocolOp> {
    response::decode_urls(&mut BerReader::new(c)).map(ProtocolOp::SearchResultReference)
}

fn decode_search_done(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::SearchResultDone)
}

fn decode_modify_request(c: &[u8]) -> BerResult<ProtocolOp> {
    ModifyRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::ModifyRequest)
}

fn decode_modify_response(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::ModifyResponse)
}

fn decode_add_request(c: &[u8]) -> BerResult<ProtocolOp> {
    AddRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::AddRequest)
}

fn decode_add_response(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::AddResponse)
}

fn decode_delete_request(c: &[u8]) -> BerResult<ProtocolOp> {
    ber::decode_string(c).map(ProtocolOp::DeleteRequest)
}

fn decode_delete_response(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::DeleteResponse)
}

fn decode_modify_dn_request(c: &[u8]) -> BerResult<ProtocolOp> {
    ModifyDnRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::ModifyDnRequest)
}

fn decode_modify_dn_response(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::ModifyDnResponse)
}

fn decode_compare_request(c: &[u8]) -> BerResult<ProtocolOp> {
    CompareRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::CompareRequest)
}

fn decode_compare_response(c: &[u8]) -> BerResult<ProtocolOp> {
    LdapResult::decode(&mut BerReader::new(c)).map(ProtocolOp::CompareResponse)
}

fn decode_abandon(c: &[u8]) -> BerResult<ProtocolOp> {
    let id = ber::decode_integer(c)?;
    i32::try_from(id)
        .map(ProtocolOp::AbandonRequest)
        .map_err(|_| ber::BerError::IntegerTooLarge(8))
}

fn decode_extended_request(c: &[u8]) -> BerResult<ProtocolOp> {
    ExtendedRequest::decode(&mut BerReader::new(c)).map(ProtocolOp::ExtendedRequest)
}

fn decode_extended_response(c: &[u8]) -> BerResult<ProtocolOp> {
    ExtendedResponse::decode(&mut BerReader::new(c)).map(ProtocolOp::ExtendedResponse)
}

fn decode_intermediate(c: &[u8]) -> BerResult<ProtocolOp> {
    IntermediateResponse::decode(&mut BerReader::new(c)).map(ProtocolOp::IntermediateResponse)
}

static OPERATIONS: &[(u8, OpDecoder)] = &[
    (BIND_REQUEST, decode_bind_request),
    (BIND_RESPONSE, decode_bind_response),
    (UNBIND_REQUEST, decode_unbind),
    (SEARCH_REQUEST, decode_search_request),
    (SEARCH_RESULT_ENTRY, decode_search_entry),
    (SEARCH_RESULT_DONE, decode_search_done),
    (SEARCH_RESULT_REFERENCE, decode_search_reference),
    (MODIFY_REQUEST, decode_modify_request),
    (MODIFY_RESPONSE, decode_modify_response),
    (ADD_REQUEST, decode_add_request),
    (ADD_RESPONSE, decode_add_response),
    (DELETE_REQUEST, decode_delete_request),
    (DELETE_RESPONSE, decode_delete_response),
    (MODIFY_DN_REQUEST, decode_modify_dn_request),
    (MODIFY_DN_RESPONSE, decode_modify_dn_response),
    (COMPARE_REQUEST, decode_compare_request),
    (COMPARE_RESPONSE, decode_compare_response),
    (ABANDON_REQUEST, decode_abandon),
    (EXTENDED_REQUEST, decode_extended_request),
    (EXTENDED_RESPONSE, decode_extended_response),
    (INTERMEDIATE_RESPONSE, decode_intermediate),
];

fn decoder_for(tag: u8) -> Option<OpDecoder> {
    OPERATIONS.iter().find(|(t, _)| *t == tag).map(|(_, d)| *d)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn control(&self, oid: &str) -> Option<&Control> {
        crate::control::find(&self.controls, oid)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.message_id < 0 {
            return Err(LdapError::Encode(format!("invalid message id {}", self.message_id)));
        }
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(i64::from(self.message_id));
        self.op.encode(&mut w)?;
        if !self.controls.is_empty() {
            let pos = w.start_constructed(CONTROLS_TAG);
            for control in &self.controls {
                control.encode(&mut w);
            }
            w.end_constructed(pos);
        }
        w.end_sequence(seq);
        Ok(w.into_vec())
    }

    /// Decodes one complete LDAPMessage frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(frame);
        let mut seq = outer.read_sequence()?;
        let id = seq.read_integer()?;
        let message_id = i32::try_from(id)
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| LdapError::protocol(format!("message id {} out of range", id)))?;

        let (tag, content) = seq.read_element()?;
        let decoder =
            decoder_for(tag).ok_or_else(|| LdapError::protocol(format!("unknown protocol operation tag 0x{:02X}", tag)))?;
        let op = decoder(content)?;

        let mut controls = Vec::new();
        if let Some(raw) = seq.read_optional(CONTROLS_TAG)? {
            let mut list = BerReader::new(raw);
            while !list.is_empty() {
                controls.push(Control::decode(&mut list)?);
            }
        }
        Ok(Self {
            message_id,
            op,
            controls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PAGING_OID;
    use crate::filter::Filter;
    use crate::result_code;

    #[test]
    fn test_unbind_wire_form() {
        let bytes = LdapMessage::new(3, ProtocolOp::UnbindRequest).encode().unwrap();
        assert_eq!(bytes, vec![0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);
        let decoded = LdapMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.op, ProtocolOp::UnbindRequest);
        assert_eq!(decoded.message_id, 3);
    }

    #[test]
    fn test_abandon_and_delete_are_primitive() {
        let bytes = LdapMessage::new(1, ProtocolOp::AbandonRequest(9)).encode().unwrap();
        assert_eq!(&bytes[5..], &[0x50, 0x01, 0x09]);
        let bytes = LdapMessage::new(1, ProtocolOp::DeleteRequest("cn=x".into())).encode().unwrap();
        assert_eq!(&bytes[5..7], &[0x4A, 0x04]);
        assert_eq!(
            LdapMessage::decode(&bytes).unwrap().op,
            ProtocolOp::DeleteRequest("cn=x".into())
        );
    }

    #[test]
    fn test_search_with_paging_control() {
        let msg = LdapMessage::new(
            2,
            ProtocolOp::SearchRequest(SearchRequest::new("dc=x", SearchScope::WholeSubtree, Filter::present("cn"))),
        )
        .with_controls(vec![Control::paging(100, Vec::new(), false)]);
        let bytes = msg.encode().unwrap();
        let decoded = LdapMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.control(PAGING_OID).and_then(|c| c.as_paging()).map(|p| p.size), Some(100));
    }

    #[test]
    fn test_intermediate_response_tag() {
        let msg = LdapMessage::new(4, ProtocolOp::IntermediateResponse(IntermediateResponse::default()));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[5], 0x79);
        let reference = LdapMessage::new(4, ProtocolOp::SearchResultReference(vec!["ldap://h/".into()]));
        assert_eq!(reference.encode().unwrap()[5], 0x73);
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let bytes = [0x30, 0x05, 0x02, 0x01, 0x01, 0x7E, 0x00];
        assert!(matches!(LdapMessage::decode(&bytes), Err(LdapError::Protocol { .. })));
    }

    #[test]
    fn test_negative_message_id_rejected() {
        let bytes = [0x30, 0x05, 0x02, 0x01, 0xFF, 0x42, 0x00];
        assert!(LdapMessage::decode(&bytes).is_err());
        assert!(LdapMessage::new(-1, ProtocolOp::UnbindRequest).encode().is_err());
    }

    #[test]
    fn test_search_response_not_encodable() {
        let msg = LdapMessage::new(1, ProtocolOp::SearchResponse(SearchResponse::default()));
        assert!(matches!(msg.encode(), Err(LdapError::Encode(_))));
    }

    #[test]
    fn test_response_for_request() {
        let req = ProtocolOp::DeleteRequest("cn=a".into());
        let resp = req.response_for(LdapResult::new(result_code::NO_SUCH_OBJECT, "")).unwrap();
        assert_eq!(resp.tag(), DELETE_RESPONSE);
        assert_eq!(resp.result().map(|r| r.code), Some(result_code::NO_SUCH_OBJECT));
        assert!(ProtocolOp::UnbindRequest.response_for(LdapResult::success()).is_none());
        assert!(ProtocolOp::AbandonRequest(1).expects_no_response());
    }
}
