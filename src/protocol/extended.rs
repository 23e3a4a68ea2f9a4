// Extended operations, their typed responses, and sync info messages.

use super::request::ExtendedRequest;
use super::response::{ExtendedResponse, IntermediateResponse, LdapResult};
use super::ProtocolOp;
use crate::ber::{context, context_constructed, BerError, BerReader, BerResult, BerWriter, TAG_BOOLEAN, TAG_OCTET_STRING, TAG_SET};
use crate::error::{LdapError, Result};

pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
pub const CANCEL_OID: &str = "1.3.6.1.1.8";
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

impl ExtendedRequest {
    pub fn start_tls() -> Self {
        Self::new(START_TLS_OID, None)
    }

    pub fn whoami() -> Self {
        Self::new(WHOAMI_OID, None)
    }

    /// cancelRequestValue ::= SEQUENCE { cancelID MessageID }
    pub fn cancel(message_id: i32) -> Self {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(i64::from(message_id));
        w.end_sequence(seq);
        Self::new(CANCEL_OID, Some(w.into_vec()))
    }

    /// PasswdModifyRequestValue; every field is optional.
    pub fn password_modify(user: Option<&str>, old_password: Option<&[u8]>, new_password: Option<&[u8]>) -> Self {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        if let Some(user) = user {
            w.write_element(context(0), user.as_bytes());
        }
        if let Some(old) = old_password {
            w.write_element(context(1), old);
        }
        if let Some(new) = new_password {
            w.write_element(context(2), new);
        }
        w.end_sequence(seq);
        Self::new(PASSWORD_MODIFY_OID, Some(w.into_vec()))
    }

    /// Message id targeted by a Cancel request.
    pub fn cancel_id(&self) -> Result<i32> {
        if self.name != CANCEL_OID {
            return Err(LdapError::protocol(format!("{} is not a cancel request", self.name)));
        }
        let value = self
            .value
            .as_deref()
            .ok_or_else(|| LdapError::protocol("cancel request without a value"))?;
        Ok(BerReader::new(value).read_sequence()?.read_i32()?)
    }
}

impl ExtendedResponse {
    /// A server-initiated notice that the connection is about to close.
    pub fn notice_of_disconnection(code: u32, message: impl Into<String>) -> Self {
        Self {
            result: LdapResult::new(code, message),
            name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            value: None,
        }
    }

    pub fn whoami(result: LdapResult, authz_id: &str) -> Self {
        Self {
            result,
            name: None,
            value: Some(authz_id.as_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmIResponse {
    pub result: LdapResult,
    /// `dn:<dn>`, `u:<user>`, or empty for anonymous.
    pub authz_id: String,
}

impl WhoAmIResponse {
    pub fn from_extended(response: ExtendedResponse) -> Result<Self> {
        let authz_id = match response.value {
            Some(value) => String::from_utf8(value).map_err(|_| LdapError::protocol("authzId is not UTF-8"))?,
            None => String::new(),
        };
        Ok(Self {
            result: response.result,
            authz_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordModifyResponse {
    pub result: LdapResult,
    pub generated_password: Option<Vec<u8>>,
}

impl PasswordModifyResponse {
    /// PasswdModifyResponseValue ::= SEQUENCE { genPasswd [0] OPTIONAL }
    pub fn from_extended(response: ExtendedResponse) -> Result<Self> {
        let generated_password = match response.value.as_deref() {
            Some(value) if !value.is_empty() => BerReader::new(value)
                .read_sequence()?
                .read_optional(context(0))?
                .map(<[u8]>::to_vec),
            _ => None,
        };
        Ok(Self {
            result: response.result,
            generated_password,
        })
    }
}

type ResponseMapper = fn(ExtendedResponse) -> Result<ProtocolOp>;

fn map_whoami(response: ExtendedResponse) -> Result<ProtocolOp> {
    Ok(ProtocolOp::WhoAmIResponse(WhoAmIResponse::from_extended(response)?))
}

fn map_password_modify(response: ExtendedResponse) -> Result<ProtocolOp> {
    Ok(ProtocolOp::PasswordModifyResponse(PasswordModifyResponse::from_extended(
        response,
    )?))
}

fn map_start_tls(mut response: ExtendedResponse) -> Result<ProtocolOp> {
    response.name.get_or_insert_with(|| START_TLS_OID.to_string());
    Ok(ProtocolOp::ExtendedResponse(response))
}

fn map_cancel(mut response: ExtendedResponse) -> Result<ProtocolOp> {
    response.name.get_or_insert_with(|| CANCEL_OID.to_string());
    Ok(ProtocolOp::ExtendedResponse(response))
}

static RESPONSE_MAPPERS: &[(&str, ResponseMapper)] = &[
    (WHOAMI_OID, map_whoami),
    (PASSWORD_MODIFY_OID, map_password_modify),
    (START_TLS_OID, map_start_tls),
    (CANCEL_OID, map_cancel),
];

/// Rewrites a generic ExtendedResponse into the typed response registered
/// for the request OID. Unregistered OIDs pass through unchanged.
pub fn map_extended_response(request_oid: &str, op: ProtocolOp) -> Result<ProtocolOp> {
    let ProtocolOp::ExtendedResponse(response) = op else {
        return Ok(op);
    };
    match RESPONSE_MAPPERS.iter().find(|(oid, _)| *oid == request_oid) {
        Some((_, mapper)) => mapper(response),
        None => Ok(ProtocolOp::ExtendedResponse(response)),
    }
}

/// RFC 4533 syncInfoValue carried in an IntermediateResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfo {
    NewCookie(Vec<u8>),
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    SyncIdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        uuids: Vec<Vec<u8>>,
    },
}

impl SyncInfo {
    pub fn cookie(&self) -> Option<&[u8]> {
        match self {
            SyncInfo::NewCookie(cookie) => Some(cookie),
            SyncInfo::RefreshDelete { cookie, .. }
            | SyncInfo::RefreshPresent { cookie, .. }
            | SyncInfo::SyncIdSet { cookie, .. } => cookie.as_deref(),
        }
    }

    pub fn from_intermediate(response: &IntermediateResponse) -> Result<Option<Self>> {
        if response.name.as_deref() != Some(SYNC_INFO_OID) {
            return Ok(None);
        }
        let value = response
            .value
            .as_deref()
            .ok_or_else(|| LdapError::protocol("sync info message without a value"))?;
        Ok(Some(Self::decode(value)?))
    }

    pub fn to_intermediate(&self) -> IntermediateResponse {
        IntermediateResponse {
            name: Some(SYNC_INFO_OID.to_string()),
            value: Some(self.encode()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        match self {
            SyncInfo::NewCookie(cookie) => w.write_element(context(0), cookie),
            SyncInfo::RefreshDelete {
                cookie,
                refresh_done,
            } => encode_refresh(&mut w, 1, cookie.as_deref(), *refresh_done),
            SyncInfo::RefreshPresent {
                cookie,
                refresh_done,
            } => encode_refresh(&mut w, 2, cookie.as_deref(), *refresh_done),
            SyncInfo::SyncIdSet {
                cookie,
                refresh_deletes,
                uuids,
            } => {
                let pos = w.start_constructed(context_constructed(3));
                if let Some(cookie) = cookie {
                    w.write_octet_string(cookie);
                }
                if *refresh_deletes {
                    w.write_boolean(true);
                }
                let set = w.start_constructed(TAG_SET);
                for uuid in uuids {
                    w.write_octet_string(uuid);
                }
                w.end_constructed(set);
                w.end_constructed(pos);
            }
        }
        w.into_vec()
    }

    pub fn decode(value: &[u8]) -> BerResult<Self> {
        let mut r = BerReader::new(value);
        let (tag, content) = r.read_element()?;
        let mut inner = BerReader::new(content);
        match tag {
            t if t == context(0) => Ok(SyncInfo::NewCookie(content.to_vec())),
            t if t == context_constructed(1) => {
                let (cookie, refresh_done) = decode_refresh(&mut inner)?;
                Ok(SyncInfo::RefreshDelete {
                    cookie,
                    refresh_done,
                })
            }
            t if t == context_constructed(2) => {
                let (cookie, refresh_done) = decode_refresh(&mut inner)?;
                Ok(SyncInfo::RefreshPresent {
                    cookie,
                    refresh_done,
                })
            }
            t if t == context_constructed(3) => {
                let cookie = inner.read_optional(TAG_OCTET_STRING)?.map(<[u8]>::to_vec);
                let refresh_deletes = match inner.read_optional(TAG_BOOLEAN)? {
                    Some(c) => crate::ber::decode_boolean(c)?,
                    None => false,
                };
                let mut set = inner.read_constructed(TAG_SET)?;
                let mut uuids = Vec::new();
                while !set.is_empty() {
                    uuids.push(set.read_octet_string()?);
                }
                Ok(SyncInfo::SyncIdSet {
                    cookie,
                    refresh_deletes,
                    uuids,
                })
            }
            actual => Err(BerError::UnexpectedTag {
                expected: context(0),
                actual,
            }),
        }
    }
}

fn encode_refresh(w: &mut BerWriter, choice: u8, cookie: Option<&[u8]>, refresh_done: bool) {
    let pos = w.start_constructed(context_constructed(choice));
    if let Some(cookie) = cookie {
        w.write_octet_string(cookie);
    }
    if !refresh_done {
        w.write_boolean(false);
    }
    w.end_constructed(pos);
}

/// refreshDone defaults to TRUE.
fn decode_refresh(r: &mut BerReader<'_>) -> BerResult<(Option<Vec<u8>>, bool)> {
    let cookie = r.read_optional(TAG_OCTET_STRING)?.map(<[u8]>::to_vec);
    let refresh_done = match r.read_optional(TAG_BOOLEAN)? {
        Some(c) => crate::ber::decode_boolean(c)?,
        None => true,
    };
    Ok((cookie, refresh_done))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_code;

    #[test]
    fn test_cancel_request_value() {
        let req = ExtendedRequest::cancel(7);
        assert_eq!(req.name, CANCEL_OID);
        assert_eq!(req.value, Some(vec![0x30, 0x03, 0x02, 0x01, 0x07]));
        assert_eq!(req.cancel_id().unwrap(), 7);
        assert!(ExtendedRequest::whoami().cancel_id().is_err());
    }

    #[test]
    fn test_password_modify_request_value() {
        let req = ExtendedRequest::password_modify(Some("uid=a"), None, Some(b"new"));
        let value = req.value.unwrap();
        let mut seq = BerReader::new(&value).read_sequence().unwrap();
        assert_eq!(seq.read_tagged(context(0)).unwrap(), b"uid=a");
        assert_eq!(seq.read_tagged(context(2)).unwrap(), b"new");
        assert!(seq.is_empty());
    }

    #[test]
    fn test_map_whoami_response() {
        let op = ProtocolOp::ExtendedResponse(ExtendedResponse::whoami(LdapResult::success(), "dn:cn=admin"));
        match map_extended_response(WHOAMI_OID, op).unwrap() {
            ProtocolOp::WhoAmIResponse(resp) => assert_eq!(resp.authz_id, "dn:cn=admin"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_map_password_modify_generated() {
        let resp = ExtendedResponse {
            result: LdapResult::success(),
            name: None,
            value: Some(vec![0x30, 0x04, 0x80, 0x02, b'p', b'w']),
        };
        match map_extended_response(PASSWORD_MODIFY_OID, ProtocolOp::ExtendedResponse(resp)).unwrap() {
            ProtocolOp::PasswordModifyResponse(resp) => {
                assert_eq!(resp.generated_password, Some(b"pw".to_vec()))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_map_unknown_oid_passes_through() {
        let resp = ExtendedResponse::new(LdapResult::new(result_code::PROTOCOL_ERROR, "no"));
        let op = map_extended_response("1.2.3", ProtocolOp::ExtendedResponse(resp.clone())).unwrap();
        assert_eq!(op, ProtocolOp::ExtendedResponse(resp));
    }

    #[test]
    fn test_sync_info_refresh_done_default() {
        let info = SyncInfo::decode(&[0xA2, 0x00]).unwrap();
        assert_eq!(
            info,
            SyncInfo::RefreshPresent {
                cookie: None,
                refresh_done: true
            }
        );
        let pending = SyncInfo::RefreshDelete {
            cookie: Some(b"c1".to_vec()),
            refresh_done: false,
        };
        assert_eq!(SyncInfo::decode(&pending.encode()).unwrap(), pending);
        assert_eq!(pending.cookie(), Some(&b"c1"[..]));
    }

    #[test]
    fn test_sync_id_set() {
        let info = SyncInfo::SyncIdSet {
            cookie: None,
            refresh_deletes: true,
            uuids: vec![vec![1; 16], vec![2; 16]],
        };
        let intermediate = info.to_intermediate();
        assert_eq!(SyncInfo::from_intermediate(&intermediate).unwrap(), Some(info));
        let other = IntermediateResponse {
            name: Some("1.2.3".into()),
            value: None,
        };
        assert_eq!(SyncInfo::from_intermediate(&other).unwrap(), None);
    }
}
