//! Request/response controls. Known OIDs decode into typed values through
//! `DECODERS`; anything else stays a generic control with its raw bytes.

mod ad;
mod sort;
mod sync;

pub use ad::{DirSyncControl, ExtendedDnControl, PolicyHintsControl, SdFlagsControl};
pub use sort::{SortKey, SortResponseControl, VlvRequestControl, VlvResponseControl, VlvTarget};
pub use sync::{SyncDoneControl, SyncMode, SyncRequestControl, SyncState, SyncStateControl};

use crate::ber::{BerReader, BerResult, BerWriter, TAG_BOOLEAN, TAG_OCTET_STRING};

pub const PAGING_OID: &str = "1.2.840.113556.1.4.319";
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";
pub const DIR_SYNC_OID: &str = "1.2.840.113556.1.4.841";
pub const EXTENDED_DN_OID: &str = "1.2.840.113556.1.4.529";
pub const SD_FLAGS_OID: &str = "1.2.840.113556.1.4.801";
pub const POLICY_HINTS_OID: &str = "1.2.840.113556.1.4.2239";
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";
pub const SHOW_RECYCLED_OID: &str = "1.2.840.113556.1.4.2064";
pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";

/// Simple paged results (RFC 2696). `size` is the requested page size on a
/// request and the server's result-set estimate on a response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagingControl {
    pub size: i64,
    pub cookie: Vec<u8>,
}

impl PagingControl {
    pub fn new(size: i64, cookie: Vec<u8>) -> Self {
        Self { size, cookie }
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(self.size);
        w.write_octet_string(&self.cookie);
        w.end_sequence(seq);
        w.into_vec()
    }

    fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        Ok(Self {
            size: seq.read_integer()?,
            cookie: seq.read_octet_string()?,
        })
    }
}

/// Typed control payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    /// Unregistered OID, or a registered one carrying no value.
    Generic(Option<Vec<u8>>),
    Paging(PagingControl),
    SortRequest(Vec<SortKey>),
    SortResponse(SortResponseControl),
    VlvRequest(VlvRequestControl),
    VlvResponse(VlvResponseControl),
    SyncRequest(SyncRequestControl),
    SyncState(SyncStateControl),
    SyncDone(SyncDoneControl),
    DirSync(DirSyncControl),
    ExtendedDn(ExtendedDnControl),
    SdFlags(SdFlagsControl),
    PolicyHints(PolicyHintsControl),
}

impl ControlValue {
    fn encode(&self) -> Option<Vec<u8>> {
        match self {
            ControlValue::Generic(raw) => raw.clone(),
            ControlValue::Paging(c) => Some(c.encode()),
            ControlValue::SortRequest(keys) => Some(sort::encode_sort_request(keys)),
            ControlValue::SortResponse(c) => Some(c.encode()),
            ControlValue::VlvRequest(c) => Some(c.encode()),
            ControlValue::VlvResponse(c) => Some(c.encode()),
            ControlValue::SyncRequest(c) => Some(c.encode()),
            ControlValue::SyncState(c) => Some(c.encode()),
            ControlValue::SyncDone(c) => Some(c.encode()),
            ControlValue::DirSync(c) => Some(c.encode()),
            ControlValue::ExtendedDn(c) => c.encode(),
            ControlValue::SdFlags(c) => Some(c.encode()),
            ControlValue::PolicyHints(c) => Some(c.encode()),
        }
    }
}

type Decoder = fn(&[u8]) -> BerResult<ControlValue>;

fn decode_paging(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::Paging(PagingControl::decode(v)?))
}

fn decode_sort_request(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SortRequest(sort::decode_sort_request(v)?))
}

fn decode_sort_response(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SortResponse(SortResponseControl::decode(v)?))
}

fn decode_vlv_request(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::VlvRequest(VlvRequestControl::decode(v)?))
}

fn decode_vlv_response(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::VlvResponse(VlvResponseControl::decode(v)?))
}

fn decode_sync_request(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SyncRequest(SyncRequestControl::decode(v)?))
}

fn decode_sync_state(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SyncState(SyncStateControl::decode(v)?))
}

fn decode_sync_done(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SyncDone(SyncDoneControl::decode(v)?))
}

fn decode_dir_sync(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::DirSync(DirSyncControl::decode(v)?))
}

fn decode_extended_dn(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::ExtendedDn(ExtendedDnControl::decode(v)?))
}

fn decode_sd_flags(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::SdFlags(SdFlagsControl::decode(v)?))
}

fn decode_policy_hints(v: &[u8]) -> BerResult<ControlValue> {
    Ok(ControlValue::PolicyHints(PolicyHintsControl::decode(v)?))
}

/// OID to decoder table.
static DECODERS: &[(&str, Decoder)] = &[
    (PAGING_OID, decode_paging),
    (SORT_REQUEST_OID, decode_sort_request),
    (SORT_RESPONSE_OID, decode_sort_response),
    (VLV_REQUEST_OID, decode_vlv_request),
    (VLV_RESPONSE_OID, decode_vlv_response),
    (SYNC_REQUEST_OID, decode_sync_request),
    (SYNC_STATE_OID, decode_sync_state),
    (SYNC_DONE_OID, decode_sync_done),
    (DIR_SYNC_OID, decode_dir_sync),
    (EXTENDED_DN_OID, decode_extended_dn),
    (SD_FLAGS_OID, decode_sd_flags),
    (POLICY_HINTS_OID, decode_policy_hints),
];

fn decoder_for(oid: &str) -> Option<Decoder> {
    DECODERS.iter().find(|(o, _)| *o == oid).map(|(_, d)| *d)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: ControlValue,
}

impl Control {
    pub fn new(oid: impl Into<String>, criticality: bool, value: ControlValue) -> Self {
        Self {
            oid: oid.into(),
            criticality,
            value,
        }
    }

    /// Control with no value or an opaque one.
    pub fn generic(oid: impl Into<String>, criticality: bool, value: Option<Vec<u8>>) -> Self {
        Self::new(oid, criticality, ControlValue::Generic(value))
    }

    pub fn paging(size: i64, cookie: Vec<u8>, criticality: bool) -> Self {
        Self::new(
            PAGING_OID,
            criticality,
            ControlValue::Paging(PagingControl::new(size, cookie)),
        )
    }

    pub fn sort(keys: Vec<SortKey>) -> Self {
        Self::new(SORT_REQUEST_OID, false, ControlValue::SortRequest(keys))
    }

    pub fn sync_request(mode: SyncMode, cookie: Option<Vec<u8>>, reload_hint: bool) -> Self {
        Self::new(
            SYNC_REQUEST_OID,
            true,
            ControlValue::SyncRequest(SyncRequestControl {
                mode,
                cookie,
                reload_hint,
            }),
        )
    }

    pub fn sync_done(cookie: Option<Vec<u8>>, refresh_deletes: bool) -> Self {
        Self::new(
            SYNC_DONE_OID,
            false,
            ControlValue::SyncDone(SyncDoneControl {
                cookie,
                refresh_deletes,
            }),
        )
    }

    pub fn manage_dsa_it() -> Self {
        Self::generic(MANAGE_DSA_IT_OID, true, None)
    }

    pub fn show_deleted() -> Self {
        Self::generic(SHOW_DELETED_OID, true, None)
    }

    pub fn show_recycled() -> Self {
        Self::generic(SHOW_RECYCLED_OID, true, None)
    }

    pub fn as_paging(&self) -> Option<&PagingControl> {
        match &self.value {
            ControlValue::Paging(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sync_request(&self) -> Option<&SyncRequestControl> {
        match &self.value {
            ControlValue::SyncRequest(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sync_state(&self) -> Option<&SyncStateControl> {
        match &self.value {
            ControlValue::SyncState(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sync_done(&self) -> Option<&SyncDoneControl> {
        match &self.value {
            ControlValue::SyncDone(s) => Some(s),
            _ => None,
        }
    }

    /// Raw value bytes as they appear on the wire.
    pub fn raw_value(&self) -> Option<Vec<u8>> {
        self.value.encode()
    }

    /// Control ::= SEQUENCE { controlType, criticality DEFAULT FALSE, controlValue OPTIONAL }
    pub fn encode(&self, writer: &mut BerWriter) {
        let seq = writer.start_sequence();
        writer.write_string(&self.oid);
        if self.criticality {
            writer.write_boolean(true);
        }
        if let Some(value) = self.value.encode() {
            writer.write_octet_string(&value);
        }
        writer.end_sequence(seq);
    }

    pub fn decode(reader: &mut BerReader<'_>) -> BerResult<Self> {
        let mut seq = reader.read_sequence()?;
        let oid = seq.read_string()?;
        let criticality = match seq.read_optional(TAG_BOOLEAN)? {
            Some(content) => crate::ber::decode_boolean(content)?,
            None => false,
        };
        let raw = seq.read_optional(TAG_OCTET_STRING)?;
        let value = match (raw, decoder_for(&oid)) {
            (Some(raw), Some(decode)) => decode(raw)?,
            (raw, _) => ControlValue::Generic(raw.map(<[u8]>::to_vec)),
        };
        Ok(Self {
            oid,
            criticality,
            value,
        })
    }
}

/// First control with the given OID.
pub fn find<'a>(controls: &'a [Control], oid: &str) -> Option<&'a Control> {
    controls.iter().find(|c| c.oid == oid)
}

pub fn find_paging(controls: &[Control]) -> Option<&PagingControl> {
    find(controls, PAGING_OID).and_then(Control::as_paging)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(control: &Control) -> Control {
        let mut w = BerWriter::new();
        control.encode(&mut w);
        let bytes = w.into_vec();
        Control::decode(&mut BerReader::new(&bytes)).unwrap()
    }

    #[test]
    fn test_paging_control_wire_form() {
        let control = Control::paging(10, b"X".to_vec(), true);
        let mut w = BerWriter::new();
        control.encode(&mut w);
        let bytes = w.into_vec();
        // OID, TRUE, OCTET STRING { SEQUENCE { 10, "X" } }
        assert_eq!(bytes[2], TAG_OCTET_STRING);
        assert_eq!(&bytes[bytes.len() - 10..], &[0x04, 0x08, 0x30, 0x06, 0x02, 0x01, 0x0A, 0x04, 0x01, b'X']);
        assert_eq!(roundtrip(&control), control);
    }

    #[test]
    fn test_unknown_oid_is_generic() {
        let control = Control::generic("1.2.3.4", false, Some(vec![1, 2, 3]));
        let decoded = roundtrip(&control);
        assert_eq!(decoded.value, ControlValue::Generic(Some(vec![1, 2, 3])));
        assert!(!decoded.criticality);
    }

    #[test]
    fn test_valueless_known_control() {
        let decoded = roundtrip(&Control::manage_dsa_it());
        assert_eq!(decoded.oid, MANAGE_DSA_IT_OID);
        assert!(decoded.criticality);
        assert_eq!(decoded.value, ControlValue::Generic(None));
    }

    #[test]
    fn test_find_paging() {
        let controls = vec![Control::manage_dsa_it(), Control::paging(5, vec![], false)];
        assert_eq!(find_paging(&controls).unwrap().size, 5);
        assert!(find(&controls, SORT_REQUEST_OID).is_none());
    }

    #[test]
    fn test_malformed_known_value_is_error() {
        let control = Control::generic(PAGING_OID, false, Some(vec![0x04, 0x00]));
        let mut w = BerWriter::new();
        control.encode(&mut w);
        let bytes = w.into_vec();
        assert!(Control::decode(&mut BerReader::new(&bytes)).is_err());
    }
}
