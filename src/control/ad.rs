// Active Directory controls: DirSync, extended DN, SD flags, policy hints.
// Show deleted / show recycled carry no value and stay generic.

use crate::ber::{BerReader, BerResult, BerWriter};

/// DirSync request and response share one shape:
/// SEQUENCE { flags | moreResults, maxAttributeCount | unused, cookie }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirSyncControl {
    pub flags: i64,
    pub max_attribute_count: i64,
    pub cookie: Vec<u8>,
}

impl DirSyncControl {
    pub const FLAG_OBJECT_SECURITY: i64 = 0x0000_0001;
    pub const FLAG_ANCESTORS_FIRST_ORDER: i64 = 0x0000_0800;
    pub const FLAG_PUBLIC_DATA_ONLY: i64 = 0x0000_2000;
    pub const FLAG_INCREMENTAL_VALUES: i64 = 0x8000_0000;

    /// On a response the first field signals whether more data is pending.
    pub fn more_results(&self) -> bool {
        self.flags != 0
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(self.flags);
        w.write_integer(self.max_attribute_count);
        w.write_octet_string(&self.cookie);
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        Ok(Self {
            flags: seq.read_integer()?,
            max_attribute_count: seq.read_integer()?,
            cookie: seq.read_octet_string()?,
        })
    }
}

/// `flag` 0 returns GUID/SID in hex, 1 in string form. `None` sends no value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedDnControl {
    pub flag: Option<i64>,
}

impl ExtendedDnControl {
    pub(super) fn encode(&self) -> Option<Vec<u8>> {
        self.flag.map(encode_flags)
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        if value.is_empty() {
            return Ok(Self { flag: None });
        }
        Ok(Self {
            flag: Some(decode_flags(value)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdFlagsControl {
    pub flags: i64,
}

impl SdFlagsControl {
    pub const OWNER: i64 = 0x1;
    pub const GROUP: i64 = 0x2;
    pub const DACL: i64 = 0x4;
    pub const SACL: i64 = 0x8;

    pub(super) fn encode(&self) -> Vec<u8> {
        encode_flags(self.flags)
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        Ok(Self {
            flags: decode_flags(value)?,
        })
    }
}

/// LDAP_SERVER_POLICY_HINTS: enforce password history on reset when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHintsControl {
    pub enabled: bool,
}

impl PolicyHintsControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        encode_flags(i64::from(self.enabled))
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        Ok(Self {
            enabled: decode_flags(value)? != 0,
        })
    }
}

fn encode_flags(flags: i64) -> Vec<u8> {
    let mut w = BerWriter::new();
    let seq = w.start_sequence();
    w.write_integer(flags);
    w.end_sequence(seq);
    w.into_vec()
}

fn decode_flags(value: &[u8]) -> BerResult<i64> {
    BerReader::new(value).read_sequence()?.read_integer()
}
