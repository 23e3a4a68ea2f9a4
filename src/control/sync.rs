// Content synchronization controls (RFC 4533 section 2).

use crate::ber::{BerError, BerReader, BerResult, BerWriter, TAG_BOOLEAN, TAG_OCTET_STRING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RefreshOnly = 1,
    RefreshAndPersist = 3,
}

impl TryFrom<i64> for SyncMode {
    type Error = BerError;

    fn try_from(value: i64) -> BerResult<Self> {
        match value {
            1 => Ok(SyncMode::RefreshOnly),
            3 => Ok(SyncMode::RefreshAndPersist),
            other => Err(BerError::Malformed(format!("invalid sync mode {}", other))),
        }
    }
}

/// syncRequestValue ::= SEQUENCE { mode, cookie OPTIONAL, reloadHint DEFAULT FALSE }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestControl {
    pub mode: SyncMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestControl {
    pub fn is_refresh_and_persist(&self) -> bool {
        self.mode == SyncMode::RefreshAndPersist
    }

    /// A missing and an empty cookie both mean an initial poll.
    pub fn has_cookie(&self) -> bool {
        self.cookie.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_enumerated(self.mode as i64);
        if let Some(cookie) = &self.cookie {
            w.write_octet_string(cookie);
        }
        if self.reload_hint {
            w.write_boolean(true);
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        let mode = SyncMode::try_from(seq.read_enumerated()?)?;
        let cookie = seq.read_optional(TAG_OCTET_STRING)?.map(<[u8]>::to_vec);
        let reload_hint = match seq.read_optional(TAG_BOOLEAN)? {
            Some(c) => crate::ber::decode_boolean(c)?,
            None => false,
        };
        Ok(Self {
            mode,
            cookie,
            reload_hint,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Present = 0,
    Add = 1,
    Modify = 2,
    Delete = 3,
}

impl TryFrom<i64> for SyncState {
    type Error = BerError;

    fn try_from(value: i64) -> BerResult<Self> {
        match value {
            0 => Ok(SyncState::Present),
            1 => Ok(SyncState::Add),
            2 => Ok(SyncState::Modify),
            3 => Ok(SyncState::Delete),
            other => Err(BerError::Malformed(format!("invalid sync state {}", other))),
        }
    }
}

/// Attached to each entry or reference returned by a sync search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateControl {
    pub state: SyncState,
    pub entry_uuid: Vec<u8>,
    pub cookie: Option<Vec<u8>>,
}

impl SyncStateControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_enumerated(self.state as i64);
        w.write_octet_string(&self.entry_uuid);
        if let Some(cookie) = &self.cookie {
            w.write_octet_string(cookie);
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        let state = SyncState::try_from(seq.read_enumerated()?)?;
        let entry_uuid = seq.read_octet_string()?;
        let cookie = seq.read_optional(TAG_OCTET_STRING)?.map(<[u8]>::to_vec);
        Ok(Self {
            state,
            entry_uuid,
            cookie,
        })
    }
}

/// Attached to the SearchResultDone that ends a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDoneControl {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl SyncDoneControl {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        if let Some(cookie) = &self.cookie {
            w.write_octet_string(cookie);
        }
        if self.refresh_deletes {
            w.write_boolean(true);
        }
        w.end_sequence(seq);
        w.into_vec()
    }

    pub(super) fn decode(value: &[u8]) -> BerResult<Self> {
        let mut seq = BerReader::new(value).read_sequence()?;
        let cookie = seq.read_optional(TAG_OCTET_STRING)?.map(<[u8]>::to_vec);
        let refresh_deletes = match seq.read_optional(TAG_BOOLEAN)? {
            Some(c) => crate::ber::decode_boolean(c)?,
            None => false,
        };
        Ok(Self {
            cookie,
            refresh_deletes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_value() {
        let req = SyncRequestControl {
            mode: SyncMode::RefreshOnly,
            cookie: Some(b"rid=000,csn=1".to_vec()),
            reload_hint: false,
        };
        let bytes = req.encode();
        assert_eq!(&bytes[2..5], &[0x0A, 0x01, 0x01]);
        let decoded = SyncRequestControl::decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.has_cookie());
        assert!(!decoded.is_refresh_and_persist());
    }

    #[test]
    fn test_sync_request_rejects_unknown_mode() {
        assert!(SyncRequestControl::decode(&[0x30, 0x03, 0x0A, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_sync_state_value() {
        let state = SyncStateControl {
            state: SyncState::Delete,
            entry_uuid: vec![0xAB; 16],
            cookie: None,
        };
        assert_eq!(SyncStateControl::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn test_sync_done_defaults() {
        let done = SyncDoneControl::decode(&[0x30, 0x00]).unwrap();
        assert_eq!(done, SyncDoneControl::default());
        let done = SyncDoneControl {
            cookie: Some(b"c".to_vec()),
            refresh_deletes: true,
        };
        assert_eq!(SyncDoneControl::decode(&done.encode()).unwrap(), done);
    }
}
