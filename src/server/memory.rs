//! Read-only directory served from configuration.
//!
//! Backs the `ldap-engine` binary and the integration tests. Entries are
//! loaded once; binds check `userPassword`, either by DN or by `uid`.

use super::handler::{
    HandlerFactory, PagingHandler, PagingResponse, RequestContext, RequestHandler, SearchOutcome, Token,
};
use super::paging::PagingRequest;
use crate::config::EntryConfig;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::protocol::{BindAuthentication, BindRequest, CompareRequest, LdapResult, SearchRequest, SearchScope};
use crate::result_code;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

struct Record {
    dn: Dn,
    entry: Entry,
}

#[derive(Clone)]
pub struct MemoryDirectory {
    records: Arc<Vec<Record>>,
}

impl MemoryDirectory {
    /// Entries whose DN does not parse are rejected.
    pub fn new(entries: Vec<Entry>) -> Result<Self> {
        let records = entries
            .into_iter()
            .map(|entry| {
                let dn = Dn::parse(&entry.dn)?;
                Ok(Record { dn, entry })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            records: Arc::new(records),
        })
    }

    pub fn from_config(entries: &[EntryConfig]) -> Result<Self> {
        Self::new(entries.iter().map(EntryConfig::to_entry).collect())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(&self, dn: &Dn) -> Option<&Record> {
        self.records.iter().find(|r| &r.dn == dn)
    }

    fn find_user(&self, name: &str) -> Option<&Record> {
        if Dn::is_valid(name) {
            return Dn::parse(name).ok().and_then(|dn| self.lookup(&dn));
        }
        self.records
            .iter()
            .find(|r| r.entry.get("uid").is_some_and(|uid| uid.contains(name.as_bytes())))
    }

    /// All entries matching scope and filter, unlimited and unfiltered.
    fn matching(&self, request: &SearchRequest) -> Result<Vec<&Entry>> {
        let base = Dn::parse(&request.base_dn)
            .map_err(|e| LdapError::operation(result_code::INVALID_DN_SYNTAX, e.diagnostic()))?;
        if !base.is_root() && self.lookup(&base).is_none() {
            return Err(LdapError::operation(
                result_code::NO_SUCH_OBJECT,
                format!("The entry {} does not exist.", request.base_dn),
            ));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| match request.scope {
                SearchScope::BaseObject => r.dn == base,
                SearchScope::SingleLevel => r.dn.is_child_of(&base),
                SearchScope::WholeSubtree => r.dn == base || r.dn.is_descendant_of(&base),
            })
            .filter(|r| request.filter.matches(&r.entry))
            .map(|r| &r.entry)
            .collect())
    }
}

#[async_trait]
impl RequestHandler for MemoryDirectory {
    async fn bind(&self, request: &BindRequest, context: &RequestContext) -> Result<Token> {
        let BindAuthentication::Simple(password) = &request.authentication else {
            return Err(LdapError::operation(
                result_code::AUTH_METHOD_NOT_SUPPORTED,
                "Only simple binds reach the directory.",
            ));
        };
        let accepted = self.find_user(&request.name).filter(|record| {
            record
                .entry
                .get("userPassword")
                .is_some_and(|stored| stored.values.iter().any(|v| v == password))
        });
        match accepted {
            Some(record) => Ok(Token::bound(record.entry.dn.clone())),
            None => {
                debug!("Rejected bind for '{}' from {}", request.name, context.peer);
                Err(LdapError::operation(result_code::INVALID_CREDENTIALS, "Invalid credentials."))
            }
        }
    }

    async fn search(&self, request: &SearchRequest, _context: &RequestContext) -> Result<SearchOutcome> {
        let matching = self.matching(request)?;
        let limit = usize::try_from(request.size_limit).unwrap_or(0);
        let exceeded = limit > 0 && matching.len() > limit;
        let entries = matching
            .into_iter()
            .take(if limit > 0 { limit } else { usize::MAX })
            .map(|e| e.filtered(&request.attributes, request.types_only))
            .collect();
        let result = if exceeded {
            LdapResult::new(result_code::SIZE_LIMIT_EXCEEDED, "Size limit exceeded.")
        } else {
            LdapResult::success()
        };
        Ok(SearchOutcome {
            entries,
            result,
            ..Default::default()
        })
    }

    async fn compare(&self, request: &CompareRequest, _context: &RequestContext) -> Result<bool> {
        let dn = Dn::parse(&request.dn)
            .map_err(|e| LdapError::operation(result_code::INVALID_DN_SYNTAX, e.diagnostic()))?;
        let record = self.lookup(&dn).ok_or_else(|| {
            LdapError::operation(result_code::NO_SUCH_OBJECT, format!("The entry {} does not exist.", request.dn))
        })?;
        let attribute = record.entry.get(&request.attribute).ok_or_else(|| {
            LdapError::operation(
                result_code::NO_SUCH_ATTRIBUTE,
                format!("The entry has no {} attribute.", request.attribute),
            )
        })?;
        Ok(attribute.contains(&request.value))
    }
}

#[async_trait]
impl PagingHandler for MemoryDirectory {
    async fn page(&self, request: &mut PagingRequest, _context: &RequestContext) -> Result<PagingResponse> {
        let matching = self.matching(&request.search)?;
        let size = usize::try_from(request.size).unwrap_or(0).max(1);
        let start = request.offset.min(matching.len());
        let end = start.saturating_add(size).min(matching.len());
        let entries = matching[start..end]
            .iter()
            .map(|e| e.filtered(&request.search.attributes, request.search.types_only))
            .collect();
        request.offset = end;
        Ok(PagingResponse {
            entries,
            complete: end >= matching.len(),
            remaining: (matching.len() - end) as i64,
        })
    }

    async fn remove(&self, request: &PagingRequest, context: &RequestContext) -> Result<()> {
        debug!(
            "Released paged search of {} for {} at offset {}",
            request.search.base_dn, context.peer, request.offset
        );
        Ok(())
    }
}

impl HandlerFactory for MemoryDirectory {
    fn request_handler(&self) -> Arc<dyn RequestHandler> {
        Arc::new(self.clone())
    }

    fn paging_handler(&self) -> Option<Arc<dyn PagingHandler>> {
        Some(Arc::new(self.clone()))
    }
}
