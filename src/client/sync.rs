//! Content synchronization polls (RFC 4533).
//!
//! One state machine covers the initial poll and later content update polls.
//! The request carries the sync request control; the cookie it sends is
//! replaced by every cookie the server hands back (state controls, sync info
//! messages, the done control), so the cookie left on the request after a
//! poll is the one to use for the next.
//!
//! `refreshDelete`/`refreshPresent` info messages with `refreshDone` false
//! make the machine re-send the search with the newest cookie. A done control
//! with `refreshDeletes` set triggers one more drain of the deletion phase.

use crate::control::{Control, SyncDoneControl, SyncMode, SyncStateControl, SYNC_DONE_OID, SYNC_STATE_OID};
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::protocol::{LdapMessage, LdapResult, ProtocolOp, SearchRequest, SyncInfo};
use crate::queue::MessageChannel;
use tracing::{debug, warn};

/// Parameters of a sync poll.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub search: SearchRequest,
    pub mode: SyncMode,
    /// None for the initial poll.
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
    /// Sent alongside the sync request control.
    pub controls: Vec<Control>,
}

impl SyncRequest {
    pub fn new(search: SearchRequest) -> Self {
        Self {
            search,
            mode: SyncMode::RefreshOnly,
            cookie: None,
            reload_hint: false,
            controls: Vec::new(),
        }
    }

    pub fn persist(mut self) -> Self {
        self.mode = SyncMode::RefreshAndPersist;
        self
    }

    pub fn with_cookie(mut self, cookie: Vec<u8>) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn is_initial(&self) -> bool {
        self.cookie.as_ref().map(|c| c.is_empty()).unwrap_or(true)
    }

    fn to_message(&self, message_id: i32) -> LdapMessage {
        let mut controls = self.controls.clone();
        controls.push(Control::sync_request(self.mode, self.cookie.clone(), self.reload_hint));
        LdapMessage::new(message_id, ProtocolOp::SearchRequest(self.search.clone())).with_controls(controls)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Entry { entry: Entry, state: SyncStateControl },
    Reference { urls: Vec<String>, state: Option<SyncStateControl> },
    /// UUIDs from a syncIdSet message; deletions when `refresh_deletes` is set,
    /// otherwise entries still present.
    IdSet { uuids: Vec<Vec<u8>>, refresh_deletes: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Refresh,
    /// refreshAndPersist after the refresh completed.
    Persist,
    /// The extra drain requested by a done control with refreshDeletes.
    Deletes,
}

/// What a listener sees alongside each event.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub phase: SyncPhase,
    pub cookie: Option<Vec<u8>>,
}

pub type SyncListener = Box<dyn FnMut(SyncEvent, &SyncContext) -> Result<()> + Send>;

/// Result of a completed poll. `events` is empty when a listener consumed them.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub result: LdapResult,
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
    pub events: Vec<SyncEvent>,
}

enum Step {
    Continue,
    Resend,
    Done(LdapResult),
}

struct SyncMachine {
    initial: bool,
    mode: SyncMode,
    context: SyncContext,
    refresh_deletes: bool,
    events: Vec<SyncEvent>,
}

impl SyncMachine {
    fn new(request: &SyncRequest) -> Self {
        Self {
            initial: request.is_initial(),
            mode: request.mode,
            context: SyncContext {
                phase: SyncPhase::Refresh,
                cookie: request.cookie.clone(),
            },
            refresh_deletes: false,
            events: Vec::new(),
        }
    }

    fn update_cookie(&mut self, cookie: Option<&[u8]>) {
        if let Some(cookie) = cookie {
            self.context.cookie = Some(cookie.to_vec());
        }
    }

    fn emit(&mut self, event: SyncEvent, listener: Option<&mut SyncListener>) -> Result<()> {
        match listener {
            Some(f) => f(event, &self.context),
            None => {
                self.events.push(event);
                Ok(())
            }
        }
    }

    fn state_of(message: &LdapMessage) -> Option<SyncStateControl> {
        message
            .control(SYNC_STATE_OID)
            .and_then(Control::as_sync_state)
            .cloned()
    }

    fn on_message(&mut self, message: LdapMessage, listener: Option<&mut SyncListener>) -> Result<Step> {
        let state = Self::state_of(&message);
        let done = message
            .control(SYNC_DONE_OID)
            .and_then(Control::as_sync_done)
            .cloned();
        match message.op {
            ProtocolOp::SearchResultEntry(entry) => {
                let state = state.ok_or_else(|| {
                    LdapError::protocol(format!("sync entry {} without a sync state control", entry.dn))
                })?;
                self.update_cookie(state.cookie.as_deref());
                self.emit(SyncEvent::Entry { entry, state }, listener)?;
                Ok(Step::Continue)
            }
            ProtocolOp::SearchResultReference(urls) => {
                if let Some(s) = &state {
                    self.update_cookie(s.cookie.as_deref());
                }
                self.emit(SyncEvent::Reference { urls, state }, listener)?;
                Ok(Step::Continue)
            }
            ProtocolOp::IntermediateResponse(response) => {
                let Some(info) = SyncInfo::from_intermediate(&response)? else {
                    debug!("Ignoring intermediate response {:?}", response.name);
                    return Ok(Step::Continue);
                };
                self.update_cookie(info.cookie());
                match info {
                    SyncInfo::NewCookie(_) => Ok(Step::Continue),
                    SyncInfo::RefreshDelete { refresh_done, .. } | SyncInfo::RefreshPresent { refresh_done, .. } => {
                        if !refresh_done {
                            return Ok(Step::Resend);
                        }
                        if self.mode == SyncMode::RefreshAndPersist {
                            self.context.phase = SyncPhase::Persist;
                        }
                        Ok(Step::Continue)
                    }
                    SyncInfo::SyncIdSet {
                        refresh_deletes, uuids, ..
                    } => {
                        self.emit(SyncEvent::IdSet { uuids, refresh_deletes }, listener)?;
                        Ok(Step::Continue)
                    }
                }
            }
            ProtocolOp::SearchResultDone(result) => self.on_done(result, done),
            other => Err(LdapError::protocol(format!("unexpected {} during sync", other.name()))),
        }
    }

    fn on_done(&mut self, result: LdapResult, done: Option<SyncDoneControl>) -> Result<Step> {
        result.check()?;
        let done = match done {
            Some(done) => done,
            None if self.initial && self.context.phase == SyncPhase::Refresh => {
                return Err(LdapError::protocol("initial sync poll ended without a sync done control"))
            }
            None => SyncDoneControl::default(),
        };
        self.update_cookie(done.cookie.as_deref());
        if done.refresh_deletes && self.context.phase != SyncPhase::Deletes {
            self.refresh_deletes = true;
            self.context.phase = SyncPhase::Deletes;
            return Ok(Step::Resend);
        }
        Ok(Step::Done(result))
    }
}

/// Runs one poll to completion. `request.cookie` is updated in place.
pub async fn poll(
    channel: &mut dyn MessageChannel,
    next_id: &mut (dyn FnMut() -> i32 + Send),
    request: &mut SyncRequest,
    mut listener: Option<&mut SyncListener>,
) -> Result<SyncOutcome> {
    let mut machine = SyncMachine::new(request);
    let mut id = next_id();
    channel.send_message(&[request.to_message(id)]).await?;
    loop {
        let message = channel.get_message(Some(id)).await?;
        match machine.on_message(message, listener.as_deref_mut())? {
            Step::Continue => {}
            Step::Resend => {
                request.cookie = machine.context.cookie.clone();
                id = next_id();
                debug!("Re-sending sync search as message {}", id);
                channel.send_message(&[request.to_message(id)]).await?;
            }
            Step::Done(result) => {
                request.cookie = machine.context.cookie.clone();
                if request.cookie.is_none() {
                    warn!("Sync poll finished without a cookie");
                }
                return Ok(SyncOutcome {
                    result,
                    cookie: machine.context.cookie,
                    refresh_deletes: machine.refresh_deletes,
                    events: machine.events,
                });
            }
        }
    }
}
