//! Mutable state of one lounge session
//!
//! The orchestrator owns a single [`Session`] behind a mutex. Channels read
//! it to build requests and change it only through the methods below, so
//! every invariant on `aid`, `sid` and the phase is enforced here.

use crate::bind::{BindIdentity, PreviousSession};
use crate::rid::RequestIds;
use crate::state::{step, Effect, SessionEvent, SessionPhase, Transition};
use tracing::{debug, info, warn};

/// Outcome of applying one inbound message index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Session not running, message dropped
    NotRunning,
    /// `index <= aid`, already seen
    Stale,
    /// `index == aid + 1`
    InOrder,
    /// `index > aid + 1`; messages in between were lost
    Gap { expected: i64, received: i64 },
}

impl Applied {
    /// True when the message should reach subscribers
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::InOrder | Self::Gap { .. })
    }
}

#[derive(Debug)]
pub struct Session {
    device_id: String,
    device_name: String,
    screen_id: Option<String>,
    lounge_token: Option<String>,
    sid: Option<String>,
    gsession_id: Option<String>,
    aid: i64,
    previous: Option<PreviousSession>,
    running: bool,
    phase: SessionPhase,
    ofs: u64,
    gaps: u64,
    ids: RequestIds,
}

impl Session {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            screen_id: None,
            lounge_token: None,
            sid: None,
            gsession_id: None,
            aid: 0,
            previous: None,
            running: false,
            phase: SessionPhase::Unbound,
            ofs: 0,
            gaps: 0,
            ids: RequestIds::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_request_ids(mut self, ids: RequestIds) -> Self {
        self.ids = ids;
        self
    }

    /// Feed an event to the state machine and apply its session-local effect.
    ///
    /// The returned transition tells the caller which channel-level effect
    /// (start, resume, stop) remains to be carried out.
    pub fn apply(&mut self, event: SessionEvent) -> Option<Transition> {
        let Some(transition) = step(self.phase, event) else {
            debug!(phase = %self.phase, ?event, "Event ignored in current phase");
            return None;
        };

        match transition.effect {
            Effect::FetchToken => self.running = true,
            Effect::ClearSid => {
                if let Some(sid) = self.sid.take() {
                    self.previous = Some(PreviousSession { sid, aid: self.aid });
                }
                self.gsession_id = None;
                self.ids.restart();
            }
            Effect::RefreshToken => {
                self.sid = None;
                self.gsession_id = None;
                self.lounge_token = None;
                self.previous = None;
                self.ids.restart();
            }
            Effect::StopChannels => self.running = false,
            Effect::None | Effect::Register | Effect::StartChannels | Effect::ResumeChannels => {}
        }
        if transition.to == SessionPhase::Bound {
            self.previous = None;
        }

        info!(from = %self.phase, to = %transition.to, ?event, "Session phase change");
        self.phase = transition.to;
        Some(transition)
    }

    /// A negotiation reply starts a new message sequence
    pub fn begin_fresh_batch(&mut self) {
        debug!(previous_aid = self.aid, "Fresh session batch, resetting AID");
        self.aid = -1;
        self.ofs = 0;
    }

    /// Track `index` against `aid`
    pub fn apply_message(&mut self, index: i64) -> Applied {
        if !self.running {
            return Applied::NotRunning;
        }
        if index <= self.aid {
            debug!(index, aid = self.aid, "Discarding already applied message");
            return Applied::Stale;
        }

        let expected = self.aid + 1;
        self.aid = index;
        if index == expected {
            Applied::InOrder
        } else {
            self.gaps += 1;
            warn!(expected, received = index, "Gap in inbound message sequence");
            Applied::Gap {
                expected,
                received: index,
            }
        }
    }

    pub fn capture_sid(&mut self, sid: impl Into<String>) {
        self.sid = Some(sid.into());
    }

    pub fn capture_gsession(&mut self, gsession_id: impl Into<String>) {
        self.gsession_id = Some(gsession_id.into());
    }

    /// Both SID and gsessionid are known
    pub fn has_session_ids(&self) -> bool {
        self.sid.is_some() && self.gsession_id.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.phase == SessionPhase::Bound
    }

    pub fn set_screen_id(&mut self, screen_id: impl Into<String>) {
        self.screen_id = Some(screen_id.into());
    }

    pub fn set_lounge_token(&mut self, token: impl Into<String>) {
        self.lounge_token = Some(token.into());
    }

    /// Identity parameters for bind requests, once a token is known
    pub fn bind_identity(&self) -> Option<BindIdentity<'_>> {
        Some(BindIdentity {
            device_id: &self.device_id,
            device_name: &self.device_name,
            lounge_token: self.lounge_token.as_deref()?,
        })
    }

    pub fn next_rid(&mut self) -> u32 {
        self.ids.next_request_id()
    }

    /// Record `sent` messages as delivered, returning the offset they used
    pub fn advance_ofs(&mut self, sent: usize) -> u64 {
        let used = self.ofs;
        self.ofs += sent as u64;
        used
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn screen_id(&self) -> Option<&str> {
        self.screen_id.as_deref()
    }

    pub fn lounge_token(&self) -> Option<&str> {
        self.lounge_token.as_deref()
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn gsession_id(&self) -> Option<&str> {
        self.gsession_id.as_deref()
    }

    pub fn aid(&self) -> i64 {
        self.aid
    }

    pub fn previous(&self) -> Option<&PreviousSession> {
        self.previous.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn ofs(&self) -> u64 {
        self.ofs
    }

    /// Number of gaps seen in the inbound sequence
    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}
