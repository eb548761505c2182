//! Incoming and outgoing bind channels
//!
//! Both channels are [`LongPoll`](crate::longpoll::LongPoll) loops over the
//! bind endpoint. The outgoing channel opens the session (negotiation) and
//! then flushes queued commands. The incoming channel only polls once the
//! session is bound.

use crate::bind::{self, ResponseClass};
use crate::codec::decode_chunks;
use crate::error::{Error, Result};
use crate::longpoll::{ChannelResponse, Prepared, Proceed, RequestHook, ResponseHandler};
use crate::orchestrator::SessionCore;
use crate::rid::nonce;
use crate::state::SessionPhase;
use crate::transport::{HttpReply, RequestDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub const INCOMING: &str = "incoming";
pub const OUTGOING: &str = "outgoing";
/// Reported as the channel when token refreshes exhaust the retry budget
pub const TOKEN_REFRESH: &str = "token-refresh";

/// Long poll receiving remote commands
pub struct IncomingChannel {
    core: Arc<SessionCore>,
}

impl IncomingChannel {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl RequestHook for IncomingChannel {
    async fn prepare(&self, _cycle: u64) -> Result<Prepared> {
        let session = self.core.session.lock();
        if !session.is_running() || !session.is_bound() {
            return Ok(Prepared::Skip);
        }
        let (Some(identity), Some(sid), Some(gsession_id)) = (
            session.bind_identity(),
            session.sid(),
            session.gsession_id(),
        ) else {
            return Ok(Prepared::Skip);
        };

        let url = bind::incoming_url(
            &self.core.base_url,
            &identity,
            sid,
            gsession_id,
            session.aid(),
            &nonce(),
        )?;
        Ok(Prepared::Request(RequestDescriptor::get(url)))
    }
}

#[async_trait]
impl ResponseHandler for IncomingChannel {
    async fn handle(&mut self, response: ChannelResponse) -> Proceed {
        let reply = match response.outcome {
            Ok(reply) => reply,
            Err(err) => {
                return self
                    .core
                    .transport_failure(INCOMING, err, response.consecutive_errors)
            }
        };

        let Some(sid) = self.core.current_sid(&response.descriptor) else {
            debug!(channel = INCOMING, status = %reply.status, "Ignoring reply of a previous session");
            return Proceed::Next;
        };

        if let Some(proceed) = self
            .core
            .handle_status(INCOMING, &response.descriptor, &reply)
            .await
        {
            return proceed;
        }

        let decoded = decode_chunks(&reply.body);
        if decoded.consumed < reply.body.len() {
            warn!(
                channel = INCOMING,
                dropped = reply.body.len() - decoded.consumed,
                "Reply ended inside a chunk"
            );
        }
        match self
            .core
            .dispatcher
            .dispatch_for_sid(&self.core.session, &sid, decoded.messages)
        {
            Some(report) => debug!(channel = INCOMING, ?report, "Batch dispatched"),
            None => debug!(channel = INCOMING, %sid, "Session changed while dispatching"),
        }
        self.core.publish_phase();
        Proceed::Next
    }
}

/// Long poll opening the session and flushing queued commands
pub struct OutgoingChannel {
    core: Arc<SessionCore>,
}

impl OutgoingChannel {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    fn is_negotiation(descriptor: &RequestDescriptor) -> bool {
        descriptor.query_value("SID").is_none()
    }
}

#[async_trait]
impl RequestHook for OutgoingChannel {
    async fn prepare(&self, _cycle: u64) -> Result<Prepared> {
        let token_pending = {
            let session = self.core.session.lock();
            session.is_running() && session.phase() == SessionPhase::TokenPending
        };
        if token_pending && !self.core.retry_token_refresh().await {
            return Ok(Prepared::Skip);
        }

        let mut session = self.core.session.lock();
        if !session.is_running() {
            return Ok(Prepared::Skip);
        }

        if !session.has_session_ids() {
            if session.phase() != SessionPhase::Connecting || session.bind_identity().is_none() {
                return Ok(Prepared::Skip);
            }
            let rid = session.next_rid();
            let Some(identity) = session.bind_identity() else {
                return Ok(Prepared::Skip);
            };
            let url = bind::negotiation_url(
                &self.core.base_url,
                &identity,
                session.previous(),
                rid,
                &nonce(),
            )?;
            debug!(channel = OUTGOING, previous = ?session.previous(), "Negotiating session");
            return Ok(Prepared::Request(RequestDescriptor::post(
                url,
                bind::negotiation_form(),
            )));
        }

        if !session.is_bound() || session.bind_identity().is_none() {
            return Ok(Prepared::Skip);
        }
        let Some(batch) = self.core.queue.take_batch() else {
            return Ok(Prepared::Skip);
        };

        let rid = session.next_rid();
        let (Some(identity), Some(sid), Some(gsession_id)) = (
            session.bind_identity(),
            session.sid(),
            session.gsession_id(),
        ) else {
            return Ok(Prepared::Skip);
        };
        let url = bind::flush_url(
            &self.core.base_url,
            &identity,
            sid,
            gsession_id,
            session.aid(),
            rid,
            &nonce(),
        )?;
        debug!(channel = OUTGOING, count = batch.len(), "Flushing outgoing commands");
        Ok(Prepared::Request(RequestDescriptor::post(
            url,
            bind::flush_form(&batch, session.ofs()),
        )))
    }
}

#[async_trait]
impl ResponseHandler for OutgoingChannel {
    async fn handle(&mut self, response: ChannelResponse) -> Proceed {
        let reply = match response.outcome {
            Ok(reply) => reply,
            Err(err) => {
                return self
                    .core
                    .transport_failure(OUTGOING, err, response.consecutive_errors)
            }
        };

        let negotiation = Self::is_negotiation(&response.descriptor);
        if !negotiation && self.core.current_sid(&response.descriptor).is_none() {
            debug!(channel = OUTGOING, status = %reply.status, "Ignoring reply of a previous session");
            return Proceed::Next;
        }

        if let Some(proceed) = self
            .core
            .handle_status(OUTGOING, &response.descriptor, &reply)
            .await
        {
            return proceed;
        }

        if negotiation {
            let decoded = decode_chunks(&reply.body);
            let report = self
                .core
                .dispatcher
                .dispatch(&self.core.session, decoded.messages, true);
            self.core.publish_phase();
            if !report.established {
                warn!(channel = OUTGOING, ?report, "Negotiation reply did not establish a session");
            }
        } else {
            let mut session = self.core.session.lock();
            if session.sid().map(str::to_string) != response.descriptor.query_value("SID") {
                // delivered to a session that is gone: keep the batch for the next one
                debug!(channel = OUTGOING, "Flush answered by a previous session");
                return Proceed::Next;
            }
            let sent = self.core.queue.acknowledge();
            let ofs = session.advance_ofs(sent);
            debug!(channel = OUTGOING, sent, ofs, "Outgoing commands acknowledged");
        }
        Proceed::Next
    }
}

impl SessionCore {
    /// Recovery for non-2xx bind replies; `None` when the body should be processed
    pub(crate) async fn handle_status(
        &self,
        channel: &'static str,
        descriptor: &RequestDescriptor,
        reply: &HttpReply,
    ) -> Option<Proceed> {
        let body = reply.text();
        match bind::classify(reply.status, &body) {
            ResponseClass::Ok => None,
            ResponseClass::UnknownSid => {
                warn!(channel, status = %reply.status, "Unknown SID, renegotiating");
                self.recover_unknown_sid(descriptor);
                Some(Proceed::Next)
            }
            ResponseClass::Gone => {
                warn!(channel, status = %reply.status, "Lounge token expired");
                match self.refresh_token(descriptor).await {
                    Ok(()) => Some(Proceed::Next),
                    Err(err) => Some(self.token_refresh_failed(err)),
                }
            }
            ResponseClass::Transient => {
                warn!(channel, status = %reply.status, "Transient server error");
                Some(Proceed::Next)
            }
            ResponseClass::Fatal(status) => {
                self.fail(Error::unexpected_status(status, body));
                Some(Proceed::Stop)
            }
        }
    }

    /// SID a request was issued under, when the session still uses it
    pub(crate) fn current_sid(&self, descriptor: &RequestDescriptor) -> Option<String> {
        let sid = descriptor.query_value("SID")?;
        (self.session.lock().sid() == Some(sid.as_str())).then_some(sid)
    }

    pub(crate) fn transport_failure(
        &self,
        channel: &'static str,
        err: reqwest::Error,
        consecutive_errors: u32,
    ) -> Proceed {
        warn!(channel, errors = consecutive_errors, "Request failed: {err}");
        if consecutive_errors > self.max_retries {
            self.fail(Error::RetryBudgetExceeded {
                channel,
                errors: consecutive_errors,
            });
            return Proceed::Stop;
        }
        Proceed::Next
    }
}
