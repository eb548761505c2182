//! Command dispatcher
//!
//! Decoded messages are first checked against the session's `aid`. Session
//! bookkeeping commands (`c`, `S`, `noop`) are consumed here; everything else
//! is published to subscribers once the session lock is released.

use crate::events::PlaybackEvent;
use crate::models::InboundMessage;
use crate::session::{Applied, Session};
use crate::state::{SessionEvent, SessionPhase};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Callback registered for one command name
pub type CommandHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Fan-out to every live receiver
struct EventBus<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Returns the number of receivers reached
    fn broadcast(&self, event: &T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }
}

/// Summary of one dispatched batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages accepted against `aid`
    pub applied: usize,
    /// Messages dropped (stale or session not running)
    pub discarded: usize,
    /// Gaps seen in this batch
    pub gaps: usize,
    /// This batch completed SID and gsessionid
    pub established: bool,
}

/// Routes inbound commands to handlers and subscribers
///
/// ```
/// use parking_lot::Mutex;
/// use pmolounge::{Dispatcher, InboundMessage, Session, SessionEvent};
///
/// # tokio_test::block_on(async {
/// let mut session = Session::new("device", "Receiver");
/// session.apply(SessionEvent::Start);
/// let session = Mutex::new(session);
///
/// let dispatcher = Dispatcher::new();
/// let mut rx = dispatcher.subscribe();
/// dispatcher.dispatch(&session, vec![InboundMessage::new(1, "play", vec![])], false);
///
/// assert_eq!(rx.recv().await.unwrap().command, "play");
/// # });
/// ```
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<CommandHandler>>>,
    messages: EventBus<InboundMessage>,
    playback: EventBus<PlaybackEvent>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            messages: EventBus::new(),
            playback: EventBus::new(),
        }
    }

    /// Register `handler` for `command`; handlers run in registration order
    pub fn on<F>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(command.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Receive every forwarded command
    pub fn subscribe(&self) -> UnboundedReceiver<InboundMessage> {
        self.messages.subscribe()
    }

    /// Receive commands that map to a [`PlaybackEvent`]
    pub fn subscribe_playback(&self) -> UnboundedReceiver<PlaybackEvent> {
        self.playback.subscribe()
    }

    /// Apply a decoded batch to `session` and publish what remains.
    ///
    /// `fresh` marks the reply to a negotiation request: `aid` restarts at
    /// -1 before the first message is applied.
    pub fn dispatch(
        &self,
        session: &Mutex<Session>,
        batch: Vec<InboundMessage>,
        fresh: bool,
    ) -> DispatchReport {
        self.dispatch_checked(session, None, batch, fresh)
            .unwrap_or_default()
    }

    /// Like [`dispatch`](Self::dispatch) for a reply received under `sid`.
    ///
    /// Returns `None` without touching the session when it has moved on to
    /// another SID since the request was issued.
    pub fn dispatch_for_sid(
        &self,
        session: &Mutex<Session>,
        sid: &str,
        batch: Vec<InboundMessage>,
    ) -> Option<DispatchReport> {
        self.dispatch_checked(session, Some(sid), batch, false)
    }

    fn dispatch_checked(
        &self,
        session: &Mutex<Session>,
        expected_sid: Option<&str>,
        batch: Vec<InboundMessage>,
        fresh: bool,
    ) -> Option<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut forward = Vec::new();

        {
            let mut session = session.lock();
            if let Some(expected) = expected_sid {
                if session.sid() != Some(expected) {
                    debug!(
                        received_under = expected,
                        current = session.sid().unwrap_or_default(),
                        messages = batch.len(),
                        "Dropping batch of a previous session"
                    );
                    return None;
                }
            }
            if fresh {
                session.begin_fresh_batch();
            }

            for message in batch {
                let applied = session.apply_message(message.index);
                if !applied.is_applied() {
                    report.discarded += 1;
                    continue;
                }
                report.applied += 1;
                if matches!(applied, Applied::Gap { .. }) {
                    report.gaps += 1;
                }

                match message.command.as_str() {
                    "c" => match message.first_str() {
                        Some(sid) => session.capture_sid(sid),
                        None => warn!(args = ?message.args, "Session id message without id"),
                    },
                    "S" => match message.first_str() {
                        Some(gsession) => session.capture_gsession(gsession),
                        None => warn!(args = ?message.args, "gsessionid message without id"),
                    },
                    "noop" => {}
                    _ => forward.push(message),
                }
            }

            if session.phase() == SessionPhase::Connecting && session.has_session_ids() {
                info!(sid = session.sid().unwrap_or_default(), "Session established");
                report.established = session.apply(SessionEvent::SessionEstablished).is_some();
            }
        }

        for message in &forward {
            self.publish(message);
        }
        Some(report)
    }

    fn publish(&self, message: &InboundMessage) {
        let handlers: Vec<CommandHandler> = self
            .handlers
            .read()
            .get(&message.command)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(message);
        }

        let mut reached = handlers.len() + self.messages.broadcast(message);
        if let Some(event) = PlaybackEvent::from_message(message) {
            reached += self.playback.broadcast(&event);
        }

        if reached == 0 {
            debug!(command = %message.command, index = message.index, "No subscriber for command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connecting_session() -> Mutex<Session> {
        let mut session = Session::new("device", "Receiver");
        session.set_lounge_token("token");
        for event in [
            SessionEvent::Start,
            SessionEvent::TokenAcquired,
            SessionEvent::Registered,
        ] {
            session.apply(event);
        }
        Mutex::new(session)
    }

    fn bootstrap() -> Vec<InboundMessage> {
        vec![
            InboundMessage::new(0, "c", vec![json!("SID1"), json!(""), json!(8)]),
            InboundMessage::new(1, "S", vec![json!("GS1")]),
        ]
    }

    fn bound_dispatcher() -> (Dispatcher, Mutex<Session>) {
        let dispatcher = Dispatcher::new();
        let session = connecting_session();
        let report = dispatcher.dispatch(&session, bootstrap(), true);
        assert!(report.established);
        (dispatcher, session)
    }

    #[test]
    fn test_bootstrap_binds_session_without_publishing() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let session = connecting_session();

        let report = dispatcher.dispatch(&session, bootstrap(), true);

        assert!(report.established);
        let session = session.lock();
        assert_eq!(session.phase(), SessionPhase::Bound);
        assert_eq!(session.sid(), Some("SID1"));
        assert_eq!(session.gsession_id(), Some("GS1"));
        assert_eq!(session.aid(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handler_fires_once_per_new_index() {
        let (dispatcher, session) = bound_dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        dispatcher.on("pause", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&session, vec![InboundMessage::new(2, "pause", vec![])], false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.lock().aid(), 2);

        // replayed index
        let report =
            dispatcher.dispatch(&session, vec![InboundMessage::new(2, "pause", vec![])], false);
        assert_eq!(report.discarded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.lock().aid(), 2);
    }

    #[test]
    fn test_gap_still_fires_handler() {
        let (dispatcher, session) = bound_dispatcher();
        let mut rx = dispatcher.subscribe();

        let report =
            dispatcher.dispatch(&session, vec![InboundMessage::new(7, "play", vec![])], false);

        assert_eq!(report.gaps, 1);
        assert_eq!(session.lock().aid(), 7);
        assert_eq!(session.lock().gaps(), 1);
        assert_eq!(rx.try_recv().unwrap().command, "play");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let (dispatcher, session) = bound_dispatcher();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            dispatcher.on("next", move |_| order.lock().push(tag));
        }

        dispatcher.dispatch(&session, vec![InboundMessage::new(2, "next", vec![])], false);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_noop_is_not_forwarded() {
        let (dispatcher, session) = bound_dispatcher();
        let mut rx = dispatcher.subscribe();
        let report =
            dispatcher.dispatch(&session, vec![InboundMessage::new(2, "noop", vec![])], false);
        assert_eq!(report.applied, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_playback_subscribers_receive_typed_events() {
        let (dispatcher, session) = bound_dispatcher();
        let mut playback = dispatcher.subscribe_playback();

        dispatcher.dispatch(
            &session,
            vec![InboundMessage::new(2, "seekTo", vec![json!({"newTime": "30"})])],
            false,
        );
        assert_eq!(
            playback.try_recv().unwrap(),
            PlaybackEvent::Seek { position: 30.0 }
        );
    }

    #[test]
    fn test_fresh_batch_resets_aid() {
        let (dispatcher, session) = bound_dispatcher();
        dispatcher.dispatch(&session, vec![InboundMessage::new(40, "play", vec![])], false);
        assert_eq!(session.lock().aid(), 40);

        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch(&session, vec![InboundMessage::new(0, "play", vec![])], true);
        assert_eq!(session.lock().aid(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_batch_from_previous_sid_is_dropped() {
        let (dispatcher, session) = bound_dispatcher();
        let mut rx = dispatcher.subscribe();

        let report = dispatcher.dispatch_for_sid(
            &session,
            "SID0",
            vec![InboundMessage::new(50, "play", vec![])],
        );

        assert!(report.is_none());
        assert_eq!(session.lock().aid(), 1);
        assert!(rx.try_recv().is_err());

        let report = dispatcher
            .dispatch_for_sid(&session, "SID1", vec![InboundMessage::new(2, "play", vec![])])
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(rx.try_recv().unwrap().index, 2);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let (dispatcher, session) = bound_dispatcher();
        drop(dispatcher.subscribe());
        let report =
            dispatcher.dispatch(&session, vec![InboundMessage::new(2, "play", vec![])], false);
        assert_eq!(report.applied, 1);
        assert!(dispatcher.messages.subscribers.lock().is_empty());
    }
}
