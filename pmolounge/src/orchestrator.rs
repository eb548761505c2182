//! Session orchestrator
//!
//! [`LoungeSession`] drives the bootstrap (screen id, lounge token, pairing
//! code registration), starts both channels, and carries out the recovery
//! transitions the channels request.
//!
//! ```no_run
//! use pmolounge::{LoungeConfig, LoungeSession, PlaybackEvent};
//!
//! # async fn run() -> pmolounge::Result<()> {
//! let session = LoungeSession::new(LoungeConfig::load("")?)?;
//! let mut events = session.subscribe_playback();
//! session.start("pairingCode=123456789012").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if event == PlaybackEvent::Stop {
//!         break;
//!     }
//! }
//! session.quit().await;
//! # Ok(())
//! # }
//! ```

use crate::bind::BindIdentity;
use crate::channels::{IncomingChannel, OutgoingChannel, INCOMING, OUTGOING, TOKEN_REFRESH};
use crate::config::LoungeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::events::PlaybackEvent;
use crate::identity::device_identity;
use crate::launch::LaunchRequest;
use crate::longpoll::{LongPoll, LongPollHandle, PollConfig, Proceed};
use crate::models::{InboundMessage, OutgoingMessage, PlayerState};
use crate::pairing::PairingClient;
use crate::queue::OutgoingQueue;
use crate::session::Session;
use crate::state::{Effect, SessionEvent, SessionPhase, Transition};
use crate::transport::{HttpExecutor, RequestDescriptor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tracing::{error, info, warn};
use url::Url;

/// State shared by the orchestrator and both channels
pub(crate) struct SessionCore {
    pub(crate) session: Mutex<Session>,
    pub(crate) queue: OutgoingQueue,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) base_url: Url,
    pub(crate) max_retries: u32,
    pairing: PairingClient,
    executor: HttpExecutor,
    poll_incoming: PollConfig,
    poll_outgoing: PollConfig,
    /// Serialises token refreshes between channels
    recovery: tokio::sync::Mutex<()>,
    /// Consecutive failed token refreshes
    refresh_failures: AtomicU32,
    phase_tx: watch::Sender<SessionPhase>,
    channels: Mutex<Vec<LongPollHandle>>,
    last_error: Mutex<Option<Arc<Error>>>,
}

impl SessionCore {
    /// Apply `event` and publish the resulting phase
    pub(crate) fn apply(&self, event: SessionEvent) -> Option<Transition> {
        let transition = self.session.lock().apply(event);
        self.publish_phase();
        transition
    }

    pub(crate) fn publish_phase(&self) {
        let phase = self.session.lock().phase();
        self.phase_tx.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    /// Forget the SID and let the outgoing channel renegotiate with OSID/OAID
    pub(crate) fn recover_unknown_sid(&self, descriptor: &RequestDescriptor) {
        let mut session = self.session.lock();
        let stale_sid = descriptor.query_value("SID");
        if stale_sid.is_some() && stale_sid.as_deref() != session.sid() {
            // the other channel already recovered
            return;
        }
        if session.apply(SessionEvent::UnknownSid).is_some() {
            session.apply(SessionEvent::ReconnectReady);
        }
        drop(session);
        self.publish_phase();
    }

    /// Enter TokenPending and fetch a new lounge token for the current screen id.
    ///
    /// A refresh already performed by the other channel for the same stale
    /// token is not repeated.
    pub(crate) async fn refresh_token(&self, descriptor: &RequestDescriptor) -> Result<()> {
        let _guard = self.recovery.lock().await;

        {
            let mut session = self.session.lock();
            if !session.is_running() {
                return Ok(());
            }
            let stale_token = descriptor.query_value("loungeIdToken");
            if session.phase() != SessionPhase::TokenPending
                && session.lounge_token().is_some()
                && stale_token.as_deref() != session.lounge_token()
            {
                return Ok(());
            }
            session.apply(SessionEvent::Gone);
        }
        self.publish_phase();

        self.fetch_token().await
    }

    /// Retry a refresh left pending by an earlier failure.
    ///
    /// Returns false when the session is still waiting for a token.
    pub(crate) async fn retry_token_refresh(&self) -> bool {
        let result = {
            let _guard = self.recovery.lock().await;
            let pending = {
                let session = self.session.lock();
                session.is_running() && session.phase() == SessionPhase::TokenPending
            };
            if !pending {
                return true;
            }
            self.fetch_token().await
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                self.token_refresh_failed(err);
                false
            }
        }
    }

    /// Transient failures keep the session in TokenPending until the retry
    /// budget runs out; anything else stops it.
    pub(crate) fn token_refresh_failed(&self, err: Error) -> Proceed {
        if !err.is_transient() {
            self.fail(err);
            return Proceed::Stop;
        }

        let failures = self.refresh_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, "Lounge token refresh failed, will retry: {err}");
        if failures > self.max_retries {
            self.fail(Error::RetryBudgetExceeded {
                channel: TOKEN_REFRESH,
                errors: failures,
            });
            return Proceed::Stop;
        }
        Proceed::Next
    }

    /// Caller holds `recovery`
    async fn fetch_token(&self) -> Result<()> {
        let screen_id = {
            let session = self.session.lock();
            session.screen_id().map(str::to_string)
        };
        let screen_id = screen_id.ok_or(Error::TokenMissing)?;
        let token = self.pairing.get_lounge_token(&screen_id).await?;

        {
            let mut session = self.session.lock();
            session.set_lounge_token(token);
            session.apply(SessionEvent::TokenRefreshed);
        }
        self.refresh_failures.store(0, Ordering::SeqCst);
        self.publish_phase();
        info!(%screen_id, "Lounge token refreshed");
        Ok(())
    }

    /// Record `err`, stop the session and both channels
    pub(crate) fn fail(&self, err: Error) {
        error!("Lounge session failed: {err}");
        *self.last_error.lock() = Some(Arc::new(err));
        if let Some(transition) = self.apply(SessionEvent::Fatal) {
            if transition.effect == Effect::StopChannels {
                self.stop_channels();
            }
        }
    }

    fn stop_channels(&self) -> Vec<LongPollHandle> {
        let handles: Vec<_> = self.channels.lock().drain(..).collect();
        for handle in &handles {
            handle.stop();
        }
        handles
    }

    fn start_channels(self: &Arc<Self>) {
        let incoming = LongPoll::new(
            self.poll_incoming.clone(),
            self.executor.clone(),
            IncomingChannel::new(Arc::clone(self)),
        )
        .start(IncomingChannel::new(Arc::clone(self)));
        let outgoing = LongPoll::new(
            self.poll_outgoing.clone(),
            self.executor.clone(),
            OutgoingChannel::new(Arc::clone(self)),
        )
        .start(OutgoingChannel::new(Arc::clone(self)));

        {
            let mut channels = self.channels.lock();
            channels.push(incoming);
            channels.push(outgoing);
        }
        info!("Lounge channels started");

        // a channel may have failed before its handle was registered
        if !self.session.lock().is_running() {
            self.stop_channels();
        }
    }
}

/// A lounge remote-control session
#[derive(Clone)]
pub struct LoungeSession {
    core: Arc<SessionCore>,
}

impl LoungeSession {
    /// Build a session from `config`; nothing is sent before [`start`](Self::start)
    pub fn new(config: LoungeConfig) -> Result<Self> {
        let client = config.http_client()?;
        Self::with_client(config, client)
    }

    /// Build a session around an existing HTTP client
    pub fn with_client(config: LoungeConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = config.base_url()?;
        let executor = HttpExecutor::new(client, config.polling.request_timeout());
        let device_id = device_identity(config.device.id.as_deref());
        let backoff = config.polling.backoff.policy();
        let interval = config.polling.interval();

        info!(device_id = %device_id, name = %config.device.name, "Lounge session created");

        let (phase_tx, _) = watch::channel(SessionPhase::Unbound);
        let core = SessionCore {
            session: Mutex::new(Session::new(device_id, config.device.name.clone())),
            queue: OutgoingQueue::new(),
            dispatcher: Dispatcher::new(),
            pairing: PairingClient::new(executor.clone(), base_url.clone()),
            base_url,
            max_retries: config.polling.max_retries,
            executor,
            poll_incoming: PollConfig::new(INCOMING, interval).with_backoff(backoff),
            poll_outgoing: PollConfig::new(OUTGOING, interval).with_backoff(backoff),
            recovery: tokio::sync::Mutex::new(()),
            refresh_failures: AtomicU32::new(0),
            phase_tx,
            channels: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        };

        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Pair with the remote described by `launch_data` and start the channels.
    ///
    /// Returns once the pairing code is registered; the session becomes
    /// [`SessionPhase::Bound`] when the first negotiation succeeds.
    pub async fn start(&self, launch_data: &str) -> Result<LaunchRequest> {
        let launch = LaunchRequest::parse(launch_data)?;

        if self.core.session.lock().phase() != SessionPhase::Unbound {
            return Err(Error::AlreadyStarted);
        }
        self.core.apply(SessionEvent::Start);

        if let Err(err) = self.bootstrap(&launch).await {
            if err.is_transient() {
                warn!("Lounge bootstrap failed, service unavailable: {err}");
            } else {
                error!("Lounge bootstrap failed: {err}");
            }
            self.core.apply(SessionEvent::Fatal);
            return Err(err);
        }

        if let Some(video_id) = &launch.video_id {
            let position = launch.start_position.unwrap_or_default().as_secs_f64();
            self.core.queue.push(OutgoingMessage::now_playing(
                video_id,
                position,
                PlayerState::Buffering,
            ));
        }
        Ok(launch)
    }

    async fn bootstrap(&self, launch: &LaunchRequest) -> Result<()> {
        let pairing = &self.core.pairing;

        let screen_id = pairing.generate_screen_id().await?;
        let token = pairing.get_lounge_token(&screen_id).await?;
        {
            let mut session = self.core.session.lock();
            session.set_screen_id(screen_id.clone());
            session.set_lounge_token(token);
        }
        self.core.apply(SessionEvent::TokenAcquired);

        pairing
            .register_pairing_code(&launch.pairing_code, &screen_id)
            .await?;

        match self.core.apply(SessionEvent::Registered) {
            Some(transition) if transition.effect == Effect::StartChannels => {
                self.core.start_channels();
                Ok(())
            }
            _ => Err(Error::NotRunning),
        }
    }

    /// Queue a command for the next outgoing flush
    pub fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        if self.phase() == SessionPhase::Stopped {
            return Err(Error::NotRunning);
        }
        self.core.queue.push(message);
        Ok(())
    }

    /// Run `handler` for each `command` received
    pub fn on<F>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.core.dispatcher.on(command, handler);
    }

    /// Every forwarded remote command
    pub fn subscribe(&self) -> UnboundedReceiver<InboundMessage> {
        self.core.dispatcher.subscribe()
    }

    /// Remote commands mapped to playback events
    pub fn subscribe_playback(&self) -> UnboundedReceiver<PlaybackEvent> {
        self.core.dispatcher.subscribe_playback()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.core.phase_tx.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.core.phase_tx.subscribe()
    }

    /// Error that stopped the session, if any
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.core.last_error.lock().clone()
    }

    pub fn device_id(&self) -> String {
        self.core.session.lock().device_id().to_string()
    }

    pub fn screen_id(&self) -> Option<String> {
        self.core.session.lock().screen_id().map(str::to_string)
    }

    pub fn sid(&self) -> Option<String> {
        self.core.session.lock().sid().map(str::to_string)
    }

    pub fn aid(&self) -> i64 {
        self.core.session.lock().aid()
    }

    /// Bind parameters currently in use, as `(device id, lounge token)`
    pub fn bind_identity(&self) -> Option<(String, String)> {
        let session = self.core.session.lock();
        session.bind_identity().map(|BindIdentity { device_id, lounge_token, .. }| {
            (device_id.to_string(), lounge_token.to_string())
        })
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Stop the session and wait for both channels to exit
    pub async fn quit(&self) {
        self.core.apply(SessionEvent::Quit);
        let handles = self.core.stop_channels();
        for handle in handles {
            handle.join().await;
        }
        info!("Lounge session stopped");
    }
}
