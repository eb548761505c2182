//! Long-poll channel engine
//!
//! A [`LongPoll`] runs one request at a time in its own task:
//!
//! ```text
//! Idle -> Requesting -> Success | Error -> (delay) -> Idle ...
//!                                        \-> Stopped
//! ```
//!
//! Before each cycle the [`RequestHook`] describes the request (or asks for a
//! silent tick). After the request completes, the [`ResponseHandler`] decides
//! whether the loop continues. The handler may await arbitrary recovery work
//! before answering, which delays the next cycle without blocking the other
//! channel.
//!
//! [`LongPollHandle::stop`] cancels the pending timer and abandons a request
//! in flight, so a stopped channel exits without waiting for the server. A
//! result that still completes carries the generation it was issued under and
//! is discarded when that generation is stale.

use crate::error::Result;
use crate::transport::{HttpExecutor, HttpReply, RequestDescriptor};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Observable state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Requesting,
    Success,
    Error,
    Stopped,
}

/// What the pre-request hook wants for this cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Perform this request
    Request(RequestDescriptor),
    /// No I/O this cycle, tick again after the poll interval
    Skip,
}

/// Continuation returned by the response handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proceed {
    /// Schedule the next cycle
    Next,
    /// End the loop
    Stop,
}

/// Everything the handler learns about one cycle
#[derive(Debug)]
pub struct ChannelResponse {
    pub descriptor: RequestDescriptor,
    /// Number of requests issued before this one
    pub cycle: u64,
    pub outcome: std::result::Result<HttpReply, reqwest::Error>,
    /// Consecutive transport failures, this one included (0 on success)
    pub consecutive_errors: u32,
}

/// Builds the request for each cycle
#[async_trait]
pub trait RequestHook: Send + Sync + 'static {
    async fn prepare(&self, cycle: u64) -> Result<Prepared>;
}

/// Interprets each reply and decides whether to continue
#[async_trait]
pub trait ResponseHandler: Send + 'static {
    async fn handle(&mut self, response: ChannelResponse) -> Proceed;
}

/// Delay strategy after transport failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// Always wait the same delay
    Constant(Duration),
    /// `initial * multiplier^(n-1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// Running backoff state for one channel
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match (self.policy, self.current) {
            (BackoffPolicy::Constant(delay), _) => delay,
            (BackoffPolicy::Exponential { initial, .. }, None) => initial,
            (
                BackoffPolicy::Exponential {
                    multiplier, max, ..
                },
                Some(current),
            ) => current.mul_f64(multiplier.max(1.0)).min(max),
        };
        self.current = Some(next);
        next
    }
}

/// Scheduling parameters of a channel
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Name used in logs
    pub name: &'static str,
    /// Delay between a handled reply (or a skipped tick) and the next cycle
    pub interval: Duration,
    pub backoff: BackoffPolicy,
    /// Run a single cycle and stop
    pub single_shot: bool,
}

impl PollConfig {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            backoff: BackoffPolicy::default(),
            single_shot: false,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn single_shot(mut self) -> Self {
        self.single_shot = true;
        self
    }
}

/// A channel ready to be started
pub struct LongPoll<H: RequestHook> {
    config: PollConfig,
    executor: HttpExecutor,
    hook: Arc<H>,
}

impl<H: RequestHook> LongPoll<H> {
    pub fn new(config: PollConfig, executor: HttpExecutor, hook: H) -> Self {
        Self {
            config,
            executor,
            hook: Arc::new(hook),
        }
    }

    /// Spawn the polling task
    pub fn start<R: ResponseHandler>(self, handler: R) -> LongPollHandle {
        let generation = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(PollState::Idle);

        let task = PollTask {
            config: self.config,
            executor: self.executor,
            hook: self.hook,
            handler,
            generation: Arc::clone(&generation),
            cancel: cancel.clone(),
            state: state_tx,
        };
        let name = task.config.name;
        let join = tokio::spawn(task.run());

        LongPollHandle {
            name,
            generation,
            cancel,
            state: state_rx,
            join: Some(join),
        }
    }
}

/// Control side of a running channel
#[derive(Debug)]
pub struct LongPollHandle {
    name: &'static str,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
    state: watch::Receiver<PollState>,
    join: Option<JoinHandle<()>>,
}

impl LongPollHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel the pending timer and invalidate any in-flight request
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            debug!(channel = self.name, "Channel stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || *self.state.borrow() == PollState::Stopped
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    /// Wait for the polling task to exit
    pub async fn join(mut self) {
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(channel = self.name, "Channel task ended abnormally: {err}");
            }
        }
    }
}

struct PollTask<H: RequestHook, R: ResponseHandler> {
    config: PollConfig,
    executor: HttpExecutor,
    hook: Arc<H>,
    handler: R,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
    state: watch::Sender<PollState>,
}

impl<H: RequestHook, R: ResponseHandler> PollTask<H, R> {
    async fn run(mut self) {
        let name = self.config.name;
        let mut cycle: u64 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut backoff = Backoff::new(self.config.backoff);

        debug!(channel = name, "Channel started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(PollState::Idle);

            let descriptor = match self.hook.prepare(cycle).await {
                Ok(Prepared::Request(descriptor)) => descriptor,
                Ok(Prepared::Skip) => {
                    trace!(channel = name, "Skipping cycle");
                    if self.config.single_shot || !pause(&self.cancel, self.config.interval).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(channel = name, "Request preparation failed: {err}");
                    if self.config.single_shot || !pause(&self.cancel, backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let issued_under = self.generation.load(Ordering::SeqCst);
            self.state.send_replace(PollState::Requesting);
            debug!(channel = name, cycle, method = %descriptor.method, "Issuing request");

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(channel = name, cycle, "Request abandoned, channel stopped");
                    break;
                }
                outcome = self.executor.execute(&descriptor) => outcome,
            };

            if self.generation.load(Ordering::SeqCst) != issued_under {
                debug!(channel = name, cycle, "Discarding reply of a stopped channel");
                break;
            }

            let failed = outcome.is_err();
            if failed {
                consecutive_errors = consecutive_errors.saturating_add(1);
                self.state.send_replace(PollState::Error);
            } else {
                consecutive_errors = 0;
                backoff.reset();
                self.state.send_replace(PollState::Success);
            }

            let response = ChannelResponse {
                descriptor,
                cycle,
                outcome,
                consecutive_errors,
            };
            cycle += 1;

            let proceed = self.handler.handle(response).await;
            if proceed == Proceed::Stop || self.config.single_shot {
                break;
            }

            let delay = if failed {
                backoff.next_delay()
            } else {
                self.config.interval
            };
            if !pause(&self.cancel, delay).await {
                break;
            }
        }

        self.state.send_replace(PollState::Stopped);
        debug!(channel = name, cycles = cycle, "Channel stopped");
    }
}

/// Sleep unless cancelled; returns false when cancelled
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffPolicy::Exponential {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(3),
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_constant_backoff() {
        let mut backoff = Backoff::new(BackoffPolicy::Constant(Duration::from_secs(1)));
        for _ in 0..4 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_multiplier_below_one_never_shrinks() {
        let mut backoff = Backoff::new(BackoffPolicy::Exponential {
            initial: Duration::from_millis(200),
            multiplier: 0.5,
            max: Duration::from_secs(1),
        });
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }
}
