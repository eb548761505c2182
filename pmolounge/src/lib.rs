//! Lounge remote-control session client for PMOLounge
//!
//! This crate lets a headless media receiver pair with a phone over the
//! "lounge" long-poll API and receive playback commands from it.
//!
//! # Features
//!
//! - **Pairing**: screen id generation, lounge token retrieval, pairing code
//!   registration
//! - **Bind channels**: two independent long polls, one receiving remote
//!   commands, one opening the session and flushing outgoing commands
//! - **Recovery**: "Unknown SID" renegotiation with `OSID`/`OAID`, lounge token
//!   refresh on `410 Gone`, configurable backoff on transport failures
//! - **Dispatch**: per-command handlers, raw message subscribers and typed
//!   [`PlaybackEvent`] subscribers
//! - **Configuration**: layered YAML with environment overrides
//!
//! # Session lifecycle
//!
//! ```text
//! Unbound -> TokenPending -> Registering -> Connecting -> Bound
//!                 ^                             ^    |      |
//!                 |                             |    v      v
//!                 +------- 410 Gone ------ Reconnecting <- Unknown SID
//! ```
//!
//! Any other non-2xx bind reply, or a channel exhausting its retry budget,
//! moves the session to `Stopped`.
//!
//! # Example
//!
//! ```no_run
//! use pmolounge::{LoungeConfig, LoungeSession, OutgoingMessage, PlaybackEvent, PlayerState};
//!
//! #[tokio::main]
//! async fn main() -> pmolounge::Result<()> {
//!     let session = LoungeSession::new(LoungeConfig::load("")?)?;
//!     let mut events = session.subscribe_playback();
//!
//!     let launch = session.start("pairingCode=123456789012&v=dQw4w9WgXcQ").await?;
//!     println!("Paired, first video: {:?}", launch.video_id);
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             PlaybackEvent::NowPlayingRequested => {
//!                 session.send_message(OutgoingMessage::now_playing(
//!                     "dQw4w9WgXcQ",
//!                     0.0,
//!                     PlayerState::Playing,
//!                 ))?;
//!             }
//!             PlaybackEvent::Stop => break,
//!             other => println!("{other:?}"),
//!         }
//!     }
//!
//!     session.quit().await;
//!     Ok(())
//! }
//! ```

pub mod bind;
pub mod channels;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod launch;
pub mod longpoll;
pub mod models;
pub mod orchestrator;
pub mod pairing;
pub mod queue;
pub mod rid;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports
pub use codec::{decode_chunks, encode_chunk, ChunkDecoder, Decoded};
pub use config::LoungeConfig;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{Error, Result};
pub use events::PlaybackEvent;
pub use launch::LaunchRequest;
pub use longpoll::{
    BackoffPolicy, ChannelResponse, LongPoll, LongPollHandle, PollConfig, PollState, Prepared,
    Proceed, RequestHook, ResponseHandler,
};
pub use models::{InboundMessage, OutgoingMessage, PlayerState};
pub use orchestrator::LoungeSession;
pub use pairing::PairingClient;
pub use queue::OutgoingQueue;
pub use session::{Applied, Session};
pub use state::{Effect, SessionEvent, SessionPhase, Transition};
pub use transport::{HttpExecutor, HttpMethod, HttpReply, RequestDescriptor};
