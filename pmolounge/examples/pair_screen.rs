//! Pair with a phone and print the commands it sends
//!
//! The launch data is what the discovery layer receives when a phone asks
//! the receiver to start the app (`pairingCode=...&v=...&t=...`).
//!
//! Usage:
//!   cargo run --example pair_screen -- <launch_data>
//!
//! Example:
//!   RUST_LOG=pmolounge=debug cargo run --example pair_screen -- "pairingCode=123456789012"

use pmolounge::{
    LoungeConfig, LoungeSession, OutgoingMessage, PlaybackEvent, PlayerState, SessionPhase,
};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <launch_data>", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} \"pairingCode=123456789012&v=dQw4w9WgXcQ\"", args[0]);
        std::process::exit(1);
    }

    let config = LoungeConfig::load("")?;
    let session = LoungeSession::new(config)?;
    let mut events = session.subscribe_playback();
    let mut phases = session.watch_phase();

    let launch = session.start(&args[1]).await?;
    println!("=== Lounge receiver ===");
    println!("Device id: {}", session.device_id());
    println!("Screen id: {}", session.screen_id().unwrap_or_default());

    let mut now_playing = launch.video_id.unwrap_or_default();
    let mut position = launch
        .start_position
        .map(|p| p.as_secs_f64())
        .unwrap_or_default();
    let mut state = PlayerState::Stopped;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                println!("Session: {phase}");
                if phase == SessionPhase::Stopped {
                    if let Some(err) = session.last_error() {
                        eprintln!("Session failed: {err}");
                    }
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("Remote: {event:?}");
                match event {
                    PlaybackEvent::Load { video_id, start_position, .. } => {
                        now_playing = video_id;
                        position = start_position;
                        state = PlayerState::Playing;
                    }
                    PlaybackEvent::Play => state = PlayerState::Playing,
                    PlaybackEvent::Pause => state = PlayerState::Paused,
                    PlaybackEvent::Seek { position: p } => position = p,
                    PlaybackEvent::Stop => state = PlayerState::Stopped,
                    PlaybackEvent::NowPlayingRequested => {}
                    _ => continue,
                }
                session.send_message(OutgoingMessage::now_playing(&now_playing, position, state))?;
            }
        }
    }

    session.quit().await;
    Ok(())
}
