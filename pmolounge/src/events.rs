//! Typed playback events derived from remote commands

use crate::models::InboundMessage;
use serde_json::Value;
use tracing::warn;

/// Playback action requested by a remote
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Load a video (from `setPlaylist` or `setVideo`)
    Load {
        video_id: String,
        video_ids: Vec<String>,
        current_index: usize,
        start_position: f64,
        list_id: Option<String>,
    },
    Play,
    Pause,
    Seek { position: f64 },
    Stop,
    SetVolume { volume: u32, muted: bool },
    Next,
    Previous,
    /// The remote asks what is playing; answer with `OutgoingMessage::now_playing`
    NowPlayingRequested,
    RemoteConnected { name: Option<String> },
    RemoteDisconnected { name: Option<String> },
}

impl PlaybackEvent {
    /// Map a remote command, `None` for commands without a playback meaning
    pub fn from_message(message: &InboundMessage) -> Option<Self> {
        let event = match message.command.as_str() {
            "setPlaylist" | "setVideo" => return load_event(message),
            "play" => Self::Play,
            "pause" => Self::Pause,
            "seekTo" => match field_f64(message, "newTime") {
                Some(position) => Self::Seek { position },
                None => {
                    warn!(args = ?message.args, "seekTo without a usable newTime");
                    return None;
                }
            },
            "stopVideo" => Self::Stop,
            "setVolume" => {
                let volume = field_f64(message, "volume")?.clamp(0.0, 100.0) as u32;
                let muted = field_str(message, "muted").is_some_and(|m| m == "true");
                Self::SetVolume { volume, muted }
            }
            "next" => Self::Next,
            "previous" => Self::Previous,
            "getNowPlaying" => Self::NowPlayingRequested,
            "remoteConnected" => Self::RemoteConnected {
                name: field_str(message, "name"),
            },
            "remoteDisconnected" => Self::RemoteDisconnected {
                name: field_str(message, "name"),
            },
            _ => return None,
        };
        Some(event)
    }
}

fn load_event(message: &InboundMessage) -> Option<PlaybackEvent> {
    let video_ids: Vec<String> = field_str(message, "videoIds")
        .map(|ids| {
            ids.split(',')
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let current_index = field_f64(message, "currentIndex")
        .map(|i| i.max(0.0) as usize)
        .unwrap_or(0);

    let video_id = field_str(message, "videoId")
        .filter(|id| !id.is_empty())
        .or_else(|| video_ids.get(current_index).cloned());

    let Some(video_id) = video_id else {
        warn!(command = %message.command, args = ?message.args, "Load command without a video id");
        return None;
    };

    Some(PlaybackEvent::Load {
        video_ids: if video_ids.is_empty() {
            vec![video_id.clone()]
        } else {
            video_ids
        },
        video_id,
        current_index,
        start_position: field_f64(message, "currentTime").unwrap_or(0.0),
        list_id: field_str(message, "listId").filter(|id| !id.is_empty()),
    })
}

/// Field of the first argument rendered as a string
fn field_str(message: &InboundMessage, key: &str) -> Option<String> {
    match message.field(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Field of the first argument as a number, accepting numeric strings
fn field_f64(message: &InboundMessage, key: &str) -> Option<f64> {
    match message.field(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
