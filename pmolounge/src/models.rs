//! Data models exchanged with the lounge service

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command decoded from a bind response
///
/// Wire shape: `[index, [command, arg0, arg1, ...]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Server-assigned, per-session increasing index
    pub index: i64,
    /// Command name (`c`, `S`, `noop`, `setPlaylist`, ...)
    pub command: String,
    /// Remaining tuple elements, double-encoded strings already expanded
    pub args: Vec<Value>,
}

impl InboundMessage {
    pub fn new(index: i64, command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            index,
            command: command.into(),
            args,
        }
    }

    /// First argument as a string, if any
    pub fn first_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }

    /// Field of the first argument when it is an object
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.args.first().and_then(|v| v.get(key))
    }
}

/// A command queued for the outgoing channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub command: String,
    /// Ordered `(key, value)` arguments; positional arguments use their index as key
    pub args: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Append a named argument
    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }

    /// Append a positional argument, keyed by its position
    pub fn positional(mut self, value: impl ToString) -> Self {
        let key = self.args.len().to_string();
        self.args.push((key, value.to_string()));
        self
    }

    /// Answer to a remote's `getNowPlaying`
    pub fn now_playing(video_id: &str, current_time: f64, state: PlayerState) -> Self {
        Self::new("nowPlaying")
            .arg("videoId", video_id)
            .arg("currentTime", current_time)
            .arg("state", state as i32)
            .arg("currentIndex", 0)
            .arg("listId", "")
    }
}

/// Player states as reported in `nowPlaying`/`onStateChange`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PlayerState {
    Stopped = -1,
    Ended = 0,
    Playing = 1,
    Paused = 2,
    Buffering = 3,
}

/// Response of `get_lounge_token_batch`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScreensResponse {
    #[serde(default)]
    pub screens: Vec<ScreenToken>,
}

/// One screen entry in [`ScreensResponse`]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenToken {
    pub screen_id: String,
    #[serde(default)]
    pub lounge_token: Option<String>,
    #[serde(default)]
    pub expiration: Option<i64>,
}
