//! Launch data handed over by the discovery layer
//!
//! Launch data is a query string (`pairingCode=...&v=...&t=...`), optionally
//! wrapped in a full URL.

use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

/// Parsed launch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub pairing_code: String,
    /// Video to start with
    pub video_id: Option<String>,
    /// Where to start `video_id`
    pub start_position: Option<Duration>,
}

impl LaunchRequest {
    pub fn parse(data: &str) -> Result<Self> {
        let data = data.trim();
        let query = match Url::parse(data) {
            Ok(url) => url.query().unwrap_or_default().to_string(),
            Err(_) => data.trim_start_matches('?').to_string(),
        };

        let mut pairing_code = None;
        let mut video_id = None;
        let mut start_position = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "pairingCode" if !value.is_empty() => pairing_code = Some(value.into_owned()),
                "v" if !value.is_empty() => video_id = Some(value.into_owned()),
                "t" => start_position = parse_position(&value),
                _ => {}
            }
        }

        Ok(Self {
            pairing_code: pairing_code.ok_or(Error::MissingPairingCode)?,
            start_position: video_id.as_ref().and(start_position),
            video_id,
        })
    }
}

/// `85.9`, `90s`, `1m30s`, `1h2m3s`
fn parse_position(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        return (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds));
    }

    let mut total = 0.0;
    let mut number = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += number.parse::<f64>().ok()? * unit;
        number.clear();
    }
    if !number.is_empty() {
        return None;
    }
    Some(Duration::from_secs_f64(total))
}
