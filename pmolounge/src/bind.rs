//! Bind endpoint: request shapes and reply classification
//!
//! Three request shapes share the `/api/lounge/bc/bind` endpoint:
//!
//! - **negotiation** (`POST`, `RID=<n>`, body `count=0`): opens a session and
//!   returns the `c`/`S` messages carrying SID and gsessionid. After an
//!   "Unknown SID" reply it also carries `OSID`/`OAID`.
//! - **incoming** (`GET`, `RID=rpc`, `CI=0`, `TYPE=xmlhttp`): the long poll
//!   that receives remote commands.
//! - **flush** (`POST`, `RID=<n>`): sends queued outgoing commands.

use crate::error::Result;
use crate::models::OutgoingMessage;
use reqwest::StatusCode;
use url::Url;

/// Path of the bind endpoint
pub const BIND_PATH: &str = "/api/lounge/bc/bind";

/// Device kind announced to the service
pub const DEVICE_KIND: &str = "LOUNGE_SCREEN";

/// Protocol version
pub const PROTOCOL_VERSION: &str = "8";

/// Marker in a 400 body meaning the session id was forgotten by the server
pub const UNKNOWN_SID_MARKER: &str = "Unknown SID";

/// Identity parameters common to every bind request
#[derive(Debug, Clone, Copy)]
pub struct BindIdentity<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub lounge_token: &'a str,
}

/// SID and AID of a session the server no longer knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousSession {
    pub sid: String,
    pub aid: i64,
}

fn bind_url(base: &Url, identity: &BindIdentity<'_>) -> Result<Url> {
    let mut url = base.join(BIND_PATH)?;
    url.query_pairs_mut()
        .append_pair("device", DEVICE_KIND)
        .append_pair("id", identity.device_id)
        .append_pair("name", identity.device_name)
        .append_pair("loungeIdToken", identity.lounge_token);
    Ok(url)
}

/// URL of a session-opening request
pub fn negotiation_url(
    base: &Url,
    identity: &BindIdentity<'_>,
    previous: Option<&PreviousSession>,
    rid: u32,
    zx: &str,
) -> Result<Url> {
    let mut url = bind_url(base, identity)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(previous) = previous {
            query
                .append_pair("OSID", &previous.sid)
                .append_pair("OAID", &previous.aid.to_string());
        }
        query
            .append_pair("VER", PROTOCOL_VERSION)
            .append_pair("RID", &rid.to_string())
            .append_pair("zx", zx);
    }
    Ok(url)
}

/// URL of the incoming long poll
pub fn incoming_url(
    base: &Url,
    identity: &BindIdentity<'_>,
    sid: &str,
    gsession_id: &str,
    aid: i64,
    zx: &str,
) -> Result<Url> {
    let mut url = bind_url(base, identity)?;
    url.query_pairs_mut()
        .append_pair("VER", PROTOCOL_VERSION)
        .append_pair("RID", "rpc")
        .append_pair("SID", sid)
        .append_pair("CI", "0")
        .append_pair("AID", &aid.to_string())
        .append_pair("gsessionid", gsession_id)
        .append_pair("TYPE", "xmlhttp")
        .append_pair("zx", zx);
    Ok(url)
}

/// URL of an outgoing flush
pub fn flush_url(
    base: &Url,
    identity: &BindIdentity<'_>,
    sid: &str,
    gsession_id: &str,
    aid: i64,
    rid: u32,
    zx: &str,
) -> Result<Url> {
    let mut url = bind_url(base, identity)?;
    url.query_pairs_mut()
        .append_pair("VER", PROTOCOL_VERSION)
        .append_pair("RID", &rid.to_string())
        .append_pair("SID", sid)
        .append_pair("gsessionid", gsession_id)
        .append_pair("AID", &aid.to_string())
        .append_pair("zx", zx);
    Ok(url)
}

/// Body of a negotiation request
pub fn negotiation_form() -> Vec<(String, String)> {
    vec![("count".to_string(), "0".to_string())]
}

/// Body of a flush: `count`, `ofs`, then `req{i}__sc` and `req{i}_{key}` per message
pub fn flush_form(batch: &[OutgoingMessage], ofs: u64) -> Vec<(String, String)> {
    let mut form = Vec::with_capacity(2 + batch.len() * 2);
    form.push(("count".to_string(), batch.len().to_string()));
    form.push(("ofs".to_string(), ofs.to_string()));
    for (i, message) in batch.iter().enumerate() {
        form.push((format!("req{i}__sc"), message.command.clone()));
        for (key, value) in &message.args {
            form.push((format!("req{i}_{key}"), value.clone()));
        }
    }
    form
}

/// How a bind reply affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx: decode and dispatch the body
    Ok,
    /// 400 "Unknown SID": renegotiate with OSID/OAID
    UnknownSid,
    /// 410: the lounge token expired
    Gone,
    /// 502: try again on the next cycle
    Transient,
    /// Anything else ends the session
    Fatal(u16),
}

pub fn classify(status: StatusCode, body: &str) -> ResponseClass {
    match status {
        s if s.is_success() => ResponseClass::Ok,
        StatusCode::BAD_REQUEST if body.contains(UNKNOWN_SID_MARKER) => ResponseClass::UnknownSid,
        StatusCode::GONE => ResponseClass::Gone,
        StatusCode::BAD_GATEWAY => ResponseClass::Transient,
        other => ResponseClass::Fatal(other.as_u16()),
    }
}
