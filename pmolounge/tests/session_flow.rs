//! End-to-end session tests against a mocked lounge service

use pmolounge::bind::BIND_PATH;
use pmolounge::config::BackoffStrategy;
use pmolounge::{
    encode_chunk, Error, InboundMessage, LoungeConfig, LoungeSession, OutgoingMessage,
    PlaybackEvent, SessionPhase,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{
    body_string_contains, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SCREEN_ID_PATH: &str = "/api/lounge/pairing/generate_screen_id";
const TOKEN_PATH: &str = "/api/lounge/pairing/get_lounge_token_batch";
const REGISTER_PATH: &str = "/api/lounge/pairing/register_pairing_code";

fn test_config(server: &MockServer) -> LoungeConfig {
    let mut config = LoungeConfig::default();
    config.endpoints.base_url = server.uri();
    config.device.name = "Test Receiver".to_string();
    config.device.id = Some("test-device".to_string());
    config.polling.interval_ms = 20;
    config.polling.request_timeout_secs = 5;
    config.polling.backoff.strategy = BackoffStrategy::Constant;
    config.polling.backoff.initial_ms = 20;
    config
}

fn token_body(token: &str) -> String {
    json!({"screens": [{"screenId": "scr1", "loungeToken": token, "expiration": 1_700_000_000_000u64}]})
        .to_string()
}

fn session_chunk(sid: &str, gsession: &str) -> String {
    encode_chunk(&[
        InboundMessage::new(0, "c", vec![json!(sid), json!(""), json!(8)]),
        InboundMessage::new(1, "S", vec![json!(gsession)]),
    ])
}

/// Pairing endpoints; the token endpoint always answers `TOKEN1`
async fn mount_pairing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(SCREEN_ID_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("scr1"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN1")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// First negotiation answers SID1/GS1
async fn mount_negotiation(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param_is_missing("SID"))
        .and(query_param_is_missing("OSID"))
        .and(body_string_contains("count=0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(session_chunk("SID1", "GS1")))
        .mount(server)
        .await;
}

/// Incoming polls with nothing to deliver
async fn mount_idle_incoming(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .with_priority(10)
        .mount(server)
        .await;
}

async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn requests_matching<F>(server: &MockServer, predicate: F) -> Vec<Request>
where
    F: Fn(&Request) -> bool,
{
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| predicate(r))
        .collect()
}

/// Poll the mock server until `count` requests match
async fn wait_for_requests<F>(server: &MockServer, what: &str, count: usize, predicate: F) -> Vec<Request>
where
    F: Fn(&Request) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let matching = requests_matching(server, &predicate).await;
        if matching.len() >= count {
            return matching;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn query(request: &Request, key: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn is_bind_post(request: &Request) -> bool {
    request.method.as_str() == "POST" && request.url.path() == BIND_PATH
}

#[tokio::test]
async fn test_bootstrap_binds_and_forwards_commands() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID1"))
        .and(query_param("AID", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(encode_chunk(&[
            InboundMessage::new(2, "setVideo", vec![json!({"videoId": "abc", "currentTime": "0"})]),
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    let mut playback = session.subscribe_playback();
    let mut raw = session.subscribe();

    let launch = session.start("pairingCode=123456789012").await.unwrap();
    assert_eq!(launch.pairing_code, "123456789012");

    let mut phase = session.watch_phase();
    tokio::time::timeout(
        Duration::from_secs(5),
        phase.wait_for(|p| *p == SessionPhase::Bound),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(session.sid().as_deref(), Some("SID1"));
    assert_eq!(session.screen_id().as_deref(), Some("scr1"));

    let event = tokio::time::timeout(Duration::from_secs(5), playback.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PlaybackEvent::Load { video_id, .. } => assert_eq!(video_id, "abc"),
        other => panic!("unexpected event {other:?}"),
    }

    // c and S never reach subscribers
    let message = raw.recv().await.unwrap();
    assert_eq!(message.command, "setVideo");
    assert_eq!(session.aid(), 2);

    let registrations =
        requests_matching(&server, |r| r.url.path() == REGISTER_PATH).await;
    let body = String::from_utf8_lossy(&registrations[0].body).to_string();
    assert!(body.contains("pairing_code=123456789012"));
    assert!(body.contains("screen_id=scr1"));

    session.quit().await;
    assert_eq!(session.phase(), SessionPhase::Stopped);
}

#[tokio::test]
async fn test_send_message_produces_single_pause_field() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    mount_idle_incoming(&server).await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();
    wait_for("bound", || session.phase() == SessionPhase::Bound).await;

    session.send_message(OutgoingMessage::new("pause")).unwrap();

    let is_flush = |r: &Request| is_bind_post(r) && query(r, "SID").as_deref() == Some("SID1");
    wait_for_requests(&server, "flush", 1, is_flush).await;
    // let a few more outgoing cycles run: nothing else may be sent
    tokio::time::sleep(Duration::from_millis(100)).await;
    let flushes = requests_matching(&server, is_flush).await;

    assert_eq!(flushes.len(), 1);
    let body = String::from_utf8_lossy(&flushes[0].body).to_string();
    assert_eq!(body.matches("=pause").count(), 1);
    assert!(body.contains("req0__sc=pause"));
    assert!(body.contains("count=1"));
    assert!(body.contains("ofs=0"));

    session.quit().await;
}

#[tokio::test]
async fn test_unknown_sid_renegotiates_with_previous_ids() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID1"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Unknown SID"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param("OSID", "SID1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(session_chunk("SID2", "GS2")))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();

    wait_for("second session", || session.sid().as_deref() == Some("SID2")).await;
    wait_for("bound", || session.phase() == SessionPhase::Bound).await;

    let renegotiations = requests_matching(&server, |r| {
        is_bind_post(r) && query(r, "OSID").is_some()
    })
    .await;
    assert!(!renegotiations.is_empty());
    assert_eq!(query(&renegotiations[0], "OSID").as_deref(), Some("SID1"));
    assert_eq!(query(&renegotiations[0], "OAID").as_deref(), Some("1"));
    assert!(query(&renegotiations[0], "SID").is_none());

    session.quit().await;
}

#[tokio::test]
async fn test_gone_refreshes_token_through_token_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SCREEN_ID_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("scr1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN1")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(token_body("TOKEN2"))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .and(query_param("loungeIdToken", "TOKEN1"))
        .respond_with(ResponseTemplate::new(410))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();

    let mut phases = session.watch_phase();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            seen.push(phase);
            if phase == SessionPhase::Stopped {
                break;
            }
        }
        seen
    });

    session.start("pairingCode=42").await.unwrap();

    wait_for("new token", || {
        session
            .bind_identity()
            .is_some_and(|(_, token)| token == "TOKEN2")
    })
    .await;
    wait_for("bound again", || session.phase() == SessionPhase::Bound).await;

    session.quit().await;
    let seen = recorder.await.unwrap();

    let first_bound = seen.iter().position(|p| *p == SessionPhase::Bound).unwrap();
    let pending = seen[first_bound..]
        .iter()
        .position(|p| *p == SessionPhase::TokenPending)
        .map(|i| i + first_bound)
        .expect("TokenPending after Bound");
    assert!(seen[pending..].contains(&SessionPhase::Bound));

    let renegotiated = requests_matching(&server, |r| {
        is_bind_post(r) && query(r, "loungeIdToken").as_deref() == Some("TOKEN2")
    })
    .await;
    assert!(!renegotiated.is_empty());

    let token_requests = requests_matching(&server, |r| r.url.path() == TOKEN_PATH).await;
    assert_eq!(token_requests.len(), 2);
}

#[tokio::test]
async fn test_fatal_status_stops_session() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();

    wait_for("stopped", || session.phase() == SessionPhase::Stopped).await;
    match session.last_error().as_deref() {
        Some(Error::UnexpectedStatus { status, .. }) => assert_eq!(*status, 500),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(
        session.send_message(OutgoingMessage::new("pause")),
        Err(Error::NotRunning)
    ));
}

#[tokio::test]
async fn test_transient_502_keeps_session_alive() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();
    wait_for("bound", || session.phase() == SessionPhase::Bound).await;

    wait_for_requests(&server, "502 replies consumed", 4, |r| {
        r.method.as_str() == "GET" && r.url.path() == BIND_PATH
    })
    .await;
    assert_eq!(session.phase(), SessionPhase::Bound);
    assert!(session.last_error().is_none());

    session.quit().await;
}

#[tokio::test]
async fn test_retry_budget_exhaustion_stops_session() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.polling.request_timeout_secs = 1;
    config.polling.max_retries = 1;
    let session = LoungeSession::new(config).unwrap();
    session.start("pairingCode=42").await.unwrap();

    let mut phase = session.watch_phase();
    tokio::time::timeout(
        Duration::from_secs(10),
        phase.wait_for(|p| *p == SessionPhase::Stopped),
    )
    .await
    .unwrap()
    .unwrap();

    match session.last_error().as_deref() {
        Some(Error::RetryBudgetExceeded { channel, errors }) => {
            assert_eq!(*channel, "outgoing");
            assert_eq!(*errors, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_start_without_pairing_code_fails() {
    let server = MockServer::start().await;
    let session = LoungeSession::new(test_config(&server)).unwrap();

    assert!(matches!(
        session.start("v=abc").await,
        Err(Error::MissingPairingCode)
    ));
    assert_eq!(session.phase(), SessionPhase::Unbound);
}

#[tokio::test]
async fn test_rejected_pairing_code_aborts_bootstrap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SCREEN_ID_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("scr1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    assert!(matches!(
        session.start("pairingCode=42").await,
        Err(Error::RegistrationRejected { status: 404 })
    ));
    assert_eq!(session.phase(), SessionPhase::Stopped);
    assert!(matches!(
        session.start("pairingCode=42").await,
        Err(Error::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_late_reply_of_previous_session_is_dropped() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    // the first incoming poll is still open when the session is renegotiated
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(encode_chunk(&[InboundMessage::new(50, "play", vec![])]))
                .set_delay(Duration::from_millis(600)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID1"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Unknown SID"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param("OSID", "SID1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(session_chunk("SID2", "GS2")))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(BIND_PATH))
        .and(query_param("SID", "SID2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    let mut raw = session.subscribe();
    session.start("pairingCode=42").await.unwrap();
    wait_for("bound", || session.phase() == SessionPhase::Bound).await;

    let is_poll_on = |sid: &'static str| {
        move |r: &Request| r.method.as_str() == "GET" && query(r, "SID").as_deref() == Some(sid)
    };
    wait_for_requests(&server, "poll on SID1", 1, is_poll_on("SID1")).await;

    session.send_message(OutgoingMessage::new("pause")).unwrap();

    // the incoming channel only polls SID2 once the SID1 reply came back
    wait_for_requests(&server, "poll on SID2", 1, is_poll_on("SID2")).await;
    assert_eq!(session.sid().as_deref(), Some("SID2"));
    assert!(session.aid() < 50, "aid taken from a previous session: {}", session.aid());
    while let Ok(message) = raw.try_recv() {
        assert_ne!(message.command, "play");
    }

    // the batch rejected by SID1 is delivered to SID2
    let flushes = wait_for_requests(&server, "flush on SID2", 1, |r| {
        is_bind_post(r) && query(r, "SID").as_deref() == Some("SID2")
    })
    .await;
    let body = String::from_utf8_lossy(&flushes[0].body).to_string();
    assert!(body.contains("req0__sc=pause"));

    session.quit().await;
}

#[tokio::test]
async fn test_failed_token_refresh_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SCREEN_ID_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("scr1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN1")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN2")))
        .with_priority(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .and(query_param("loungeIdToken", "TOKEN1"))
        .respond_with(ResponseTemplate::new(410))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_incoming(&server).await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();

    wait_for("new token", || {
        session
            .bind_identity()
            .is_some_and(|(_, token)| token == "TOKEN2")
    })
    .await;
    wait_for("bound again", || session.phase() == SessionPhase::Bound).await;
    assert!(session.last_error().is_none());

    let token_requests = requests_matching(&server, |r| r.url.path() == TOKEN_PATH).await;
    assert_eq!(token_requests.len(), 3);

    session.quit().await;
}

#[tokio::test]
async fn test_failing_token_refresh_exhausts_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SCREEN_ID_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("scr1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(token_body("TOKEN1")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.polling.max_retries = 2;
    let session = LoungeSession::new(config).unwrap();
    session.start("pairingCode=42").await.unwrap();

    wait_for("stopped", || session.phase() == SessionPhase::Stopped).await;
    match session.last_error().as_deref() {
        Some(Error::RetryBudgetExceeded { channel, errors }) => {
            assert_eq!(*channel, "token-refresh");
            assert_eq!(*errors, 3);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_quit_does_not_wait_for_open_poll() {
    let server = MockServer::start().await;
    mount_pairing(&server).await;
    mount_negotiation(&server).await;
    Mock::given(method("GET"))
        .and(path(BIND_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(8)))
        .mount(&server)
        .await;

    let session = LoungeSession::new(test_config(&server)).unwrap();
    session.start("pairingCode=42").await.unwrap();
    wait_for("bound", || session.phase() == SessionPhase::Bound).await;
    wait_for_requests(&server, "open poll", 1, |r| {
        r.method.as_str() == "GET" && r.url.path() == BIND_PATH
    })
    .await;

    tokio::time::timeout(Duration::from_secs(2), session.quit())
        .await
        .expect("quit waited for the open poll");
    assert_eq!(session.phase(), SessionPhase::Stopped);
}
