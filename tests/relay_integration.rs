//! End-to-end tests against an in-process mock recognition backend.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use speech_relay::protocol::{CallOutcome, RecognitionRequest};
use speech_relay::relay::{RelayConfig, SpeechRelay};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// How a mock backend treats incoming service calls
#[derive(Clone, Copy)]
enum Backend {
    /// Answer each call with a canned reply, optionally delayed and
    /// optionally sent twice
    Reply { delay_ms: u64, duplicate: bool },
    /// Accept calls and never answer
    Silent,
}

struct MockBackend {
    url: String,
    connections: Arc<AtomicUsize>,
}

async fn spawn_backend(behavior: Backend) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_connection(stream, behavior));
        }
    });

    MockBackend {
        url: format!("ws://{}", addr),
        connections,
    }
}

async fn serve_connection(stream: TcpStream, behavior: Backend) {
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    while let Some(Ok(Message::Text(text))) = ws.next().await {
        let call: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(call["op"], "call_service");

        match behavior {
            Backend::Silent => {}
            Backend::Reply { delay_ms, duplicate } => {
                let reply = json!({
                    "op": "service_response",
                    "service": call["service"],
                    "values": { "words": ["hello"], "path": call["args"]["path"] },
                    "id": call["id"],
                    "result": true,
                });
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                ws.send(Message::Text(reply.to_string())).await.ok();
                if duplicate {
                    ws.send(Message::Text(reply.to_string())).await.ok();
                }
            }
        }
    }
}

/// A relay whose store directory holds the given audio files
async fn relay_with(
    backend_url: &str,
    call_timeout: Duration,
    files: &[&str],
) -> (tempfile::TempDir, SpeechRelay) {
    let dir = tempfile::tempdir().unwrap();
    for name in files {
        tokio::fs::write(dir.path().join(name), b"riff").await.unwrap();
    }

    let relay = SpeechRelay::new(RelayConfig {
        backend_url: backend_url.to_string(),
        store_dir: dir.path().to_string_lossy().into_owned(),
        call_timeout,
        ..RelayConfig::default()
    });
    (dir, relay)
}

fn request(file_url: &str) -> RecognitionRequest {
    RecognitionRequest {
        file_url: file_url.to_string(),
        language: "en".to_string(),
        audio_source: "nao_wav_1_ch".to_string(),
        words: r#"["yes","no"]"#.to_string(),
        sentences: r#"["yes please"]"#.to_string(),
        grammar: "[]".to_string(),
        user: "tester".to_string(),
    }
}

#[tokio::test]
async fn reply_reaches_the_waiting_caller() {
    let backend = spawn_backend(Backend::Reply {
        delay_ms: 0,
        duplicate: false,
    })
    .await;
    let (_dir, relay) = relay_with(&backend.url, Duration::from_secs(10), &["speech.session.wav"]).await;

    let outcome = relay.recognize(request("speech.session.wav")).await.unwrap();

    let payload = match outcome {
        CallOutcome::Reply(payload) => payload,
        other => panic!("expected a reply, got {:?}", other),
    };
    assert_eq!(payload["words"][0], "hello");
    // The backend saw the uniquified path, not the original name.
    let seen_path = payload["path"].as_str().unwrap();
    assert!(seen_path.contains("speech.session"));
    assert!(!seen_path.ends_with("speech.session.wav"));

    // Both of the call's tokens went back to the pool.
    assert_eq!(relay.tokens().checked_out().await, 0);
    let stats = relay.stats().await;
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn delayed_reply_resolves_within_the_deadline() {
    let backend = spawn_backend(Backend::Reply {
        delay_ms: 2000,
        duplicate: false,
    })
    .await;
    let (_dir, relay) = relay_with(&backend.url, Duration::from_secs(10), &["speech.session.wav"]).await;

    let started = Instant::now();
    let outcome = relay.recognize(request("speech.session.wav")).await.unwrap();

    assert!(outcome.is_reply());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(relay.stats().await.expired, 0);
}

#[tokio::test]
async fn duplicate_reply_is_ignored() {
    let backend = spawn_backend(Backend::Reply {
        delay_ms: 0,
        duplicate: true,
    })
    .await;
    let (_dir, relay) = relay_with(&backend.url, Duration::from_secs(10), &["speech.session.wav"]).await;

    let outcome = relay.recognize(request("speech.session.wav")).await.unwrap();
    assert!(outcome.is_reply());

    // Give the duplicate frame time to arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = relay.stats().await;
    assert_eq!(stats.registered, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(relay.tokens().checked_out().await, 0);
}

#[tokio::test]
async fn silent_backend_times_out_and_frees_tokens() {
    let backend = spawn_backend(Backend::Silent).await;
    let (_dir, relay) = relay_with(
        &backend.url,
        Duration::from_millis(500),
        &["speech.session.wav", "speech.retry.wav"],
    )
    .await;

    let started = Instant::now();
    let outcome = relay.recognize(request("speech.session.wav")).await.unwrap();

    assert_eq!(outcome, CallOutcome::TimedOut);
    // The sentinel never arrives before the deadline.
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(relay.tokens().checked_out().await, 0);

    // The pool is usable again for the next call.
    let outcome = relay.recognize(request("speech.retry.wav")).await.unwrap();
    assert_eq!(outcome, CallOutcome::TimedOut);
    let stats = relay.stats().await;
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn malformed_words_never_reach_the_backend() {
    let backend = spawn_backend(Backend::Silent).await;
    let (dir, relay) = relay_with(&backend.url, Duration::from_secs(10), &["speech.session.wav"]).await;

    let mut bad = request("speech.session.wav");
    bad.words = "definitely not a list".to_string();

    let err = relay.recognize(bad).await.unwrap_err();
    assert!(matches!(err, speech_relay::RelayError::InvalidInput(_)));

    // No connection was opened and the asset was left untouched.
    assert_eq!(backend.connections.load(Ordering::SeqCst), 0);
    assert!(dir.path().join("speech.session.wav").exists());
}

#[tokio::test]
async fn concurrent_calls_share_one_connection() {
    let backend = spawn_backend(Backend::Reply {
        delay_ms: 100,
        duplicate: false,
    })
    .await;

    let files = ["clip0.wav", "clip1.wav", "clip2.wav", "clip3.wav", "clip4.wav"];
    let (_dir, relay) = relay_with(&backend.url, Duration::from_secs(10), &files).await;
    let relay = Arc::new(relay);

    let mut handles = Vec::new();
    for name in files {
        let relay = Arc::clone(&relay);
        handles.push(tokio::spawn(async move {
            relay.recognize(request(name)).await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_reply());
    }

    // All five calls multiplexed over a single backend connection.
    assert_eq!(backend.connections.load(Ordering::SeqCst), 1);
    let stats = relay.stats().await;
    assert_eq!(stats.registered, 5);
    assert_eq!(stats.resolved, 5);
    assert_eq!(relay.tokens().checked_out().await, 0);
}
