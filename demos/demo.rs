//! Demo showing one recognition call relayed to a mock backend
//!
//! This example demonstrates:
//! - Wiring a SpeechRelay against a backend URL
//! - The asset rename performed before the call goes out
//! - Reply and timeout outcomes
//!
//! To run: cargo run --example demo

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use speech_relay::protocol::RecognitionRequest;
use speech_relay::relay::{RelayConfig, SpeechRelay};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Speech Relay Demo Starting");

    // A stand-in recognition backend that answers every call.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let backend_url = format!("ws://{}", listener.local_addr()?);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let Ok(call) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    let reply = json!({
                        "op": "service_response",
                        "values": { "words": ["yes"], "confidence": [0.87] },
                        "id": call["id"],
                        "result": true,
                    });
                    let _ = ws.send(Message::Text(reply.to_string())).await;
                }
            });
        }
    });
    info!("Mock backend listening at {}", backend_url);

    // An uploaded audio asset waiting in the store directory.
    let store = tempfile::tempdir()?;
    tokio::fs::write(store.path().join("speech.session.wav"), b"riff").await?;

    let relay = SpeechRelay::new(RelayConfig {
        backend_url,
        store_dir: store.path().to_string_lossy().into_owned(),
        call_timeout: Duration::from_secs(5),
        ..RelayConfig::default()
    });

    let request = RecognitionRequest {
        file_url: "speech.session.wav".to_string(),
        language: "en".to_string(),
        audio_source: "nao_wav_1_ch".to_string(),
        words: r#"["yes","no"]"#.to_string(),
        sentences: r#"["yes please","no thanks"]"#.to_string(),
        grammar: "[]".to_string(),
        user: "demo".to_string(),
    };

    let outcome = relay.recognize(request).await?;
    info!("Outcome: {:?}", outcome);
    info!("Stats: {}", relay.stats().await);

    relay.shutdown().await;
    info!("Demo completed successfully!");
    info!("To run the actual service, use: cargo run -- --backend-url ws://localhost:9090");

    Ok(())
}
