//! Speech Relay - a bridge from HTTP speech-detection calls to a
//! message-framed recognition backend
//!
//! This crate accepts a single inbound request referencing an uploaded audio
//! file plus recognition parameters, forwards an equivalent request to a
//! remote recognition service over a persistent WebSocket connection, and
//! returns the backend's asynchronous answer to the caller that is still
//! waiting. It features:
//!
//! - Collision-free correlation tokens for every in-flight call
//! - A shared, multiplexed backend connection keyed by correlation id
//! - Hard per-call deadlines that unblock the caller with a timeout outcome
//! - Asset renaming so concurrent uploads never clobber each other on disk
//!
//! # Example
//!
//! ```no_run
//! use speech_relay::protocol::RecognitionRequest;
//! use speech_relay::relay::{RelayConfig, SpeechRelay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let relay = SpeechRelay::new(RelayConfig::default());
//!
//!     let request = RecognitionRequest {
//!         file_url: "/tmp/speech-relay/store/speech.session.wav".into(),
//!         language: "en".into(),
//!         audio_source: "nao_wav_1_ch".into(),
//!         words: r#"["yes","no"]"#.into(),
//!         sentences: r#"["yes please","no thanks"]"#.into(),
//!         grammar: "[]".into(),
//!         user: "demo".into(),
//!     };
//!
//!     let outcome = relay.recognize(request).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod http;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod token;
pub mod tracker;

// Re-export commonly used types for convenience
pub use bridge::BackendBridge;
pub use protocol::{CallOutcome, RecognitionRequest, ServiceCall, ServiceReply};
pub use relay::{RelayConfig, SpeechRelay};
pub use storage::{AssetStore, ClaimedAsset};
pub use token::TokenPool;
pub use tracker::{RequestTracker, TrackerStats};

// Error types
use thiserror::Error;

/// Errors that can occur in the speech-relay system
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed caller input: bad parameter lists, a path without a usable
    /// stem/extension, or a rename that cannot be performed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The recognition backend cannot be reached, or dropped the connection
    /// before answering
    #[error("recognition backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The correlation token space is saturated even after widening
    #[error("correlation token space exhausted")]
    ResourceExhausted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for speech-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default endpoint of the message-framed backend bridge
pub const DEFAULT_BACKEND_URL: &str = "ws://localhost:9090";

/// Recognition service path called on the backend
pub const DEFAULT_SERVICE_PATH: &str = "/ric/speech_detection_sphinx4_batch";

/// Default directory where inbound audio assets are stored
pub const DEFAULT_STORE_DIR: &str = "/tmp/speech-relay/store";

/// Default per-call deadline in seconds, counted from send time
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Default correlation token length
pub const DEFAULT_TOKEN_LENGTH: usize = 5;
