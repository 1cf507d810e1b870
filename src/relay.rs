use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bridge::BackendBridge;
use crate::protocol::{decode_list, CallOutcome, RecognitionRequest, ServiceArgs, ServiceCall};
use crate::storage::AssetStore;
use crate::token::TokenPool;
use crate::tracker::{RequestTracker, TrackerStats};
use crate::{
    RelayError, Result, DEFAULT_BACKEND_URL, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_SERVICE_PATH,
    DEFAULT_STORE_DIR, DEFAULT_TOKEN_LENGTH,
};

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the recognition backend
    pub backend_url: String,
    /// Service path invoked on the backend
    pub service_path: String,
    /// Directory relative asset paths resolve against
    pub store_dir: String,
    /// Per-call deadline, counted from send time
    pub call_timeout: Duration,
    /// Base length of correlation tokens
    pub token_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            store_dir: DEFAULT_STORE_DIR.to_string(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            token_length: DEFAULT_TOKEN_LENGTH,
        }
    }
}

/// Orchestrates one recognition call end to end
///
/// Validates the caller's parameters, claims the audio asset under a
/// collision-free name, allocates a correlation token, forwards the call over
/// the shared backend connection, and waits for whichever comes first: the
/// matching reply, the deadline, or a connection loss. The caller observes
/// exactly one outcome.
pub struct SpeechRelay {
    config: RelayConfig,
    tokens: Arc<TokenPool>,
    tracker: Arc<RequestTracker>,
    bridge: BackendBridge,
    store: AssetStore,
}

impl SpeechRelay {
    /// Wire up the relay's collaborators from a configuration
    pub fn new(config: RelayConfig) -> Self {
        let tokens = Arc::new(TokenPool::new(config.token_length));
        let tracker = Arc::new(RequestTracker::new(Arc::clone(&tokens)));
        let bridge = BackendBridge::new(config.backend_url.clone(), Arc::clone(&tracker));
        let store = AssetStore::new(config.store_dir.clone(), Arc::clone(&tokens));

        Self {
            config,
            tokens,
            tracker,
            bridge,
            store,
        }
    }

    /// Run one recognition call and wait for its outcome
    ///
    /// Malformed parameter lists and unusable asset paths fail with
    /// [`RelayError::InvalidInput`] before anything reaches the backend.
    pub async fn recognize(&self, request: RecognitionRequest) -> Result<CallOutcome> {
        info!(
            "recognition call for {} (language {}, user {})",
            request.file_url, request.language, request.user
        );

        // Validate the transported lists before touching the filesystem.
        let words = decode_list(&request.words, "words")?;
        let sentences = decode_list(&request.sentences, "sentences")?;
        let grammar = decode_list(&request.grammar, "grammar")?;

        let asset = self.store.claim(&request.file_url).await?;

        let id = match self.tokens.allocate().await {
            Ok(id) => id,
            Err(e) => {
                // The claim's token must not leak when allocation fails.
                self.tokens.release(&asset.token).await;
                return Err(e);
            }
        };

        let call = ServiceCall::new(
            &self.config.service_path,
            ServiceArgs {
                path: asset.path.to_string_lossy().into_owned(),
                audio_source: request.audio_source,
                words,
                sentences,
                grammar,
                language: request.language,
                user: request.user,
            },
            &id,
        );

        // Register before sending so a reply can never beat the entry into
        // the table; the deadline timer starts with the send.
        let outcome_rx = self
            .tracker
            .register(id.clone(), asset.token.clone(), self.config.call_timeout)
            .await;
        self.arm_deadline(&id);

        if let Err(e) = self.bridge.call(&call).await {
            self.tracker.discard(&id).await;
            return Err(e);
        }
        debug!("call {} in flight for {}", id, asset.path.display());

        match outcome_rx.await {
            Ok(outcome) => Ok(outcome),
            // The tracker never drops an entry without completing it; losing
            // the sender means the service is tearing down.
            Err(_) => Err(RelayError::BackendUnavailable(
                "call abandoned during shutdown".to_string(),
            )),
        }
    }

    /// Spawn the expiry timer for one registered call
    fn arm_deadline(&self, id: &str) {
        let tracker = Arc::clone(&self.tracker);
        let id = id.to_string();
        let deadline = self.config.call_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracker.expire(&id).await;
        });
    }

    /// Current correlation-table statistics
    pub async fn stats(&self) -> TrackerStats {
        self.tracker.stats().await
    }

    /// Whether the backend connection is currently open
    pub async fn backend_connected(&self) -> bool {
        self.bridge.is_connected().await
    }

    /// The relay's configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Token pool shared by the correlation table and the asset store
    pub fn tokens(&self) -> &Arc<TokenPool> {
        &self.tokens
    }

    /// Fail outstanding calls and drop the backend connection
    pub async fn shutdown(&self) {
        self.bridge.close().await;
        let failed = self.tracker.fail_all().await;
        if failed > 0 {
            info!("unblocked {} caller(s) during shutdown", failed);
        }
    }
}
