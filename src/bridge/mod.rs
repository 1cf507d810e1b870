use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{ServiceCall, ServiceReply};
use crate::tracker::RequestTracker;
use crate::{RelayError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Shared connection to the recognition backend
///
/// All in-flight calls multiplex over one lazily established WebSocket; the
/// correlation id inside each frame routes replies back to their callers.
/// When the connection drops, every pending call is failed through the
/// tracker and the next [`call`](BackendBridge::call) reconnects.
pub struct BackendBridge {
    url: String,
    tracker: Arc<RequestTracker>,
    sink: Arc<Mutex<Option<WsSink>>>,
    /// Bumped on every successful connect so a stale reader cannot tear down
    /// its successor's connection
    generation: Arc<AtomicU64>,
}

impl BackendBridge {
    /// Create a bridge for the given backend URL
    ///
    /// No connection is opened until the first call.
    pub fn new(url: impl Into<String>, tracker: Arc<RequestTracker>) -> Self {
        Self {
            url: url.into(),
            tracker,
            sink: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send a service call over the shared connection, connecting first if
    /// necessary
    pub async fn call(&self, call: &ServiceCall) -> Result<()> {
        let wire = call.to_wire()?;

        let mut slot = self.sink.lock().await;
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        let Some(sink) = slot.as_mut() else {
            return Err(RelayError::BackendUnavailable(
                "connection slot empty after connect".to_string(),
            ));
        };

        if let Err(e) = sink.send(Message::Text(wire)).await {
            // The reader task fails the pending calls once the stream ends.
            *slot = None;
            return Err(RelayError::BackendUnavailable(format!("send failed: {}", e)));
        }

        debug!("sent call {} to {}", call.id, call.service);
        Ok(())
    }

    /// Whether a backend connection is currently open
    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Close the connection, if any
    pub async fn close(&self) {
        let mut slot = self.sink.lock().await;
        if let Some(mut sink) = slot.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            info!("backend connection closed");
        }
    }

    /// Establish the WebSocket and spawn the reader for its lifetime
    async fn open(&self) -> Result<WsSink> {
        info!("connecting to recognition backend at {}", self.url);
        let (stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            RelayError::BackendUnavailable(format!("connect to {} failed: {}", self.url, e))
        })?;
        info!("connection to recognition backend established");

        let (sink, source) = stream.split();
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(Self::read_loop(
            source,
            Arc::clone(&self.tracker),
            Arc::clone(&self.sink),
            Arc::clone(&self.generation),
            my_generation,
        ));

        Ok(sink)
    }

    /// Receive frames until the connection ends, dispatching replies by id
    async fn read_loop(
        mut source: WsSource,
        tracker: Arc<RequestTracker>,
        slot: Arc<Mutex<Option<WsSink>>>,
        generation: Arc<AtomicU64>,
        my_generation: u64,
    ) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => Self::dispatch(&tracker, &text).await,
                Ok(Message::Close(_)) => {
                    info!("recognition backend closed the connection");
                    break;
                }
                // Control and binary frames are not part of the protocol.
                Ok(_) => {}
                Err(e) => {
                    warn!("backend connection error: {}", e);
                    break;
                }
            }
        }

        // Only the reader of the live connection may tear it down; a stale
        // reader outliving a reconnect must not touch the new sink. The
        // generation check happens under the sink lock because reconnects
        // bump the counter while holding it.
        {
            let mut current = slot.lock().await;
            if generation.load(Ordering::SeqCst) != my_generation {
                return;
            }
            *current = None;
        }
        let failed = tracker.fail_all().await;
        if failed > 0 {
            warn!("backend connection lost with {} call(s) in flight", failed);
        }
    }

    /// Route one inbound frame to the caller waiting on its id
    async fn dispatch(tracker: &RequestTracker, text: &str) {
        match ServiceReply::parse(text) {
            Ok(reply) => match reply.id.clone() {
                Some(id) => {
                    tracker.resolve(&id, reply.into_payload()).await;
                }
                None => warn!("backend reply carries no correlation id"),
            },
            Err(e) => warn!("unparseable backend frame: {}", e),
        }
    }
}
