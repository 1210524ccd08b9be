//! Outbound broker websocket connection
//!
//! Each broker gets one long-lived [`OutgoingConnection`]. Its supervisor
//! (`run`) dials the broker, runs a session until the socket fails, waits
//! `reconnect_delay` and dials again, until the connection is removed.
//! A session forwards the batches queued by the manager, filtered by the
//! broker's asset subscription.

use futures::FutureExt;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use publisher_core::{
    AssetId, BrokerPublishUrl, ConnectionError, ConnectionResult, SignedPriceUpdateBatch,
    WebsocketMessage,
};

use crate::auth::AuthSigner;
use crate::connection::Connection;
use crate::subscription::AssetFilter;

pub const SIGNED_PRICES_MESSAGE_TYPE: &str = "signed_prices";

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BrokerSink = SplitSink<BrokerStream, Message>;

/// Settings shared by every outbound connection of a manager
#[derive(Debug, Clone)]
pub struct OutgoingConfig {
    pub reconnect_delay: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            queue_capacity: 4096,
        }
    }
}

pub struct OutgoingConnection {
    url: BrokerPublishUrl,
    config: OutgoingConfig,
    auth: Arc<dyn AuthSigner>,
    filter: AssetFilter,
    queue: mpsc::Sender<Arc<SignedPriceUpdateBatch>>,
    receiver: Mutex<Option<mpsc::Receiver<Arc<SignedPriceUpdateBatch>>>>,
    session: RwLock<Option<Arc<Connection>>>,
    removed: AtomicBool,
    removed_signal: watch::Sender<bool>,
    overflowing: AtomicBool,
    overflow_warnings: AtomicU64,
    sent_batches: AtomicU64,
    dropped_batches: AtomicU64,
    sessions: AtomicU64,
}

impl OutgoingConnection {
    pub fn new(
        url: BrokerPublishUrl,
        assets: HashSet<AssetId>,
        auth: Arc<dyn AuthSigner>,
        config: OutgoingConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (removed_signal, _) = watch::channel(false);

        Self {
            url,
            config,
            auth,
            filter: AssetFilter::new(assets),
            queue,
            receiver: Mutex::new(Some(receiver)),
            session: RwLock::new(None),
            removed: AtomicBool::new(false),
            removed_signal,
            overflowing: AtomicBool::new(false),
            overflow_warnings: AtomicU64::new(0),
            sent_batches: AtomicU64::new(0),
            dropped_batches: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &BrokerPublishUrl {
        &self.url
    }

    /// Replace the subscribed assets; applies from the next batch written
    pub fn update_assets(&self, assets: HashSet<AssetId>) {
        debug!("Updating assets for broker {} ({} assets)", self.url, assets.len());
        self.filter.update(assets);
    }

    pub fn assets(&self) -> Vec<AssetId> {
        self.filter.sorted_assets()
    }

    /// True while a session is established and open
    pub fn is_active(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map_or(false, |session| !session.is_closed())
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Queue a batch for the active session without blocking.
    /// Returns false if there is no active session or the queue is full.
    pub fn try_push(&self, batch: Arc<SignedPriceUpdateBatch>) -> bool {
        if !self.is_active() {
            return false;
        }

        match self.queue.try_send(batch) {
            Ok(()) => {
                self.overflowing.store(false, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    self.overflow_warnings.fetch_add(1, Ordering::Relaxed);
                    warn!("Outgoing queue for broker {} is full, dropping batches", self.url);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Permanently stop this connection. Idempotent.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Removal requested for outgoing connection to {}", self.url);
        self.removed_signal.send_replace(true);
        self.close_session();
    }

    pub fn sent_batches(&self) -> u64 {
        self.sent_batches.load(Ordering::Relaxed)
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Full-queue warnings logged, one per run of consecutive drops
    pub fn overflow_warnings(&self) -> u64 {
        self.overflow_warnings.load(Ordering::Relaxed)
    }

    /// Number of sessions established so far
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Supervise sessions until removed
    pub async fn run(self: Arc<Self>) {
        let receiver = self.receiver.lock().take();
        let mut queue = match receiver {
            Some(queue) => queue,
            None => {
                warn!("Outgoing connection to {} is already running", self.url);
                return;
            }
        };

        while !self.is_removed() {
            debug!("Connecting to broker websocket {}", self.url);

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = self.wait_removed() => break,
            };

            match connected {
                Ok(stream) => {
                    let session = AssertUnwindSafe(self.run_session(stream, &mut queue))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = session {
                        error!(
                            "Session with broker {} panicked: {}",
                            self.url,
                            panic_message(panic.as_ref())
                        );
                        self.close_session();
                    }
                }
                Err(e) => {
                    error!("Failed to connect to broker websocket {}: {}", self.url, e);
                }
            }

            if self.is_removed() {
                break;
            }

            warn!(
                "Broker websocket {} disconnected - reconnecting after {:?}",
                self.url, self.config.reconnect_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.wait_removed() => break,
            }
        }

        info!("Outgoing websocket to {} was removed - not reconnecting", self.url);
    }

    async fn connect(&self) -> ConnectionResult<BrokerStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        for (name, value) in self.auth.auth_headers()? {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConnectionError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|e| ConnectionError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }

    async fn run_session(
        &self,
        stream: BrokerStream,
        queue: &mut mpsc::Receiver<Arc<SignedPriceUpdateBatch>>,
    ) {
        let (mut write, read) = stream.split();

        // batches queued for a previous session are stale
        while queue.try_recv().is_ok() {}

        let url = self.url.clone();
        let session_id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Connection::new(
            format!("{}#{}", self.url, session_id),
            move || info!("Removing broker websocket {}", url),
        ));
        *self.session.write() = Some(Arc::clone(&session));
        if self.is_removed() {
            session.close();
        }
        info!("Connected to broker websocket {}", self.url);

        let reader = tokio::spawn(drain_reads(read, Arc::clone(&session)));

        loop {
            tokio::select! {
                batch = queue.recv() => {
                    let batch = match batch {
                        Some(batch) => batch,
                        None => break,
                    };
                    if session.is_closed() {
                        warn!("Attempted to send message on closed websocket {}", self.url);
                        break;
                    }

                    let filtered = self.filter.filter_batch(&batch);
                    if filtered.is_empty() {
                        continue;
                    }

                    if let Err(e) = self.send_batch(&mut write, filtered).await {
                        warn!(
                            "Failed to send signed prices to {}, exiting write loop: {}",
                            self.url, e
                        );
                        break;
                    }
                    self.sent_batches.fetch_add(1, Ordering::Relaxed);
                }
                _ = session.closed() => {
                    debug!("Close requested for {}, exiting write loop", self.url);
                    break;
                }
            }
        }

        session.close();
        self.clear_session(&session);
        let _ = tokio::time::timeout(Duration::from_secs(1), write.close()).await;
        reader.abort();
    }

    async fn send_batch(
        &self,
        write: &mut BrokerSink,
        batch: SignedPriceUpdateBatch,
    ) -> ConnectionResult<()> {
        let message = WebsocketMessage::new(SIGNED_PRICES_MESSAGE_TYPE, batch);
        let text = serde_json::to_string(&message)?;

        let sent = tokio::time::timeout(self.config.write_timeout, write.send(Message::Text(text)));
        match sent.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::SendFailed(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout(self.config.write_timeout)),
        }
    }

    async fn wait_removed(&self) {
        let mut rx = self.removed_signal.subscribe();
        let _ = rx.wait_for(|removed| *removed).await;
    }

    fn close_session(&self) {
        let session = self.session.read().clone();
        if let Some(session) = session {
            session.close();
        }
    }

    fn clear_session(&self, session: &Arc<Connection>) {
        let mut current = self.session.write();
        if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, session)) {
            *current = None;
        }
    }
}

/// Read and discard broker frames so control frames are processed and a
/// remote close is noticed
async fn drain_reads(mut read: SplitStream<BrokerStream>, session: Arc<Connection>) {
    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    info!("Broker {} closed the websocket: {:?}", session.id(), frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Network error on broker websocket {}: {}", session.id(), e);
                    break;
                }
                None => break,
            },
            _ = session.closed() => break,
        }
    }
    session.close();
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
