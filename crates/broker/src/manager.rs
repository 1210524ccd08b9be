//! Broker connection manager
//!
//! Keeps one [`OutgoingConnection`] per desired broker, where desired
//! membership is the union of the seeded brokers and the registry's answer,
//! and fans every signed batch out to the connections that are live.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use publisher_core::{
    AgentConfig, BrokerConnectionConfig, BrokerMap, BrokerPublishUrl, PublisherKey, SignatureType,
    SignedPriceUpdateBatch,
};

use crate::auth::AuthSigner;
use crate::outgoing::{OutgoingConfig, OutgoingConnection};
use crate::registry::{merge_brokers, BrokerRegistry};

/// Counters summed over the current broker connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutgoingTotals {
    pub connections: usize,
    pub live_connections: usize,
    pub sent_batches: u64,
    pub dropped_batches: u64,
}

pub struct BrokerConnectionManager {
    publisher_key: PublisherKey,
    signature_type: SignatureType,
    registry: Arc<dyn BrokerRegistry>,
    auth: Arc<dyn AuthSigner>,
    seeded: Vec<BrokerConnectionConfig>,
    refresh_interval: Duration,
    outgoing_config: OutgoingConfig,
    connections: RwLock<HashMap<BrokerPublishUrl, Arc<OutgoingConnection>>>,
    /// Last successful registry answer, reused while the registry is unreachable
    last_registry: Mutex<Option<BrokerMap>>,
    shut_down: AtomicBool,
}

impl BrokerConnectionManager {
    pub fn new(
        publisher_key: PublisherKey,
        signature_type: SignatureType,
        config: &AgentConfig,
        registry: Arc<dyn BrokerRegistry>,
        auth: Arc<dyn AuthSigner>,
    ) -> Self {
        Self {
            publisher_key,
            signature_type,
            registry,
            auth,
            seeded: config.seeded_brokers.clone(),
            refresh_interval: config.registry_refresh_interval(),
            outgoing_config: OutgoingConfig {
                reconnect_delay: config.broker_reconnect_delay(),
                write_timeout: config.broker_write_timeout(),
                queue_capacity: config.channel_capacity,
            },
            connections: RwLock::new(HashMap::new()),
            last_registry: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    /// Resolve desired membership and reconcile the connection map with it
    pub async fn update_broker_connections(&self) {
        debug!("Running {} broker connection updater", self.signature_type);

        let registry = match self.registry.get_brokers_for_publisher(&self.publisher_key).await {
            Ok(brokers) => {
                *self.last_registry.lock() = Some(brokers.clone());
                Some(brokers)
            }
            Err(e) => {
                error!("Failed to get broker connections from registry: {}", e);
                self.last_registry.lock().clone()
            }
        };

        let desired = merge_brokers(registry, &self.seeded);
        self.apply_membership(desired);

        debug!("Broker connection updater finished");
    }

    fn apply_membership(&self, desired: BrokerMap) {
        let mut connections = self.connections.write();
        if self.shut_down.load(Ordering::Acquire) {
            debug!("{} manager is shut down, ignoring membership update", self.signature_type);
            return;
        }

        for (url, assets) in &desired {
            match connections.get(url) {
                Some(connection) => connection.update_assets(assets.clone()),
                None => {
                    info!("Adding broker connection {} ({} assets)", url, assets.len());
                    let connection = Arc::new(OutgoingConnection::new(
                        url.clone(),
                        assets.clone(),
                        Arc::clone(&self.auth),
                        self.outgoing_config.clone(),
                    ));
                    connections.insert(url.clone(), Arc::clone(&connection));
                    tokio::spawn(connection.run());
                }
            }
        }

        let stale: Vec<BrokerPublishUrl> = connections
            .keys()
            .filter(|url| !desired.contains_key(*url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(connection) = connections.remove(&url) {
                info!("Removing broker connection {}", url);
                connection.remove();
            }
        }
    }

    /// Refresh membership at startup and then every refresh interval
    pub async fn run_broker_connection_updater(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.update_broker_connections().await;
        }
    }

    /// Push every signed batch to each live connection until the channel closes
    pub async fn run_fanout(self: Arc<Self>, mut batches: mpsc::Receiver<SignedPriceUpdateBatch>) {
        while let Some(batch) = batches.recv().await {
            let batch = Arc::new(batch);
            let connections = self.connections.read();
            for connection in connections.values() {
                connection.try_push(Arc::clone(&batch));
            }
        }
        info!("Signed batch channel closed, stopping {} fan-out", self.signature_type);
    }

    pub fn connection(&self, url: &BrokerPublishUrl) -> Option<Arc<OutgoingConnection>> {
        self.connections.read().get(url).cloned()
    }

    pub fn connection_urls(&self) -> Vec<BrokerPublishUrl> {
        let mut urls: Vec<BrokerPublishUrl> = self.connections.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|connection| connection.is_active())
            .count()
    }

    pub fn outgoing_totals(&self) -> OutgoingTotals {
        self.connections
            .read()
            .values()
            .fold(OutgoingTotals::default(), |mut totals, connection| {
                totals.connections += 1;
                if connection.is_active() {
                    totals.live_connections += 1;
                }
                totals.sent_batches += connection.sent_batches();
                totals.dropped_batches += connection.dropped_batches();
                totals
            })
    }

    /// Remove every connection. Later membership updates are ignored.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.write();
            self.shut_down.store(true, Ordering::Release);
            connections.drain().collect()
        };
        for (url, connection) in drained {
            debug!("Shutting down broker connection {}", url);
            connection.remove();
        }
    }
}
