//! Price update processor
//!
//! One processor runs per signer. It coalesces incoming values per asset,
//! evaluates the trigger policy on every delta tick, re-signs the last known
//! values on every clock tick, and emits the signed results as batches.

use alloy_primitives::I256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use publisher_core::{
    AgentConfig, AssetId, OracleId, QuantizedPrice, SignedPrice, SignedPriceUpdate,
    SignedPriceUpdateBatch, SignerResult, TriggerType, ValueUpdate,
};

use crate::signer::Signer;
use crate::trigger::{AssetTriggerState, TriggerPolicy};

/// Counters shared with whoever holds a [`PriceUpdateProcessor::stats`] handle
#[derive(Debug, Default)]
pub struct ProcessorStats {
    ticks: AtomicU64,
    signed_updates: AtomicU64,
    skipped_updates: AtomicU64,
    emitted_batches: AtomicU64,
    latest_signed_timestamp_nano: AtomicU64,
}

impl ProcessorStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn signed_updates(&self) -> u64 {
        self.signed_updates.load(Ordering::Relaxed)
    }

    pub fn skipped_updates(&self) -> u64 {
        self.skipped_updates.load(Ordering::Relaxed)
    }

    pub fn emitted_batches(&self) -> u64 {
        self.emitted_batches.load(Ordering::Relaxed)
    }

    /// Newest timestamp signed over, None before the first signature
    pub fn latest_signed_timestamp_nano(&self) -> Option<u64> {
        match self.latest_signed_timestamp_nano.load(Ordering::Relaxed) {
            0 => None,
            timestamp => Some(timestamp),
        }
    }
}

pub struct PriceUpdateProcessor {
    signer: Arc<dyn Signer>,
    oracle_id: OracleId,
    num_signature_types: usize,
    policy: TriggerPolicy,
    clock_period: Duration,
    delta_check_period: Duration,
    input: mpsc::Receiver<ValueUpdate>,
    output: mpsc::Sender<SignedPriceUpdateBatch>,
    /// Values received since they were last signed by a delta tick
    pending: HashMap<AssetId, ValueUpdate>,
    /// Most recent value per asset, re-signed by the clock
    latest: HashMap<AssetId, ValueUpdate>,
    states: HashMap<AssetId, AssetTriggerState>,
    stats: Arc<ProcessorStats>,
}

impl PriceUpdateProcessor {
    pub fn new(
        signer: Arc<dyn Signer>,
        oracle_id: OracleId,
        num_signature_types: usize,
        config: &AgentConfig,
        input: mpsc::Receiver<ValueUpdate>,
        output: mpsc::Sender<SignedPriceUpdateBatch>,
    ) -> Self {
        Self {
            signer,
            oracle_id,
            num_signature_types,
            policy: TriggerPolicy::new(config.change_threshold_percent, config.sign_every_update),
            clock_period: config.clock_period(),
            delta_check_period: config.delta_check_period(),
            input,
            output,
            pending: HashMap::new(),
            latest: HashMap::new(),
            states: HashMap::new(),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the input channel closes or the output receiver is dropped
    pub async fn run(mut self) {
        info!(
            "Starting {} price update processor \
             ({} signature types configured, clock {:?}, delta check {:?})",
            self.signer.signature_type(),
            self.num_signature_types,
            self.clock_period,
            self.delta_check_period
        );

        let mut delta_interval = tokio::time::interval(self.delta_check_period);
        delta_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut clock_interval = if self.clock_period.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + self.clock_period,
                self.clock_period,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };

        loop {
            let batch = tokio::select! {
                update = self.input.recv() => {
                    match update {
                        Some(update) => {
                            self.record(update);
                            continue;
                        }
                        None => {
                            info!(
                                "Value update channel closed, stopping {} processor",
                                self.signer.signature_type()
                            );
                            break;
                        }
                    }
                }
                _ = delta_interval.tick() => self.delta_update(),
                _ = next_clock_tick(&mut clock_interval) => self.clock_update(),
            };

            if batch.is_empty() {
                continue;
            }

            let batch_size = batch.len();
            if self.output.send(batch).await.is_err() {
                warn!(
                    "Signed batch receiver dropped, stopping {} processor",
                    self.signer.signature_type()
                );
                break;
            }
            self.stats.emitted_batches.fetch_add(1, Ordering::Relaxed);
            debug!("Emitted batch of {} signed updates", batch_size);
        }
    }

    fn record(&mut self, update: ValueUpdate) {
        self.latest.insert(update.asset.clone(), update.clone());
        self.pending.insert(update.asset.clone(), update);
    }

    fn delta_update(&mut self) -> SignedPriceUpdateBatch {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let mut batch = SignedPriceUpdateBatch::new();

        let pending = std::mem::take(&mut self.pending);
        for (asset, update) in pending {
            let quantized = update.value.quantize();
            let value = match quantized.to_i256() {
                Ok(value) => value,
                Err(e) => {
                    warn!("Dropping value for {}: {}", asset, e);
                    self.stats.skipped_updates.fetch_add(1, Ordering::Relaxed);
                    // a value the clock cannot sign either
                    if self.latest.get(&asset) == Some(&update) {
                        self.latest.remove(&asset);
                    }
                    continue;
                }
            };

            let trigger = match self.policy.evaluate(self.states.get(&asset), value) {
                Some(trigger) => trigger,
                None => {
                    self.pending.insert(asset, update);
                    continue;
                }
            };

            let timestamp_nano = match u64::try_from(update.publish_timestamp_nano) {
                Ok(timestamp) => timestamp,
                Err(_) => {
                    error!(
                        "Dropping value for {}: invalid publish timestamp {}",
                        asset, update.publish_timestamp_nano
                    );
                    self.stats.skipped_updates.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self.sign(&update, quantized, timestamp_nano, trigger) {
                Ok(signed) => {
                    self.commit(&asset, value, timestamp_nano);
                    batch.insert(asset, signed);
                }
                Err(e) => {
                    error!("Failed to sign update: {}", e);
                    self.stats.skipped_updates.fetch_add(1, Ordering::Relaxed);
                    self.pending.insert(asset, update);
                }
            }
        }

        if !batch.is_empty() {
            debug!("Delta tick signed {} updates in {:?}", batch.len(), start.elapsed());
        }
        batch
    }

    fn clock_update(&mut self) -> SignedPriceUpdateBatch {
        let mut batch = SignedPriceUpdateBatch::new();

        let now = match chrono::Utc::now().timestamp_nanos_opt().map(u64::try_from) {
            Some(Ok(now)) => now,
            _ => {
                error!("System clock out of range, skipping clock tick");
                return batch;
            }
        };

        let mut committed: Vec<(AssetId, I256)> = Vec::with_capacity(self.latest.len());
        let mut unsignable = Vec::new();
        for (asset, update) in &self.latest {
            let quantized = update.value.quantize();
            let value = match quantized.to_i256() {
                Ok(value) => value,
                Err(e) => {
                    warn!("Dropping heartbeat value for {}: {}", asset, e);
                    self.stats.skipped_updates.fetch_add(1, Ordering::Relaxed);
                    unsignable.push(asset.clone());
                    continue;
                }
            };

            match self.sign(update, quantized, now, TriggerType::Clock) {
                Ok(signed) => {
                    committed.push((asset.clone(), value));
                    batch.insert(asset.clone(), signed);
                }
                Err(e) => {
                    error!("Failed to sign heartbeat: {}", e);
                    self.stats.skipped_updates.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for asset in unsignable {
            if let Some(update) = self.latest.remove(&asset) {
                if self.pending.get(&asset) == Some(&update) {
                    self.pending.remove(&asset);
                }
            }
        }
        for (asset, value) in committed {
            self.commit(&asset, value, now);
        }
        batch
    }

    fn sign(
        &self,
        update: &ValueUpdate,
        quantized_price: QuantizedPrice,
        timestamp_nano: u64,
        trigger: TriggerType,
    ) -> SignerResult<SignedPriceUpdate> {
        let output = self.signer.sign(&quantized_price, &update.asset, timestamp_nano)?;
        self.stats.signed_updates.fetch_add(1, Ordering::Relaxed);
        self.stats
            .latest_signed_timestamp_nano
            .fetch_max(timestamp_nano, Ordering::Relaxed);

        Ok(SignedPriceUpdate {
            oracle_id: self.oracle_id.clone(),
            asset_id: update.asset.clone(),
            trigger,
            signed_price: SignedPrice {
                publisher_key: self.signer.publisher_key(),
                external_asset_id: output.external_asset_id,
                signature_type: self.signer.signature_type(),
                quantized_price,
                timestamped_signature: output.timestamped_signature,
                metadata: update.metadata.clone(),
            },
        })
    }

    fn commit(&mut self, asset: &AssetId, value: I256, timestamp_nano: u64) {
        self.states.insert(
            asset.clone(),
            AssetTriggerState {
                last_signed_quantized: value,
                last_signed_timestamp_nano: timestamp_nano,
            },
        );
    }
}

async fn next_clock_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
