//! Periodic pipeline counters

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use publisher_broker::{BrokerConnectionManager, OutgoingTotals};
use publisher_core::SignatureType;
use publisher_ingest::{PublisherConnections, UpdateDispatcher};
use publisher_processor::ProcessorStats;

/// Counters of one signature type's processor and brokers
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineMetrics {
    pub signature_type: SignatureType,
    pub signed_updates: u64,
    pub skipped_updates: u64,
    pub emitted_batches: u64,
    /// Wall clock minus the newest signed timestamp
    pub latest_signed_age: Option<Duration>,
    /// Values waiting in the processor's input queue
    pub sign_queue_size: usize,
    pub outgoing: OutgoingTotals,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentMetrics {
    pub pipelines: Vec<PipelineMetrics>,
    pub dispatched_updates: u64,
    pub dropped_updates: u64,
    pub pushed_updates: Option<u64>,
    pub pulled_updates: Option<u64>,
    pub publisher_connections: Option<usize>,
}

/// Reads the live counters of a running agent
#[derive(Clone)]
pub struct MetricsReporter {
    pipelines: Vec<(Arc<ProcessorStats>, Arc<BrokerConnectionManager>)>,
    dispatcher: UpdateDispatcher,
    push: Option<(UpdateDispatcher, PublisherConnections)>,
    pull: Option<UpdateDispatcher>,
}

impl MetricsReporter {
    /// `pipelines` must be in the same order as the dispatcher's queues
    pub fn new(
        pipelines: Vec<(Arc<ProcessorStats>, Arc<BrokerConnectionManager>)>,
        dispatcher: UpdateDispatcher,
        push: Option<(UpdateDispatcher, PublisherConnections)>,
        pull: Option<UpdateDispatcher>,
    ) -> Self {
        Self {
            pipelines,
            dispatcher,
            push,
            pull,
        }
    }

    pub fn publisher_connections(&self) -> Option<&PublisherConnections> {
        self.push.as_ref().map(|(_, connections)| connections)
    }

    pub fn snapshot(&self) -> AgentMetrics {
        let now_nano = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|now| u64::try_from(now).ok());
        let depths = self.dispatcher.queue_depths();

        let pipelines = self
            .pipelines
            .iter()
            .enumerate()
            .map(|(index, (stats, manager))| PipelineMetrics {
                signature_type: manager.signature_type(),
                signed_updates: stats.signed_updates(),
                skipped_updates: stats.skipped_updates(),
                emitted_batches: stats.emitted_batches(),
                latest_signed_age: stats
                    .latest_signed_timestamp_nano()
                    .zip(now_nano)
                    .map(|(signed, now)| Duration::from_nanos(now.saturating_sub(signed))),
                sign_queue_size: depths.get(index).copied().unwrap_or_default(),
                outgoing: manager.outgoing_totals(),
            })
            .collect();

        AgentMetrics {
            pipelines,
            dispatched_updates: self.dispatcher.dispatched_count(),
            dropped_updates: self.dispatcher.dropped_count(),
            pushed_updates: self.push.as_ref().map(|(push, _)| push.received_count()),
            pulled_updates: self.pull.as_ref().map(UpdateDispatcher::received_count),
            publisher_connections: self.push.as_ref().map(|(_, connections)| connections.count()),
        }
    }

    /// Log a snapshot every `period`, starting one period from now
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            log_metrics(&self.snapshot());
        }
    }
}

fn log_metrics(metrics: &AgentMetrics) {
    info!(
        dispatched = metrics.dispatched_updates,
        dropped = metrics.dropped_updates,
        pushed = ?metrics.pushed_updates,
        pulled = ?metrics.pulled_updates,
        publisher_connections = ?metrics.publisher_connections,
        "Incoming updates"
    );

    for pipeline in &metrics.pipelines {
        info!(
            signed = pipeline.signed_updates,
            skipped = pipeline.skipped_updates,
            batches = pipeline.emitted_batches,
            latest_signed_age = ?pipeline.latest_signed_age,
            sign_queue = pipeline.sign_queue_size,
            brokers = pipeline.outgoing.connections,
            live_brokers = pipeline.outgoing.live_connections,
            sent_batches = pipeline.outgoing.sent_batches,
            dropped_batches = pipeline.outgoing.dropped_batches,
            "{} pipeline",
            pipeline.signature_type
        );
    }
}
