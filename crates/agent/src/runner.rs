//! Pipeline runner
//!
//! ingest -> dispatcher -> processor (per signer) -> manager fan-out ->
//! outgoing broker connections

use anyhow::{anyhow, bail, Context};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

use publisher_broker::{AuthSigner, BrokerConnectionManager, BrokerRegistry};
use publisher_core::{AgentConfig, SignedPriceUpdateBatch};
use publisher_ingest::{IncomingPuller, IngestServer, PullerConfig, UpdateDispatcher};
use publisher_processor::{PriceUpdateProcessor, ProcessorStats, Signer};

use crate::metrics::{AgentMetrics, MetricsReporter};

struct SignaturePipeline {
    processor: PriceUpdateProcessor,
    manager: Arc<BrokerConnectionManager>,
    batches: mpsc::Receiver<SignedPriceUpdateBatch>,
}

pub struct PublisherAgentRunner {
    config: AgentConfig,
    pipelines: Vec<SignaturePipeline>,
    managers: Vec<Arc<BrokerConnectionManager>>,
    stats: Vec<Arc<ProcessorStats>>,
    dispatcher: UpdateDispatcher,
}

impl PublisherAgentRunner {
    pub fn new(
        config: AgentConfig,
        signers: Vec<Arc<dyn Signer>>,
        registry: Arc<dyn BrokerRegistry>,
        auth: Arc<dyn AuthSigner>,
    ) -> anyhow::Result<Self> {
        if signers.is_empty() {
            bail!("at least one signer is required");
        }

        let mut pipelines = Vec::with_capacity(signers.len());
        let mut inputs = Vec::with_capacity(signers.len());

        for signer in signers {
            let signature_type = signer.signature_type();
            if !config.signature_types.contains(&signature_type) {
                warn!(
                    "Signer for {} is not listed in the configured signature types",
                    signature_type
                );
            }
            if pipelines.iter().any(|pipeline: &SignaturePipeline| {
                pipeline.manager.signature_type() == signature_type
            }) {
                bail!("more than one signer configured for {}", signature_type);
            }

            let (input_tx, input_rx) = mpsc::channel(config.channel_capacity);
            let (batch_tx, batch_rx) = mpsc::channel(config.channel_capacity);

            let manager = Arc::new(BrokerConnectionManager::new(
                signer.publisher_key(),
                signature_type,
                &config,
                Arc::clone(&registry),
                Arc::clone(&auth),
            ));
            let processor = PriceUpdateProcessor::new(
                signer,
                config.oracle_id.clone(),
                config.signature_types.len(),
                &config,
                input_rx,
                batch_tx,
            );

            inputs.push(input_tx);
            pipelines.push(SignaturePipeline {
                processor,
                manager,
                batches: batch_rx,
            });
        }

        let managers = pipelines.iter().map(|p| Arc::clone(&p.manager)).collect();
        let stats = pipelines.iter().map(|p| p.processor.stats()).collect();

        Ok(Self {
            config,
            pipelines,
            managers,
            stats,
            dispatcher: UpdateDispatcher::new(inputs),
        })
    }

    /// Fan-in to every processor queue
    pub fn dispatcher(&self) -> UpdateDispatcher {
        self.dispatcher.clone()
    }

    pub fn managers(&self) -> &[Arc<BrokerConnectionManager>] {
        &self.managers
    }

    /// Spawn every long-lived task and return once ingest is listening
    pub async fn start(self) -> anyhow::Result<RunningAgent> {
        let mut tasks = JoinSet::new();
        let mut updaters = JoinSet::new();
        let mut pipelines = Vec::with_capacity(self.pipelines.len());

        for pipeline in self.pipelines {
            let SignaturePipeline {
                processor,
                manager,
                batches,
            } = pipeline;

            info!("Starting {} pipeline", manager.signature_type());
            pipelines.push((processor.stats(), Arc::clone(&manager)));
            tasks.spawn(processor.run());
            tasks.spawn(Arc::clone(&manager).run_fanout(batches));
            updaters.spawn(Arc::clone(&manager).run_broker_connection_updater());
        }

        let mut ingest_addr = None;
        let mut push = None;
        if self.config.incoming_ws_port != 0 {
            let dispatcher = self.dispatcher.for_source();
            let port = self.config.incoming_ws_port;
            let server = IngestServer::bind(
                ("0.0.0.0", port),
                self.config.incoming_ws_path.clone(),
                dispatcher.clone(),
            )
            .await
            .with_context(|| format!("failed to bind ingest port {}", port))?;
            ingest_addr = Some(server.local_addr()?);
            push = Some((dispatcher, server.connections()));
            tasks.spawn(server.run());
        }

        let mut pull = None;
        if let Some(puller_config) = PullerConfig::from_agent_config(&self.config) {
            info!("Pulling prices from {}", puller_config.url);
            let dispatcher = self.dispatcher.for_source();
            pull = Some(dispatcher.clone());
            tasks.spawn(IncomingPuller::new(puller_config, dispatcher).run());
        }

        let reporter = MetricsReporter::new(pipelines, self.dispatcher.clone(), push, pull);
        let report_interval = self.config.metrics_report_interval();
        if !report_interval.is_zero() {
            tasks.spawn(reporter.clone().run(report_interval));
        }

        Ok(RunningAgent {
            tasks,
            updaters,
            ingest_addr,
            managers: self.managers,
            stats: self.stats,
            dispatcher: self.dispatcher,
            reporter,
        })
    }

    /// Start and run until a task exits or ctrl-c
    pub async fn run(self) -> anyhow::Result<()> {
        let agent = self.start().await?;
        agent.wait().await
    }
}

pub struct RunningAgent {
    tasks: JoinSet<()>,
    /// Kept apart so they can be stopped before the managers shut down
    updaters: JoinSet<()>,
    ingest_addr: Option<SocketAddr>,
    managers: Vec<Arc<BrokerConnectionManager>>,
    stats: Vec<Arc<ProcessorStats>>,
    dispatcher: UpdateDispatcher,
    reporter: MetricsReporter,
}

impl RunningAgent {
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest_addr
    }

    pub fn managers(&self) -> &[Arc<BrokerConnectionManager>] {
        &self.managers
    }

    pub fn processor_stats(&self) -> &[Arc<ProcessorStats>] {
        &self.stats
    }

    pub fn dispatcher(&self) -> UpdateDispatcher {
        self.dispatcher.clone()
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.reporter.snapshot()
    }

    /// Every task is meant to live for the whole process, so the first one
    /// to finish ends the agent.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let outcome = tokio::select! {
            exited = self.tasks.join_next() => task_exit(exited),
            exited = self.updaters.join_next() => task_exit(exited),
            signal = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                signal.context("failed to listen for ctrl-c")
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Stop the membership updaters, then remove every broker connection,
    /// close publisher sessions and abort the remaining tasks
    pub async fn shutdown(&mut self) {
        self.updaters.abort_all();
        while self.updaters.join_next().await.is_some() {}

        for manager in &self.managers {
            manager.shutdown();
        }
        if let Some(connections) = self.reporter.publisher_connections() {
            connections.close_all();
        }
        self.tasks.abort_all();
    }
}

fn task_exit(exited: Option<Result<(), JoinError>>) -> anyhow::Result<()> {
    match exited {
        Some(Err(e)) if !e.is_cancelled() => Err(anyhow!("agent task failed: {}", e)),
        _ => {
            warn!("Agent task exited, shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use publisher_broker::BasicAuthSigner;
    use publisher_core::{
        AssetId, BrokerConnectionConfig, BrokerMap, BrokerPublishUrl, DecimalValue, EvmSignature,
        Metadata, OracleId, PublisherKey, QuantizedPrice, RegistryError, RegistryResult, Signature,
        SignatureType, SignerResult, TimestampedSignature, ValueUpdate,
    };
    use publisher_processor::SignOutput;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, connect_async};

    struct FixedSigner(SignatureType);

    impl Signer for FixedSigner {
        fn sign(
            &self,
            _: &QuantizedPrice,
            asset: &AssetId,
            timestamp_nano: u64,
        ) -> SignerResult<SignOutput> {
            Ok(SignOutput {
                timestamped_signature: TimestampedSignature {
                    signature: Signature::Evm(EvmSignature {
                        r: "0x1".to_string(),
                        s: "0x2".to_string(),
                        v: "0x1c".to_string(),
                    }),
                    timestamp_nano,
                    msg_hash: "0xhash".to_string(),
                },
                external_asset_id: asset.to_string(),
            })
        }

        fn publisher_key(&self) -> PublisherKey {
            PublisherKey::from("0xpublisher")
        }

        fn signature_type(&self) -> SignatureType {
            self.0
        }
    }

    struct OfflineRegistry;

    #[async_trait]
    impl BrokerRegistry for OfflineRegistry {
        async fn get_brokers_for_publisher(&self, _: &PublisherKey) -> RegistryResult<BrokerMap> {
            Err(RegistryError::Request("registry offline".to_string()))
        }
    }

    /// Accepts any number of sessions and forwards every text frame
    async fn start_broker() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/publish", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let _ = tx.send(serde_json::from_str(&text).unwrap());
                    }
                });
            }
        });

        (url, rx)
    }

    fn config(broker_url: &str, incoming_ws_port: u16) -> AgentConfig {
        AgentConfig {
            signature_types: vec![SignatureType::Evm, SignatureType::Stark],
            oracle_id: OracleId::from("abcde"),
            clock_period_ms: 0,
            delta_check_period_ms: 5,
            broker_reconnect_delay_ms: 50,
            seeded_brokers: vec![BrokerConnectionConfig {
                publish_url: BrokerPublishUrl::from(broker_url),
                asset_ids: vec![AssetId::from("BTCUSD")],
            }],
            incoming_ws_port,
            ..Default::default()
        }
    }

    fn runner(
        config: AgentConfig,
        types: &[SignatureType],
    ) -> anyhow::Result<PublisherAgentRunner> {
        let signers = types
            .iter()
            .map(|t| Arc::new(FixedSigner(*t)) as Arc<dyn Signer>)
            .collect();
        PublisherAgentRunner::new(
            config,
            signers,
            Arc::new(OfflineRegistry),
            Arc::new(BasicAuthSigner::new("")),
        )
    }

    async fn wait_for_live_brokers(agent: &RunningAgent) {
        timeout(Duration::from_secs(3), async {
            while agent.managers().iter().any(|m| m.live_connection_count() == 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("broker sessions never became live");
    }

    async fn next_message(
        rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> serde_json::Value {
        timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap()
    }

    fn value_update(asset: &str, value: &str) -> ValueUpdate {
        ValueUpdate {
            publish_timestamp_nano: 1_700_000_000_000_000_000,
            asset: AssetId::from(asset),
            value: value.parse::<DecimalValue>().unwrap(),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatched_values_reach_broker_per_signature_type() {
        let (broker_url, mut messages) = start_broker().await;
        let types = [SignatureType::Evm, SignatureType::Stark];
        let runner = runner(config(&broker_url, 0), &types).unwrap();
        let mut agent = runner.start().await.unwrap();
        assert!(agent.ingest_addr().is_none());
        wait_for_live_brokers(&agent).await;

        let dispatcher = agent.dispatcher();
        assert_eq!(dispatcher.dispatch(value_update("ETHUSD", "3000")), 2);
        assert_eq!(dispatcher.dispatch(value_update("BTCUSD", "64000.25")), 2);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let message = next_message(&mut messages).await;
            assert_eq!(message["type"], "signed_prices");
            let data = message["data"].as_object().unwrap();
            assert_eq!(data.len(), 1);
            let update = &data["BTCUSD"];
            assert_eq!(update["oracle_id"], "abcde");
            assert_eq!(update["trigger"], "delta");
            assert_eq!(update["signed_price"]["price"], "64000250000000000000000");
            seen.push(update["signed_price"]["signature_type"].as_str().unwrap().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["evm".to_string(), "stark".to_string()]);

        let metrics = agent.metrics();
        assert_eq!(metrics.dispatched_updates, 2);
        assert_eq!(metrics.dropped_updates, 0);
        assert_eq!(metrics.pushed_updates, None);
        assert_eq!(metrics.pulled_updates, None);
        assert_eq!(metrics.publisher_connections, None);
        assert_eq!(metrics.pipelines.len(), 2);
        for pipeline in &metrics.pipelines {
            assert_eq!(pipeline.signed_updates, 2);
            assert!(pipeline.emitted_batches >= 1);
            assert_eq!(pipeline.outgoing.connections, 1);
            assert!(pipeline.latest_signed_age.is_some());
        }

        agent.shutdown().await;
        assert!(agent.managers().iter().all(|m| m.connection_urls().is_empty()));
    }

    #[tokio::test]
    async fn test_pushed_prices_flow_through_ingest_server() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (broker_url, mut messages) = start_broker().await;
        let runner = runner(config(&broker_url, port), &[SignatureType::Evm]).unwrap();
        let agent = runner.start().await.unwrap();
        assert_eq!(agent.ingest_addr().map(|addr| addr.port()), Some(port));
        wait_for_live_brokers(&agent).await;

        let (mut publisher, _) = connect_async(format!("ws://127.0.0.1:{}/publish", port))
            .await
            .unwrap();
        publisher
            .send(Message::Text(
                concat!(
                    r#"{"type":"prices","data":"#,
                    r#"[{"t":5,"a":"BTCUSD","p":"101.5","m":{"venue":"x"}}]}"#
                )
                .to_string(),
            ))
            .await
            .unwrap();

        let message = next_message(&mut messages).await;
        let update = &message["data"]["BTCUSD"];
        assert_eq!(update["signed_price"]["price"], "101500000000000000000");
        assert_eq!(update["signed_price"]["metadata"]["venue"], "x");
        assert_eq!(update["signed_price"]["timestamped_signature"]["timestamp"], 5);
        assert_eq!(agent.processor_stats()[0].signed_updates(), 1);

        let metrics = agent.metrics();
        assert_eq!(metrics.pushed_updates, Some(1));
        assert_eq!(metrics.pulled_updates, None);
        assert_eq!(metrics.publisher_connections, Some(1));
        assert_eq!(metrics.pipelines[0].signature_type, SignatureType::Evm);
        assert_eq!(metrics.pipelines[0].signed_updates, 1);
        assert_eq!(metrics.pipelines[0].sign_queue_size, 0);

        timeout(Duration::from_secs(3), async {
            while agent.metrics().pipelines[0].outgoing.sent_batches == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sent batch never counted");
        assert_eq!(agent.metrics().pipelines[0].outgoing.live_connections, 1);
    }

    #[test]
    fn test_rejects_missing_or_duplicate_signers() {
        let config = config("ws://127.0.0.1:1/publish", 0);
        assert!(runner(config.clone(), &[]).is_err());
        assert!(runner(config.clone(), &[SignatureType::Evm, SignatureType::Evm]).is_err());

        let runner = runner(config, &[SignatureType::Stark]).unwrap();
        assert_eq!(runner.managers().len(), 1);
        assert_eq!(runner.managers()[0].signature_type(), SignatureType::Stark);
        assert_eq!(runner.dispatcher().queue_count(), 1);
    }
}
