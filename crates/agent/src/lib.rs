//! Publisher agent
//!
//! Wires inbound ingest, one price update processor per signer and one
//! broker connection manager per signature type into a running pipeline.

pub mod metrics;
pub mod runner;
pub mod telemetry;

pub use metrics::{AgentMetrics, MetricsReporter, PipelineMetrics};
pub use runner::{PublisherAgentRunner, RunningAgent};
pub use telemetry::init_tracing;
