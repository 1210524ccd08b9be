//! Broker side of the publisher agent
//!
//! - Registry discovery and seeded broker merging
//! - One supervised outbound websocket per broker
//! - Per-broker asset filtering and batch fan-out

pub mod auth;
pub mod connection;
pub mod manager;
pub mod outgoing;
pub mod registry;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use auth::{AuthSigner, BasicAuthSigner};
pub use connection::Connection;
pub use manager::{BrokerConnectionManager, OutgoingTotals};
pub use outgoing::{OutgoingConfig, OutgoingConnection, SIGNED_PRICES_MESSAGE_TYPE};
pub use registry::{combine_configs, merge_brokers, BrokerRegistry, HttpRegistryClient};
pub use subscription::AssetFilter;
