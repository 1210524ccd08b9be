//! Inbound price ingest
//!
//! Values arrive either pushed by publishers over the ingest websocket
//! server or pulled from an upstream websocket. Both paths parse the same
//! `prices` envelope and fan updates out to every processor queue.

pub mod dispatch;
pub mod messages;
pub mod puller;
pub mod server;

pub use dispatch::UpdateDispatcher;
pub use messages::{parse_price_message, parse_pull_message, ValueUpdatePush, PRICES_MESSAGE_TYPE};
pub use puller::{IncomingPuller, PullerConfig};
pub use server::{IngestServer, PublisherConnections, PARSE_ERROR_REPLY};
