//! Pull-based ingest: dial an upstream price websocket and read from it

use anyhow::{anyhow, Context};
use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use publisher_core::AgentConfig;

use crate::dispatch::UpdateDispatcher;
use crate::messages::parse_pull_message;

#[derive(Debug, Clone)]
pub struct PullerConfig {
    pub url: String,
    /// Sent as `Authorization: Basic <auth>` when non-empty
    pub auth: Option<String>,
    pub subscription_request: Option<String>,
    pub reconnect_delay: Duration,
    /// Zero disables the read timeout
    pub read_timeout: Duration,
}

impl PullerConfig {
    /// None when no pull url is configured
    pub fn from_agent_config(config: &AgentConfig) -> Option<Self> {
        let url = config.pull_based_ws_url.as_deref().filter(|url| !url.is_empty())?;
        Some(Self {
            url: url.to_string(),
            auth: config.pull_based_auth.clone(),
            subscription_request: config.pull_based_subscription_request.clone(),
            reconnect_delay: config.pull_based_reconnect_delay(),
            read_timeout: config.pull_based_read_timeout(),
        })
    }
}

pub struct IncomingPuller {
    config: PullerConfig,
    dispatcher: UpdateDispatcher,
}

impl IncomingPuller {
    pub fn new(config: PullerConfig, dispatcher: UpdateDispatcher) -> Self {
        Self { config, dispatcher }
    }

    /// Pull forever, reconnecting after `reconnect_delay` on any failure
    pub async fn run(self) {
        loop {
            debug!("Connecting to pull-based websocket with url {}", self.config.url);

            match self.pull().await {
                Ok(()) => info!("Pull-based websocket {} closed", self.config.url),
                Err(e) => error!("Pull-based websocket {} failed: {:#}", self.config.url, e),
            }

            info!(
                "Waiting {:?} to reconnect to pull-based websocket",
                self.config.reconnect_delay
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn pull(&self) -> anyhow::Result<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .context("invalid pull-based websocket url")?;
        if let Some(auth) = self.config.auth.as_deref().filter(|auth| !auth.is_empty()) {
            let value = HeaderValue::from_str(&format!("Basic {}", auth))
                .context("invalid auth header")?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = connect_async(request)
            .await
            .context("failed to connect to pull-based websocket")?;
        let (mut write, mut read) = ws.split();

        match self.next_message(&mut read).await {
            Ok(Some(greeting)) => debug!("Received connection message: {}", greeting),
            Ok(None) => return Ok(()),
            Err(e) => error!(
                "Failed to read connection message from pull-based websocket: {:#}",
                e
            ),
        }

        let subscription = self.config.subscription_request.as_deref();
        if let Some(subscription) = subscription.filter(|s| !s.is_empty()) {
            debug!("Sending subscription request: {}", subscription);
            write
                .send(Message::Text(subscription.to_string()))
                .await
                .context("failed to send subscription request")?;
            let response = self
                .next_message(&mut read)
                .await
                .context("failed to read subscription response")?;
            debug!("Received subscription response: {:?}", response);
        }

        loop {
            let text = match self.next_message(&mut read).await? {
                Some(text) => text,
                None => return Ok(()),
            };

            for result in parse_pull_message(&text) {
                let update = result
                    .with_context(|| format!("failed to parse pull-based message: {}", text))?;
                self.dispatcher.dispatch(update);
            }
        }
    }

    /// Next text frame, None on a clean close
    async fn next_message<S>(&self, read: &mut S) -> anyhow::Result<Option<String>>
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = if self.config.read_timeout.is_zero() {
                read.next().await
            } else {
                tokio::time::timeout(self.config.read_timeout, read.next())
                    .await
                    .map_err(|_| {
                        warn!(
                            "Timed out after {:?} waiting for the next pull-based message",
                            self.config.read_timeout
                        );
                        anyhow!("timed out while waiting for next message")
                    })?
            };

            match message {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .context("non-utf8 binary message received")
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("failed to read from pull-based websocket"),
            }
        }
    }
}
