//! Broker registry lookup and membership merging

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use publisher_core::{
    BrokerConnectionConfig, BrokerMap, PublisherKey, RegistryError, RegistryResult,
};

use crate::auth::AuthSigner;

const REGISTRY_BROKERS_PATH: &str = "/v1/registry/brokers";
const REGISTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves which brokers should receive a publisher's updates
#[async_trait]
pub trait BrokerRegistry: Send + Sync {
    async fn get_brokers_for_publisher(
        &self,
        publisher_key: &PublisherKey,
    ) -> RegistryResult<BrokerMap>;
}

#[derive(Debug, Deserialize)]
struct RegistryErrorResponse {
    error: String,
}

/// REST client for the broker registry
pub struct HttpRegistryClient {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<dyn AuthSigner>,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthSigner>) -> RegistryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            auth,
        })
    }

    fn parse_response(publisher_key: &PublisherKey, body: &[u8]) -> RegistryResult<BrokerMap> {
        let brokers: Vec<BrokerConnectionConfig> = match serde_json::from_slice(body) {
            Ok(brokers) => brokers,
            Err(_) => {
                return Err(match serde_json::from_slice::<RegistryErrorResponse>(body) {
                    Ok(response) if response.error == "Unauthorized" => RegistryError::Unauthorized,
                    Ok(response) => RegistryError::Remote(response.error),
                    Err(_) => {
                        RegistryError::InvalidResponse(String::from_utf8_lossy(body).into_owned())
                    }
                });
            }
        };

        if brokers.is_empty() {
            warn!(
                "No registry broker found for publisher key {} - make sure the key is whitelisted",
                publisher_key
            );
        }

        Ok(combine_configs(&brokers))
    }
}

#[async_trait]
impl BrokerRegistry for HttpRegistryClient {
    async fn get_brokers_for_publisher(
        &self,
        publisher_key: &PublisherKey,
    ) -> RegistryResult<BrokerMap> {
        let url = format!("{}{}", self.base_url, REGISTRY_BROKERS_PATH);
        debug!("Querying broker registry at {}", url);

        let mut request = self
            .client
            .get(&url)
            .query(&[("publisher_key", publisher_key.as_str())]);
        for (name, value) in self.auth.auth_headers()? {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        Self::parse_response(publisher_key, &body)
    }
}

/// Combine configs sharing a publish url into one asset set per url
pub fn combine_configs(configs: &[BrokerConnectionConfig]) -> BrokerMap {
    let mut brokers = BrokerMap::new();
    for config in configs {
        brokers
            .entry(config.publish_url.clone())
            .or_insert_with(HashSet::new)
            .extend(config.asset_ids.iter().cloned());
    }
    brokers
}

/// Union of registry and seeded membership, asset sets merged per url.
/// With no registry result the seeded brokers are used unchanged.
pub fn merge_brokers(registry: Option<BrokerMap>, seeded: &[BrokerConnectionConfig]) -> BrokerMap {
    let mut brokers = registry.unwrap_or_default();
    for (url, assets) in combine_configs(seeded) {
        brokers.entry(url).or_default().extend(assets);
    }
    brokers
}
