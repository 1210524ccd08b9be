//! Core type definitions

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::decimal::DecimalValue;

/// Subscribing to this asset means "all assets"
pub const WILDCARD_ASSET: &str = "*";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// A named tradable instrument
    AssetId
);
string_id!(
    /// Five character oracle identifier
    OracleId
);
string_id!(PublisherKey);
string_id!(
    /// Endpoint a broker accepts signed prices on
    BrokerPublishUrl
);
string_id!(
    /// Base-10 integer string, value scaled by 10^18
    QuantizedPrice
);

impl AssetId {
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_ASSET
    }
}

/// Supported signature schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    Evm,
    Stark,
}

impl SignatureType {
    pub fn name(&self) -> &'static str {
        match self {
            SignatureType::Evm => "evm",
            SignatureType::Stark => "stark",
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Why a signed update was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Clock,
    Delta,
    Unspecified,
}

/// Opaque key/value metadata carried from publisher to broker
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A raw value update for one asset
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub publish_timestamp_nano: i64,
    pub asset: AssetId,
    pub value: DecimalValue,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmSignature {
    pub r: String,
    pub s: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarkSignature {
    pub r: String,
    pub s: String,
}

/// Scheme-specific signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signature {
    Evm(EvmSignature),
    Stark(StarkSignature),
}

/// Signature together with the timestamp it signs over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedSignature {
    pub signature: Signature,
    #[serde(rename = "timestamp")]
    pub timestamp_nano: u64,
    pub msg_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPrice {
    pub publisher_key: PublisherKey,
    pub external_asset_id: String,
    pub signature_type: SignatureType,
    #[serde(rename = "price")]
    pub quantized_price: QuantizedPrice,
    pub timestamped_signature: TimestampedSignature,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// A signed price from this publisher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPriceUpdate {
    pub oracle_id: OracleId,
    pub asset_id: AssetId,
    pub trigger: TriggerType,
    pub signed_price: SignedPrice,
}

/// One entry per asset that triggered in a single evaluation tick
pub type SignedPriceUpdateBatch = HashMap<AssetId, SignedPriceUpdate>;

/// Static broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConnectionConfig {
    pub publish_url: BrokerPublishUrl,
    pub asset_ids: Vec<AssetId>,
}

/// Desired broker membership: publish url -> subscribed assets
pub type BrokerMap = HashMap<BrokerPublishUrl, HashSet<AssetId>>;

/// `{type, data}` envelope used on every websocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessage<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> WebsocketMessage<T> {
    pub fn new(msg_type: impl Into<String>, data: T) -> Self {
        Self {
            msg_type: msg_type.into(),
            error: None,
            trace_id: None,
            data: Some(data),
        }
    }
}

impl WebsocketMessage<()> {
    pub fn error(msg_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            error: Some(error.into()),
            trace_id: None,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> SignedPriceUpdate {
        SignedPriceUpdate {
            oracle_id: OracleId::from("czowx"),
            asset_id: AssetId::from("BTCUSD"),
            trigger: TriggerType::Delta,
            signed_price: SignedPrice {
                publisher_key: PublisherKey::from("0x99e295e85cb07c16b7bb62a44df532a7f2620237"),
                external_asset_id: "BTCUSD".to_string(),
                signature_type: SignatureType::Evm,
                quantized_price: QuantizedPrice::from("1000000000000000000"),
                timestamped_signature: TimestampedSignature {
                    signature: Signature::Evm(EvmSignature {
                        r: "0x01".to_string(),
                        s: "0x02".to_string(),
                        v: "0x1b".to_string(),
                    }),
                    timestamp_nano: 10_000_000,
                    msg_hash: "0xabc".to_string(),
                },
                metadata: Metadata::new(),
            },
        }
    }

    #[test]
    fn test_signed_price_update_wire_names() {
        let json = serde_json::to_value(sample_update()).unwrap();

        assert_eq!(json["oracle_id"], "czowx");
        assert_eq!(json["trigger"], "delta");
        assert_eq!(json["signed_price"]["signature_type"], "evm");
        assert_eq!(json["signed_price"]["price"], "1000000000000000000");
        assert_eq!(json["signed_price"]["timestamped_signature"]["timestamp"], 10_000_000u64);
        assert_eq!(json["signed_price"]["timestamped_signature"]["signature"]["v"], "0x1b");
        assert!(json["signed_price"].get("metadata").is_none());
    }

    #[test]
    fn test_signed_prices_envelope() {
        let mut batch = SignedPriceUpdateBatch::new();
        batch.insert(AssetId::from("BTCUSD"), sample_update());

        let text = serde_json::to_string(&WebsocketMessage::new("signed_prices", batch)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(json["type"], "signed_prices");
        assert_eq!(json["data"]["BTCUSD"]["asset_id"], "BTCUSD");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_stark_signature_untagged() {
        let sig: Signature = serde_json::from_str(r#"{"r":"0x1","s":"0x2"}"#).unwrap();
        assert_eq!(
            sig,
            Signature::Stark(StarkSignature { r: "0x1".to_string(), s: "0x2".to_string() })
        );
    }

    #[test]
    fn test_wildcard_asset() {
        assert!(AssetId::from("*").is_wildcard());
        assert!(!AssetId::from("ETHUSD").is_wildcard());
    }
}
