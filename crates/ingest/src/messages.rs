//! Inbound price message parsing

use serde::Deserialize;
use serde_json::Value;

use publisher_core::{
    AssetId, DecimalValue, IngestError, IngestResult, Metadata, ValueUpdate, WebsocketMessage,
};

pub const PRICES_MESSAGE_TYPE: &str = "prices";

/// One element of a `prices` frame
#[derive(Debug, Clone, Deserialize)]
pub struct ValueUpdatePush {
    #[serde(rename = "t")]
    pub publish_timestamp_nano: i64,
    #[serde(rename = "a")]
    pub asset: AssetId,
    /// Number or decimal string
    #[serde(rename = "p", alias = "v")]
    pub value: Value,
    #[serde(rename = "m", default)]
    pub metadata: Option<Metadata>,
}

impl ValueUpdatePush {
    pub fn into_value_update(self) -> IngestResult<ValueUpdate> {
        let value = parse_value(&self.asset, &self.value)?;
        Ok(ValueUpdate {
            publish_timestamp_nano: self.publish_timestamp_nano,
            asset: self.asset,
            value,
            metadata: self.metadata.unwrap_or_default(),
        })
    }
}

fn parse_value(asset: &AssetId, value: &Value) -> IngestResult<DecimalValue> {
    let invalid = |source| IngestError::InvalidValue {
        asset: asset.to_string(),
        source,
    };

    match value {
        // exact text of the number is kept by serde_json's arbitrary precision
        Value::Number(number) => number.to_string().parse().map_err(invalid),
        Value::String(text) => text.parse().map_err(invalid),
        Value::Null => Err(IngestError::UnsupportedValue("null".to_string())),
        Value::Bool(_) => Err(IngestError::UnsupportedValue("bool".to_string())),
        Value::Array(_) => Err(IngestError::UnsupportedValue("array".to_string())),
        Value::Object(_) => Err(IngestError::UnsupportedValue("object".to_string())),
    }
}

/// Parse a push frame. Frames of any type other than `prices` yield nothing.
pub fn parse_price_message(text: &str) -> Vec<IngestResult<ValueUpdate>> {
    match serde_json::from_str::<WebsocketMessage<Vec<Value>>>(text) {
        Ok(message) if message.msg_type == PRICES_MESSAGE_TYPE => {
            convert_elements(message.data.unwrap_or_default())
        }
        Ok(_) => vec![],
        Err(e) => vec![Err(IngestError::Parse(e))],
    }
}

/// Parse a frame read from an upstream pull source, whatever its type
pub fn parse_pull_message(text: &str) -> Vec<IngestResult<ValueUpdate>> {
    match serde_json::from_str::<WebsocketMessage<Vec<Value>>>(text) {
        Ok(message) => convert_elements(message.data.unwrap_or_default()),
        Err(e) => vec![Err(IngestError::Parse(e))],
    }
}

fn convert_elements(elements: Vec<Value>) -> Vec<IngestResult<ValueUpdate>> {
    elements
        .into_iter()
        .map(|element| {
            serde_json::from_value::<ValueUpdatePush>(element)
                .map_err(IngestError::Parse)
                .and_then(ValueUpdatePush::into_value_update)
        })
        .collect()
}
