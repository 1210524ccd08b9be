//! Error types

use thiserror::Error;

/// Decimal parsing and quantization errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecimalError {
    #[error("value cannot be an empty string")]
    Empty,

    #[error("invalid decimal value: {0}")]
    Invalid(String),

    #[error("value is not finite: {0}")]
    NotFinite(f64),

    #[error("exponent out of range: {0}")]
    ExponentOutOfRange(i64),

    #[error("quantized price out of range: {0}")]
    OutOfRange(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("must specify at least one signature type")]
    NoSignatureTypes,

    #[error("oracle id length must be 5, got {0:?}")]
    InvalidOracleId(String),

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("must specify an incoming ws url to pull from or a port to expose for the incoming ws")]
    NoIngestSource,
}

/// Signing errors reported by a signer capability
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to sign {asset}: {reason}")]
    Failed { asset: String, reason: String },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Broker and ingest connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("auth headers unavailable: {0}")]
    Auth(#[from] AuthError),

    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,
}

/// Registry lookup errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to get broker list: {0}")]
    Request(String),

    #[error("not authorized to query the registry - check the configured auth token")]
    Unauthorized,

    #[error("failed to query the registry: {0}")]
    Remote(String),

    #[error("failed to unmarshal response from registry: {0}")]
    InvalidResponse(String),

    #[error("auth headers unavailable: {0}")]
    Auth(#[from] AuthError),
}

/// Auth header errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("auth signer failed: {0}")]
    Failed(String),
}

/// Ingest errors
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to parse incoming message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {asset}: {source}")]
    InvalidValue {
        asset: String,
        #[source]
        source: DecimalError,
    },

    #[error("unsupported type for value: {0}")]
    UnsupportedValue(String),
}

/// Result type alias
pub type DecimalResult<T> = Result<T, DecimalError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SignerResult<T> = Result<T, SignerError>;
pub type ConnectionResult<T> = Result<T, ConnectionError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
pub type IngestResult<T> = Result<T, IngestError>;
