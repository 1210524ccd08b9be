//! Signing capability consumed by the processor
//!
//! Scheme-specific signing (EVM/ECDSA, STARK) lives behind this trait; one
//! processor is instantiated per configured signer.

use publisher_core::{
    AssetId, PublisherKey, QuantizedPrice, SignatureType, SignerResult, TimestampedSignature,
};

/// Result of signing one quantized price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutput {
    pub timestamped_signature: TimestampedSignature,
    /// Scheme-specific encoding of the asset id that was signed over
    pub external_asset_id: String,
}

pub trait Signer: Send + Sync {
    fn sign(
        &self,
        quantized_price: &QuantizedPrice,
        asset: &AssetId,
        timestamp_nano: u64,
    ) -> SignerResult<SignOutput>;

    fn publisher_key(&self) -> PublisherKey;

    fn signature_type(&self) -> SignatureType;
}
