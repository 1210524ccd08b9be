//! Trigger evaluation, quantization and signing of raw value updates

pub mod processor;
pub mod signer;
pub mod trigger;

pub use processor::{PriceUpdateProcessor, ProcessorStats};
pub use signer::{SignOutput, Signer};
pub use trigger::{AssetTriggerState, TriggerPolicy};
