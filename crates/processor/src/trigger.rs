//! Per-asset trigger policy

use alloy_primitives::{I256, U256};
use publisher_core::TriggerType;

/// Fixed-point scale applied to the threshold percent before integer comparison
const THRESHOLD_SCALE: f64 = 1e9;

/// Last value signed for an asset, owned by a single processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetTriggerState {
    pub last_signed_quantized: I256,
    pub last_signed_timestamp_nano: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerPolicy {
    /// 1.0 means 1%
    pub change_threshold_percent: f64,
    pub sign_every_update: bool,
}

impl TriggerPolicy {
    pub fn new(change_threshold_percent: f64, sign_every_update: bool) -> Self {
        Self {
            change_threshold_percent,
            sign_every_update,
        }
    }

    /// Decide whether a pending value must be signed at this delta tick
    pub fn evaluate(&self, previous: Option<&AssetTriggerState>, new: I256) -> Option<TriggerType> {
        if self.sign_every_update {
            return Some(TriggerType::Unspecified);
        }

        let previous = match previous {
            Some(state) => state,
            None => return Some(TriggerType::Delta),
        };

        let last = previous.last_signed_quantized;
        if last.is_zero() {
            return (!new.is_zero()).then_some(TriggerType::Delta);
        }

        self.exceeds_threshold(last, new).then_some(TriggerType::Delta)
    }

    /// `|new - last| / |last| * 100 >= threshold`
    fn exceeds_threshold(&self, last: I256, new: I256) -> bool {
        match self.exceeds_threshold_exact(last, new) {
            Some(result) => result,
            None => self.exceeds_threshold_float(last, new),
        }
    }

    fn exceeds_threshold_exact(&self, last: I256, new: I256) -> Option<bool> {
        let changed = new.checked_sub(last)?.unsigned_abs();
        let base = last.unsigned_abs();

        let scaled_threshold = (self.change_threshold_percent * THRESHOLD_SCALE).round();
        if !scaled_threshold.is_finite() || scaled_threshold > u128::MAX as f64 {
            return None;
        }
        let scaled_threshold = U256::from(scaled_threshold.max(0.0) as u128);

        let lhs = changed
            .checked_mul(U256::from(100u64))?
            .checked_mul(U256::from(THRESHOLD_SCALE as u64))?;
        let rhs = scaled_threshold.checked_mul(base)?;
        Some(lhs >= rhs)
    }

    fn exceeds_threshold_float(&self, last: I256, new: I256) -> bool {
        let last: f64 = last.to_string().parse().unwrap_or(f64::NAN);
        let new: f64 = new.to_string().parse().unwrap_or(f64::NAN);
        ((new - last) / last).abs() * 100.0 >= self.change_threshold_percent
    }
}
