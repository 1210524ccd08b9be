//! Exact decimal values and 10^18 fixed-point quantization
//!
//! Prices arrive either as JSON numbers or decimal strings. They are kept as
//! digit strings so quantization never loses precision, however many digits
//! the publisher sends.

use alloy_primitives::I256;
use std::fmt;
use std::str::FromStr;

use crate::errors::{DecimalError, DecimalResult};
use crate::types::QuantizedPrice;

/// Fixed-point scale of a quantized price
pub const QUANTIZED_DECIMALS: i64 = 18;

/// Low-order digits zeroed out after scaling
pub const QUANTIZED_NOISE_DIGITS: usize = 6;

const MAX_EXPONENT: i64 = 10_000;

/// Arbitrary-precision decimal: `digits × 10^exponent`
///
/// Kept as a digit string rather than `rust_decimal::Decimal`, whose 96-bit
/// mantissa caps values at 28 significant digits. Publishers may send more,
/// and quantization must not round them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecimalValue {
    negative: bool,
    /// No leading zeros; "0" for zero
    digits: String,
    exponent: i64,
}

impl DecimalValue {
    pub fn zero() -> Self {
        Self {
            negative: false,
            digits: "0".to_string(),
            exponent: 0,
        }
    }

    /// Convert a float through its shortest round-trip decimal rendering
    pub fn from_f64(value: f64) -> DecimalResult<Self> {
        if !value.is_finite() {
            return Err(DecimalError::NotFinite(value));
        }
        format!("{}", value).parse()
    }

    pub fn is_zero(&self) -> bool {
        self.digits == "0"
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Scale by 10^18 truncating toward zero, then zero the low 6 digits.
    pub fn quantize(&self) -> QuantizedPrice {
        let shift = self.exponent + QUANTIZED_DECIMALS;

        let scaled = if self.is_zero() {
            String::from("0")
        } else if shift >= 0 {
            let mut s = self.digits.clone();
            s.extend(std::iter::repeat('0').take(shift as usize));
            s
        } else {
            let cut = shift.unsigned_abs() as usize;
            if cut >= self.digits.len() {
                String::from("0")
            } else {
                self.digits[..self.digits.len() - cut].to_string()
            }
        };

        let magnitude = if scaled.len() > QUANTIZED_NOISE_DIGITS {
            let mut s = scaled[..scaled.len() - QUANTIZED_NOISE_DIGITS].to_string();
            s.push_str(&"0".repeat(QUANTIZED_NOISE_DIGITS));
            s
        } else {
            String::from("0")
        };

        if self.negative && magnitude != "0" {
            QuantizedPrice(format!("-{}", magnitude))
        } else {
            QuantizedPrice(magnitude)
        }
    }
}

impl FromStr for DecimalValue {
    type Err = DecimalError;

    fn from_str(input: &str) -> DecimalResult<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(DecimalError::Empty);
        }
        let invalid = || DecimalError::Invalid(input.to_string());

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let (mantissa, exp_part) = match rest.find(['e', 'E']) {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let (int_part, frac_part) = match mantissa.find('.') {
            Some(idx) => (&mantissa[..idx], &mantissa[idx + 1..]),
            None => (mantissa, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let mut exponent: i64 = match exp_part {
            Some(e) => {
                let digits = e.strip_prefix(['+', '-']).unwrap_or(e);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                e.parse().map_err(|_| invalid())?
            }
            None => 0,
        };
        if exponent.unsigned_abs() > MAX_EXPONENT as u64 {
            return Err(DecimalError::ExponentOutOfRange(exponent));
        }
        exponent -= frac_part.len() as i64;

        let all_digits = format!("{}{}", int_part, frac_part);
        let trimmed = all_digits.trim_start_matches('0');

        if trimmed.is_empty() {
            return Ok(Self::zero());
        }

        Ok(Self {
            negative,
            digits: trimmed.to_string(),
            exponent,
        })
    }
}

impl fmt::Display for DecimalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        if self.exponent >= 0 {
            f.write_str(&self.digits)?;
            for _ in 0..self.exponent {
                f.write_str("0")?;
            }
            return Ok(());
        }

        let frac_len = self.exponent.unsigned_abs() as usize;
        if frac_len >= self.digits.len() {
            write!(f, "0.{}{}", "0".repeat(frac_len - self.digits.len()), self.digits)
        } else {
            let split = self.digits.len() - frac_len;
            write!(f, "{}.{}", &self.digits[..split], &self.digits[split..])
        }
    }
}

impl QuantizedPrice {
    /// Parse into a signed 256-bit integer for trigger arithmetic
    pub fn to_i256(&self) -> DecimalResult<I256> {
        I256::from_dec_str(&self.0).map_err(|_| DecimalError::OutOfRange(self.0.clone()))
    }
}
