//! Converts raw on-chain amounts (smallest unit, 18 decimals) into point deltas.
//!
//! All arithmetic is exact: the raw integer is parsed into a `U256` and then
//! lifted into a `BigDecimal` with scale 18, so no binary floating point is
//! involved at any step.

use std::str::FromStr;

use alloy_primitives::U256;
use bigdecimal::BigDecimal;

use crate::error::PointsError;

/// Number of decimals of the staked token.
pub const TOKEN_DECIMALS: u32 = 18;

/// Points credited per whole staked token unless configured otherwise.
pub const DEFAULT_PRECISION: u32 = 100;

/// Pure amount → points conversion with a fixed scaling factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountNormalizer {
    precision: BigDecimal,
}

impl AmountNormalizer {
    /// `precision` is the number of points per whole token; must be positive.
    pub fn new(precision: BigDecimal) -> Result<Self, PointsError> {
        if precision <= BigDecimal::from(0) {
            return Err(PointsError::Config(format!(
                "points precision must be positive, got {precision}"
            )));
        }
        Ok(Self { precision })
    }

    pub fn precision(&self) -> &BigDecimal {
        &self.precision
    }

    /// `points = raw / 10^18 * precision`.
    pub fn points_delta(&self, raw_amount: &str) -> Result<BigDecimal, PointsError> {
        let amount = parse_raw_amount(raw_amount)?;
        let units = to_display_units(amount)?;
        Ok(&units * &self.precision)
    }
}

impl Default for AmountNormalizer {
    fn default() -> Self {
        Self {
            precision: BigDecimal::from(DEFAULT_PRECISION),
        }
    }
}

/// Parse a raw unsigned amount given as `0x`-prefixed hex or plain decimal.
pub fn parse_raw_amount(raw: &str) -> Result<U256, PointsError> {
    let s = raw.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    if digits.is_empty() {
        return Err(PointsError::malformed(format!("empty amount '{raw}'")));
    }
    let valid = match radix {
        16 => digits.bytes().all(|b| b.is_ascii_hexdigit()),
        _ => digits.bytes().all(|b| b.is_ascii_digit()),
    };
    if !valid {
        return Err(PointsError::malformed(format!("amount '{raw}' is not an unsigned integer")));
    }
    U256::from_str_radix(digits, radix)
        .map_err(|e| PointsError::malformed(format!("amount '{raw}' out of range: {e}")))
}

/// Divide a smallest-unit amount by `10^18`, exactly.
pub fn to_display_units(amount: U256) -> Result<BigDecimal, PointsError> {
    BigDecimal::from_str(&format!("{amount}e-{TOKEN_DECIMALS}"))
        .map_err(|e| PointsError::Other(format!("decimal conversion of {amount}: {e}")))
}
