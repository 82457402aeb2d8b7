//! Exact conversion between on-chain base units and display amounts.

use rust_decimal::Decimal;
use thiserror::Error;

pub const ETH_DECIMALS: u32 = 18;
pub const USDC_DECIMALS: u32 = 6;
pub const BTC_DECIMALS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("invalid base-unit amount: {0:?}")]
    Invalid(String),

    #[error("base-unit amount {0} does not fit a decimal")]
    Overflow(String),
}

/// `raw` smallest units expressed with `decimals` places, e.g. wei -> ETH.
pub fn from_base_units(raw: u128, decimals: u32) -> Result<Decimal, UnitError> {
    let mantissa = i128::try_from(raw).map_err(|_| UnitError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| UnitError::Overflow(raw.to_string()))
}

/// Same as [`from_base_units`] for amounts delivered as decimal strings.
pub fn parse_base_units(raw: &str, decimals: u32) -> Result<Decimal, UnitError> {
    let value = raw
        .trim()
        .parse::<u128>()
        .map_err(|_| UnitError::Invalid(raw.to_string()))?;
    from_base_units(value, decimals)
}
