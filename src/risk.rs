// ===============================
// src/risk.rs
// ===============================
//
// Aturan sizing sebelum order dikirim:
// 1) size < 1.0 dianggap quotient dari budget -> round(budget * q / price)
// 2) volume minimum: price * size >= budget / 100
// 3) SELL: sisa posisi yang nilainya < budget / 100 ikut dijual (tutup penuh)
//
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("price must be positive to size a quotient, got {0}")]
    NonPositivePrice(f64),
    #[error("resolved size {0} is not a positive integer")]
    NonPositiveSize(f64),
    #[error("no trading budget configured")]
    NoBudget,
    #[error("position size is too small: value {value} < minimum {minimum}")]
    TooSmall { value: f64, minimum: f64 },
}

/// Smallest order value worth sending (1% of budget).
pub fn min_volume(budget: f64) -> f64 {
    budget / 100.0
}

/// Quotients (< 1.0) are a fraction of budget; anything else is an absolute unit count.
pub fn resolve_size(size: f64, price: f64, budget: f64) -> Result<u64, RiskError> {
    let units = if size < 1.0 {
        if price <= 0.0 {
            return Err(RiskError::NonPositivePrice(price));
        }
        (budget * size / price).round_ties_even()
    } else {
        size.round_ties_even()
    };
    if !units.is_finite() || units < 1.0 {
        return Err(RiskError::NonPositiveSize(units));
    }
    Ok(units as u64)
}

/// A budget that is not a positive finite number rejects everything.
pub fn check_volume(price: f64, size: u64, budget: f64) -> Result<(), RiskError> {
    if !(budget.is_finite() && budget > 0.0) {
        return Err(RiskError::NoBudget);
    }
    let value = price * size as f64;
    let minimum = min_volume(budget);
    if value < minimum {
        return Err(RiskError::TooSmall { value, minimum });
    }
    Ok(())
}

/// Closes the whole position instead of leaving dust behind.
/// Can sell more than requested.
pub fn adjust_sell_size(existing: f64, requested: u64, price: f64, budget: f64) -> u64 {
    let remainder = (existing - requested as f64) * price;
    // NaN counts as dust
    if !(remainder >= min_volume(budget)) {
        existing.round_ties_even().max(0.0) as u64
    } else {
        requested
    }
}
