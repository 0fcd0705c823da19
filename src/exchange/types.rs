use serde::{Deserialize, Serialize};

/// Venue-reported trading constraints for a symbol.
///
/// Fetched fresh before every order placement; venues change these without
/// notice, so they are never cached.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SymbolRules {
    pub min_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub margin_allowed: bool,
}

/// Margin-account balance for one asset.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: f64,
    pub locked: f64,
    pub borrowed: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BorrowResult {
    pub tran_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepayResult {
    pub tran_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub executed_qty: f64,
    /// Volume-weighted fill price; 0.0 when the venue reports no fills.
    pub avg_price: f64,
}
