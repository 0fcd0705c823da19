//! Application-wide constants and magic numbers
//!
//! This module centralizes all hardcoded values to improve maintainability
//! and make the codebase easier to tune.

use std::time::Duration;

/// Trading and exchange constants
pub mod trading {
    /// Maximum leverage accepted in settings (Binance margin cap).
    pub const MAX_LEVERAGE: u32 = 20;

    /// Hard cap on the quote currency committed to a single short.
    pub const MAX_QUOTE_COMMIT: f64 = 3.0;

    /// Fixed base-asset quantity targeted by the default sizing strategy.
    pub const DEFAULT_TARGET_QUANTITY: f64 = 0.000_03;

    /// Fallback minimum notional when the venue omits the filter.
    pub const FALLBACK_MIN_NOTIONAL: f64 = 10.0;

    /// Collateral fraction used by balance-driven sizing (leave room for fees).
    pub const BALANCE_SIZING_SAFETY: f64 = 0.95;

    /// Preferred collateral/quote asset.
    pub const PRIMARY_QUOTE: &str = "USDT";

    /// Accepted substitute collateral when the primary balance is zero.
    pub const SECONDARY_QUOTE: &str = "USDC";

    /// Treat venue-reported amounts below this as zero.
    pub const QTY_EPSILON: f64 = 0.000_000_01;
}

/// Alert-pipeline constants
pub mod pipeline {
    use super::*;

    /// Poll interval used when settings carry no value.
    pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3;

    /// Longer wait after a failed iteration before polling again.
    pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);
}

/// Short-executor constants
pub mod executor {
    use super::*;

    /// Borrowed funds are not instantly spendable; wait before selling.
    pub const BORROW_SETTLE_DELAY: Duration = Duration::from_secs(2);

    /// Per-symbol cooldown between executor runs. Stops a manual trigger
    /// racing the pipeline from double-firing the same symbol.
    pub const ORDER_COOLDOWN: Duration = Duration::from_secs(30);
}

/// External request constants
pub mod http {
    use super::*;

    /// Bound on every outbound call (venue, feed); nothing may hang the loop.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}
