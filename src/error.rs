//! Custom error types for the trading bot
//!
//! Every external boundary (social feed, classifier, exchange) gets its own
//! typed error so callers can distinguish transient failures from permanent
//! ones instead of string-matching.

use thiserror::Error;

/// Social-feed errors.
///
/// `RateLimited` must never trigger an immediate retry; the pipeline waits
/// for its next regular tick. `Unauthenticated` is fatal to the pipeline
/// until credentials are reconfigured.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("account not found: {account}")]
    NotFound { account: String },

    #[error("feed rate limited, retrying at next poll tick")]
    RateLimited,

    #[error("feed authentication failed: {reason}")]
    Unauthenticated { reason: String },

    #[error("feed network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed feed response: {0}")]
    Malformed(String),
}

/// Classifier errors. These never reach the pipeline: the classifier
/// boundary collapses every failure to "not an incident" with a warning.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classification service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed classifier reply: {0}")]
    Malformed(String),
}

/// Exchange gateway errors.
///
/// `VenueUnavailable` (network / 5xx) is transient and retry-worthy at the
/// next tick; `VenueRejected` (4xx business rule) is permanent for the
/// request as issued.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("venue unavailable: {reason}")]
    VenueUnavailable { reason: String },

    #[error("venue rejected request ({code}): {msg}")]
    VenueRejected { code: i64, msg: String },

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("insufficient borrow capacity for {asset}: requested {requested}, available {available}")]
    InsufficientBorrowCapacity {
        asset: String,
        requested: f64,
        available: f64,
    },

    #[error("exchange authentication failed: {reason}")]
    Unauthenticated { reason: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::VenueUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Short-executor failures. Each variant names the step that aborted the
/// run; a failure after `borrow` succeeded leaves the loan outstanding on
/// the venue (see `PositionTracker::reconcile`).
#[derive(Error, Debug)]
pub enum TradeError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("margin trading not permitted for {symbol}")]
    MarginNotPermitted { symbol: String },

    #[error("no {primary} or {secondary} collateral available")]
    NoCollateral { primary: String, secondary: String },

    #[error("order quantity for {symbol} rounded to zero (step {step})")]
    QuantityTooSmall { symbol: String, step: f64 },

    #[error("borrowed {asset} not spendable yet: free {free}")]
    BorrowedFundsUnavailable { asset: String, free: f64 },

    #[error("cooldown active for {symbol}")]
    CooldownActive { symbol: String },
}
