use async_trait::async_trait;

use crate::error::ExchangeError;

use super::types::{AssetBalance, BorrowResult, OrderResult, RepayResult, SymbolRules};

/// Primitive margin-trading operations against a venue.
///
/// Market orders never trigger automatic side-borrowing: the executor, not
/// the venue, controls when a loan is taken.
#[async_trait]
pub trait MarginApi: Send + Sync {
    fn name(&self) -> &'static str;

    /// Venue reachability plus margin-account access self-test.
    async fn ping(&self) -> Result<(), ExchangeError>;

    /// Free/locked/borrowed amounts for one asset. An asset the account has
    /// never touched reports all-zero, not an error.
    async fn margin_balance(&self, asset: &str) -> Result<AssetBalance, ExchangeError>;

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    async fn price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Maximum amount of `asset` the venue will currently lend.
    async fn max_borrowable(&self, asset: &str) -> Result<f64, ExchangeError>;

    async fn borrow(&self, asset: &str, amount: f64) -> Result<BorrowResult, ExchangeError>;

    async fn repay(&self, asset: &str, amount: f64) -> Result<RepayResult, ExchangeError>;

    async fn sell_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError>;

    async fn buy_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError>;
}
