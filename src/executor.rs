//! Short-order execution.
//!
//! Opening a short is a multi-step sequence against the venue: fetch rules,
//! check collateral, size the order, borrow the base asset, sell it, record
//! the position. The sequence is not transactional; there is no compensating
//! rollback if a later step fails after `borrow` succeeded. The loan stays
//! outstanding on the venue and is surfaced by `PositionTracker::reconcile`,
//! never hidden.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::TradingSettings;
use crate::constants::{executor as tuning, trading};
use crate::error::{ExchangeError, TradeError};
use crate::exchange::traits::MarginApi;
use crate::exchange::types::SymbolRules;
use crate::tracker::{PositionStatus, PositionTracker, ShortPosition};

/// How the target quantity is derived.
#[derive(Clone, Copy, Debug)]
pub enum Sizing {
    /// Fixed base-asset quantity. Primary strategy.
    FixedQuantity { qty: f64 },
    /// Fraction of quote collateral, scaled by leverage. Futures-style
    /// alternative kept behind the same interface.
    BalanceFraction { fraction: f64 },
}

impl Sizing {
    /// Balance-driven sizing with the standard safety margin.
    pub fn balance_driven() -> Self {
        Sizing::BalanceFraction {
            fraction: trading::BALANCE_SIZING_SAFETY,
        }
    }
}

/// One executor invocation, fully specified so settings are read exactly
/// once per decision and never cached across decisions.
#[derive(Clone, Debug)]
pub struct ShortRequest {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub fallback_quote: String,
    pub leverage: u32,
    pub sizing: Sizing,
}

impl ShortRequest {
    pub fn from_settings(settings: &TradingSettings) -> Self {
        Self {
            symbol: settings.symbol(),
            base_asset: settings.target_coin.clone(),
            quote_asset: trading::PRIMARY_QUOTE.to_string(),
            fallback_quote: trading::SECONDARY_QUOTE.to_string(),
            leverage: settings.leverage,
            sizing: Sizing::FixedQuantity {
                qty: trading::DEFAULT_TARGET_QUANTITY,
            },
        }
    }
}

/// Structured outcome propagated to the pipeline and the control API.
#[derive(Clone, Debug)]
pub struct ShortReport {
    pub success: bool,
    pub order_id: Option<String>,
    pub position_id: Option<String>,
    pub quantity: f64,
    pub entry_price: f64,
    pub message: String,
}

impl ShortReport {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            position_id: None,
            quantity: 0.0,
            entry_price: 0.0,
            message: message.into(),
        }
    }
}

/// Per-symbol cooldown so concurrent triggers (pipeline + manual) cannot
/// double-fire the same market within the window.
#[derive(Clone)]
pub struct OrderCooldown {
    last_run: Arc<DashMap<String, Instant>>,
    min_interval: Duration,
}

impl OrderCooldown {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_run: Arc::new(DashMap::new()),
            min_interval,
        }
    }

    /// Returns true if a run is allowed for this symbol and claims the slot.
    pub fn try_acquire(&self, symbol: &str) -> bool {
        if let Some(entry) = self.last_run.get(symbol) {
            if entry.elapsed() < self.min_interval {
                return false;
            }
        }
        self.last_run.insert(symbol.to_string(), Instant::now());
        true
    }
}

pub struct ShortOrderExecutor {
    exchange: Arc<dyn MarginApi>,
    tracker: PositionTracker,
    cooldown: OrderCooldown,
    settle_delay: Duration,
}

impl ShortOrderExecutor {
    pub fn new(exchange: Arc<dyn MarginApi>, tracker: PositionTracker) -> Self {
        Self {
            exchange,
            tracker,
            cooldown: OrderCooldown::new(tuning::ORDER_COOLDOWN),
            settle_delay: tuning::BORROW_SETTLE_DELAY,
        }
    }

    /// Test hook: shorten the borrow-settle wait.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Test hook: change the per-symbol cooldown window.
    pub fn with_cooldown(mut self, window: Duration) -> Self {
        self.cooldown = OrderCooldown::new(window);
        self
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Open a short. Always returns a structured report; failures never
    /// panic and never cross this boundary as errors.
    pub async fn open_short(&self, request: &ShortRequest) -> ShortReport {
        if !self.cooldown.try_acquire(&request.symbol) {
            let e = TradeError::CooldownActive {
                symbol: request.symbol.clone(),
            };
            warn!("⚡ [EXECUTOR] {}", e);
            return ShortReport::failure(e.to_string());
        }

        info!(
            "⚡ [EXECUTOR] opening short on {} ({}x, {:?})",
            request.symbol, request.leverage, request.sizing
        );
        match self.try_open(request).await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ [EXECUTOR] short on {} aborted: {}", request.symbol, e);
                ShortReport::failure(e.to_string())
            }
        }
    }

    async fn try_open(&self, request: &ShortRequest) -> Result<ShortReport, TradeError> {
        let symbol = &request.symbol;

        // 1. Trading pair must exist and permit margin shorts.
        let rules = self.exchange.symbol_rules(symbol).await?;
        if !rules.margin_allowed {
            return Err(TradeError::MarginNotPermitted {
                symbol: symbol.clone(),
            });
        }

        // 2. Quote collateral, preferring the primary quote asset and
        //    substituting the secondary while still trading the primary pair.
        let primary = self.exchange.margin_balance(&request.quote_asset).await?;
        let collateral = if primary.free > trading::QTY_EPSILON {
            info!(
                "⚡ [EXECUTOR] using {} {} as collateral",
                primary.free, request.quote_asset
            );
            primary.free
        } else {
            let secondary = self.exchange.margin_balance(&request.fallback_quote).await?;
            if secondary.free <= trading::QTY_EPSILON {
                return Err(TradeError::NoCollateral {
                    primary: request.quote_asset.clone(),
                    secondary: request.fallback_quote.clone(),
                });
            }
            info!(
                "⚡ [EXECUTOR] substituting {} {} collateral for the {} market",
                secondary.free, request.fallback_quote, symbol
            );
            secondary.free
        };
        let committed = collateral.min(trading::MAX_QUOTE_COMMIT);

        // 3-5. Target size, minimum-notional bump, step rounding.
        let price = self.exchange.price(symbol).await?;
        let target = match request.sizing {
            Sizing::FixedQuantity { qty } => qty,
            Sizing::BalanceFraction { fraction } => {
                committed * fraction * f64::from(request.leverage) / price
            }
        };
        let mut qty = size_order(target, price, &rules);
        if qty <= 0.0 {
            return Err(TradeError::QuantityTooSmall {
                symbol: symbol.clone(),
                step: rules.step_size,
            });
        }
        info!(
            "⚡ [EXECUTOR] sized {} {} (~{} {})",
            qty,
            request.base_asset,
            qty * price,
            request.quote_asset
        );

        // 6. Shrink to what the venue will lend; zero capacity aborts.
        let borrowable = self.exchange.max_borrowable(&request.base_asset).await?;
        if borrowable <= trading::QTY_EPSILON {
            return Err(ExchangeError::InsufficientBorrowCapacity {
                asset: request.base_asset.clone(),
                requested: qty,
                available: borrowable,
            }
            .into());
        }
        if borrowable < qty {
            let shrunk = round_down_to_step(borrowable, rules.step_size);
            warn!(
                "⚡ [EXECUTOR] shrinking {} -> {} (max borrowable {})",
                qty, shrunk, borrowable
            );
            qty = shrunk;
            if qty <= 0.0 {
                return Err(ExchangeError::InsufficientBorrowCapacity {
                    asset: request.base_asset.clone(),
                    requested: qty,
                    available: borrowable,
                }
                .into());
            }
        }

        // 7. Borrow. From here on, failure leaves real venue-side debt.
        self.exchange.borrow(&request.base_asset, qty).await?;

        // 8. Borrowed funds may not be spendable immediately; wait, then
        //    never sell more than is actually free.
        sleep(self.settle_delay).await;
        let base = self.exchange.margin_balance(&request.base_asset).await?;
        if base.free < qty {
            let shrunk = round_down_to_step(base.free, rules.step_size);
            warn!(
                "⚡ [EXECUTOR] free {} {} below sell quantity {}, shrinking to {}",
                base.free, request.base_asset, qty, shrunk
            );
            qty = shrunk;
            if qty <= 0.0 {
                return Err(TradeError::BorrowedFundsUnavailable {
                    asset: request.base_asset.clone(),
                    free: base.free,
                });
            }
        }

        // 9. Market sell, no venue-side borrowing.
        let order = self.exchange.sell_market(symbol, qty).await?;

        // 10. Record only on confirmed fill, at the actual filled size.
        let filled = if order.executed_qty > 0.0 {
            order.executed_qty
        } else {
            qty
        };
        let entry_price = if order.avg_price > 0.0 {
            order.avg_price
        } else {
            price
        };
        let position = ShortPosition {
            id: order.order_id.clone(),
            symbol: symbol.clone(),
            quantity: filled,
            leverage: request.leverage,
            entry_price,
            opened_at: Utc::now().to_rfc3339(),
            status: PositionStatus::Active,
        };
        self.tracker.add(position);

        info!(
            "✅ [EXECUTOR] short opened on {}: {} @ {} (order {})",
            symbol, filled, entry_price, order.order_id
        );
        Ok(ShortReport {
            success: true,
            order_id: Some(order.order_id.clone()),
            position_id: Some(order.order_id),
            quantity: filled,
            entry_price,
            message: format!("short opened on {}", symbol),
        })
    }

    /// Unwind a short: buy back any shortfall, repay the loan. Zero debt is
    /// an idempotent success. A partial repay leaves the position `closing`
    /// until reconciliation observes zero debt.
    pub async fn close_short(&self, position: &ShortPosition) -> ShortReport {
        match self.try_close(position).await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ [EXECUTOR] close of {} failed: {}", position.id, e);
                ShortReport::failure(e.to_string())
            }
        }
    }

    async fn try_close(&self, position: &ShortPosition) -> Result<ShortReport, TradeError> {
        let base_asset = base_asset_of(&position.symbol);
        let balance = self.exchange.margin_balance(&base_asset).await?;

        if balance.borrowed <= trading::QTY_EPSILON {
            info!(
                "⚡ [EXECUTOR] no outstanding {} loan, short {} already closed",
                base_asset, position.id
            );
            self.tracker.mark_closed(&position.id);
            return Ok(ShortReport {
                success: true,
                order_id: None,
                position_id: Some(position.id.clone()),
                quantity: 0.0,
                entry_price: 0.0,
                message: "already closed".to_string(),
            });
        }

        self.tracker.mark_closing(&position.id);

        let mut free = balance.free;
        let debt = balance.borrowed;
        let mut buy_order_id = None;

        if free < debt {
            let shortfall = debt - free;
            info!(
                "⚡ [EXECUTOR] buying back {} {} to cover the loan",
                shortfall, base_asset
            );
            match self.exchange.buy_market(&position.symbol, shortfall).await {
                Ok(order) => {
                    buy_order_id = Some(order.order_id);
                    free = self.exchange.margin_balance(&base_asset).await?.free;
                }
                Err(e) => {
                    // Partial repayment with what is free is still progress.
                    warn!(
                        "⚠️ [EXECUTOR] buy-back failed ({}), repaying from free balance",
                        e
                    );
                }
            }
        }

        let repay_amount = debt.min(free);
        if repay_amount <= trading::QTY_EPSILON {
            return Err(TradeError::BorrowedFundsUnavailable {
                asset: base_asset,
                free,
            });
        }
        self.exchange.repay(&base_asset, repay_amount).await?;

        let remaining = self.exchange.margin_balance(&base_asset).await?.borrowed;
        if remaining <= trading::QTY_EPSILON {
            self.tracker.mark_closed(&position.id);
            info!("✅ [EXECUTOR] short {} closed", position.id);
            Ok(ShortReport {
                success: true,
                order_id: buy_order_id,
                position_id: Some(position.id.clone()),
                quantity: repay_amount,
                entry_price: 0.0,
                message: format!("repaid {} {}", repay_amount, base_asset),
            })
        } else {
            warn!(
                "⚠️ [EXECUTOR] short {} partially repaid, {} {} still borrowed",
                position.id, remaining, base_asset
            );
            Ok(ShortReport {
                success: true,
                order_id: buy_order_id,
                position_id: Some(position.id.clone()),
                quantity: repay_amount,
                entry_price: 0.0,
                message: format!(
                    "partially repaid, {} {} outstanding until reconciliation",
                    remaining, base_asset
                ),
            })
        }
    }
}

/// Base asset of a pair quoted in one of the supported quote assets.
pub fn base_asset_of(symbol: &str) -> String {
    for quote in [trading::PRIMARY_QUOTE, trading::SECONDARY_QUOTE] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    symbol.to_string()
}

/// Round a quantity down to the venue's step size. Never rounds up:
/// rounding up could exceed the balance or the borrow limit.
pub fn round_down_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).floor() * step
}

/// Final order quantity for a raw target under the venue's rules.
///
/// The minimum-notional bump takes precedence over the target size (the
/// venue rejects under-minimum orders outright), then the minimum-quantity
/// floor, then round-down to the step. When flooring drops a bumped
/// quantity back under the minimum notional, one step is restored so the
/// order stays placeable.
pub fn size_order(target: f64, price: f64, rules: &SymbolRules) -> f64 {
    if price <= 0.0 || target <= 0.0 {
        return 0.0;
    }
    let mut qty = target;
    let mut bumped = false;
    if qty * price < rules.min_notional {
        qty = rules.min_notional / price;
        bumped = true;
    }
    if qty < rules.min_qty {
        qty = rules.min_qty;
    }
    qty = round_down_to_step(qty, rules.step_size);
    if bumped && qty * price < rules.min_notional && rules.step_size > 0.0 {
        qty += rules.step_size;
    }
    qty
}
