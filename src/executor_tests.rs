//! Unit tests for order sizing and the short-executor state machine.

#[cfg(test)]
mod executor_tests {
    use crate::error::ExchangeError;
    use crate::exchange::traits::MarginApi;
    use crate::exchange::types::{
        AssetBalance, BorrowResult, OrderResult, RepayResult, SymbolRules,
    };
    use crate::executor::{
        base_asset_of, round_down_to_step, size_order, ShortOrderExecutor, ShortRequest, Sizing,
    };
    use crate::tracker::{PositionStatus, PositionTracker, ShortPosition};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ============= Mock venue =============

    struct MockVenue {
        rules: SymbolRules,
        price: f64,
        max_borrowable: f64,
        /// Fraction of a borrow that is immediately spendable.
        settle_fraction: f64,
        fail_sell: bool,
        balances: Mutex<HashMap<String, AssetBalance>>,
        calls: Mutex<Vec<String>>,
        order_seq: AtomicUsize,
    }

    impl MockVenue {
        fn new() -> Self {
            Self {
                rules: SymbolRules {
                    min_qty: 0.00001,
                    step_size: 0.0001,
                    min_notional: 1.0,
                    margin_allowed: true,
                },
                price: 50_000.0,
                max_borrowable: 1.0,
                settle_fraction: 1.0,
                fail_sell: false,
                balances: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                order_seq: AtomicUsize::new(0),
            }
        }

        fn with_free(self, asset: &str, amount: f64) -> Self {
            self.balances.lock().unwrap().entry(asset.to_string()).or_default().free = amount;
            self
        }

        fn with_borrowed(self, asset: &str, amount: f64) -> Self {
            self.balances
                .lock()
                .unwrap()
                .entry(asset.to_string())
                .or_default()
                .borrowed = amount;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn next_order_id(&self) -> String {
            format!("ord-{}", self.order_seq.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl MarginApi for MockVenue {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn ping(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn margin_balance(&self, asset: &str) -> Result<AssetBalance, ExchangeError> {
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(asset)
                .copied()
                .unwrap_or_default())
        }

        async fn symbol_rules(&self, _symbol: &str) -> Result<SymbolRules, ExchangeError> {
            Ok(self.rules)
        }

        async fn price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
            Ok(self.price)
        }

        async fn max_borrowable(&self, _asset: &str) -> Result<f64, ExchangeError> {
            Ok(self.max_borrowable)
        }

        async fn borrow(&self, asset: &str, amount: f64) -> Result<BorrowResult, ExchangeError> {
            self.record(format!("borrow:{}:{:.8}", asset, amount));
            let mut balances = self.balances.lock().unwrap();
            let entry = balances.entry(asset.to_string()).or_default();
            entry.borrowed += amount;
            entry.free += amount * self.settle_fraction;
            Ok(BorrowResult {
                tran_id: "tran-1".to_string(),
            })
        }

        async fn repay(&self, asset: &str, amount: f64) -> Result<RepayResult, ExchangeError> {
            self.record(format!("repay:{}:{:.8}", asset, amount));
            let mut balances = self.balances.lock().unwrap();
            let entry = balances.entry(asset.to_string()).or_default();
            entry.borrowed = (entry.borrowed - amount).max(0.0);
            entry.free = (entry.free - amount).max(0.0);
            Ok(RepayResult {
                tran_id: "tran-2".to_string(),
            })
        }

        async fn sell_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
            self.record(format!("sell:{}:{:.8}", symbol, qty));
            if self.fail_sell {
                return Err(ExchangeError::VenueRejected {
                    code: -2010,
                    msg: "insufficient balance".to_string(),
                });
            }
            let base = base_asset_of(symbol);
            let mut balances = self.balances.lock().unwrap();
            let entry = balances.entry(base).or_default();
            entry.free = (entry.free - qty).max(0.0);
            Ok(OrderResult {
                order_id: self.next_order_id(),
                executed_qty: qty,
                avg_price: self.price,
            })
        }

        async fn buy_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
            self.record(format!("buy:{}:{:.8}", symbol, qty));
            let base = base_asset_of(symbol);
            let mut balances = self.balances.lock().unwrap();
            balances.entry(base).or_default().free += qty;
            Ok(OrderResult {
                order_id: self.next_order_id(),
                executed_qty: qty,
                avg_price: self.price,
            })
        }
    }

    fn executor(venue: Arc<MockVenue>) -> (ShortOrderExecutor, PositionTracker) {
        let tracker = PositionTracker::new();
        let exec = ShortOrderExecutor::new(venue, tracker.clone())
            .with_settle_delay(Duration::ZERO)
            .with_cooldown(Duration::ZERO);
        (exec, tracker)
    }

    fn btc_request(sizing: Sizing) -> ShortRequest {
        ShortRequest {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            fallback_quote: "USDC".to_string(),
            leverage: 2,
            sizing,
        }
    }

    fn active_short(id: &str) -> ShortPosition {
        ShortPosition {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            quantity: 0.0003,
            leverage: 1,
            entry_price: 50_000.0,
            opened_at: "2026-01-01T00:00:00Z".to_string(),
            status: PositionStatus::Active,
        }
    }

    // ============= Sizing helpers =============

    #[test]
    fn test_round_down_never_up() {
        let rounded = round_down_to_step(0.000237, 0.0001);
        assert!((rounded - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn test_round_down_zero_step_passthrough() {
        assert_eq!(round_down_to_step(0.000237, 0.0), 0.000237);
    }

    #[test]
    fn test_size_order_rounds_target_down() {
        let rules = SymbolRules {
            min_qty: 0.0001,
            step_size: 0.0001,
            min_notional: 1.0,
            margin_allowed: true,
        };
        let qty = size_order(0.000237, 50_000.0, &rules);
        assert!((qty - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn test_size_order_min_notional_takes_precedence() {
        let rules = SymbolRules {
            min_qty: 0.00001,
            step_size: 0.00001,
            min_notional: 10.0,
            margin_allowed: true,
        };
        // Fixed target is worth 1.5, far under the venue minimum of 10.
        let qty = size_order(0.00003, 50_000.0, &rules);
        assert!(qty * 50_000.0 >= 10.0 - 1e-6);
    }

    #[test]
    fn test_size_order_restores_min_notional_after_floor() {
        let rules = SymbolRules {
            min_qty: 0.0001,
            step_size: 0.0001,
            min_notional: 10.0,
            margin_allowed: true,
        };
        // 10 / 43000 = 0.000232..., flooring to 0.0002 would be worth 8.6.
        let qty = size_order(0.00003, 43_000.0, &rules);
        assert!(qty * 43_000.0 >= 10.0 - 1e-6);
    }

    #[test]
    fn test_size_order_invalid_inputs() {
        let rules = SymbolRules {
            min_qty: 0.0001,
            step_size: 0.0001,
            min_notional: 10.0,
            margin_allowed: true,
        };
        assert_eq!(size_order(0.0, 50_000.0, &rules), 0.0);
        assert_eq!(size_order(0.0001, 0.0, &rules), 0.0);
    }

    #[test]
    fn test_base_asset_of() {
        assert_eq!(base_asset_of("BTCUSDT"), "BTC");
        assert_eq!(base_asset_of("ETHUSDC"), "ETH");
        assert_eq!(base_asset_of("WEIRD"), "WEIRD");
    }

    // ============= Open-short state machine =============

    #[tokio::test]
    async fn test_open_short_records_position() {
        let venue = Arc::new(MockVenue::new().with_free("USDT", 100.0));
        let (exec, tracker) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(report.success);
        assert_eq!(report.order_id.as_deref(), Some("ord-1"));
        let open = tracker.open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "ord-1");
        assert_eq!(open[0].status, PositionStatus::Active);
        assert!((open[0].quantity - 0.0002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_open_short_shrinks_to_max_borrowable() {
        let mut venue = MockVenue::new();
        venue.max_borrowable = 0.0001;
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, tracker) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        // Shrunk, not aborted: the position records at the shrunk size.
        assert!(report.success);
        assert!((report.quantity - 0.0001).abs() < 1e-12);
        assert!((tracker.open_positions()[0].quantity - 0.0001).abs() < 1e-12);
        assert!(venue
            .calls()
            .iter()
            .any(|c| c == "sell:BTCUSDT:0.00010000"));
    }

    #[tokio::test]
    async fn test_open_short_never_sells_more_than_free() {
        let mut venue = MockVenue::new();
        venue.settle_fraction = 0.5;
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, _tracker) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(report.success);
        assert!((report.quantity - 0.0001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_open_short_aborts_on_zero_borrow_capacity() {
        let mut venue = MockVenue::new();
        venue.max_borrowable = 0.0;
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, tracker) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(!report.success);
        assert!(tracker.open_positions().is_empty());
        assert!(!venue.calls().iter().any(|c| c.starts_with("borrow")));
        assert!(!venue.calls().iter().any(|c| c.starts_with("sell")));
    }

    #[tokio::test]
    async fn test_open_short_requires_collateral() {
        let venue = Arc::new(MockVenue::new());
        let (exec, _) = executor(venue);

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(!report.success);
        assert!(report.message.contains("collateral"));
    }

    #[tokio::test]
    async fn test_open_short_accepts_secondary_collateral() {
        let venue = Arc::new(MockVenue::new().with_free("USDC", 50.0));
        let (exec, tracker) = executor(venue);

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(report.success);
        assert_eq!(tracker.open_positions()[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_open_short_rejects_non_margin_symbol() {
        let mut venue = MockVenue::new();
        venue.rules.margin_allowed = false;
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, _) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(!report.success);
        assert!(report.message.contains("not permitted"));
        assert!(venue.calls().is_empty());
    }

    #[tokio::test]
    async fn test_balance_fraction_sizing() {
        let mut venue = MockVenue::new();
        venue.price = 100.0;
        venue.rules = SymbolRules {
            min_qty: 0.001,
            step_size: 0.001,
            min_notional: 1.0,
            margin_allowed: true,
        };
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, _) = executor(venue);

        // Committed collateral caps at 3.0; 3.0 * 0.95 * 2 / 100 = 0.057,
        // floored to the 0.001 step.
        let report = exec.open_short(&btc_request(Sizing::balance_driven())).await;

        assert!(report.success);
        assert!(report.quantity <= 0.057 + 1e-9);
        assert!(report.quantity >= 0.057 - 0.001 - 1e-9);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_double_fire() {
        let venue = Arc::new(MockVenue::new().with_free("USDT", 100.0));
        let tracker = PositionTracker::new();
        let exec = ShortOrderExecutor::new(venue.clone(), tracker)
            .with_settle_delay(Duration::ZERO)
            .with_cooldown(Duration::from_secs(60));

        let first = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;
        let second = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        assert!(first.success);
        assert!(!second.success);
        let sells = venue
            .calls()
            .iter()
            .filter(|c| c.starts_with("sell"))
            .count();
        assert_eq!(sells, 1);
    }

    #[tokio::test]
    async fn test_failed_sell_leaves_debt_for_reconciliation() {
        let mut venue = MockVenue::new();
        venue.fail_sell = true;
        let venue = Arc::new(venue.with_free("USDT", 100.0));
        let (exec, tracker) = executor(venue.clone());

        let report = exec
            .open_short(&btc_request(Sizing::FixedQuantity { qty: 0.0002 }))
            .await;

        // The run failed after borrowing; no position was recorded but the
        // loan is real. Reconciliation must adopt it.
        assert!(!report.success);
        assert!(tracker.open_positions().is_empty());

        tracker
            .reconcile(venue.as_ref(), "BTC", "BTCUSDT")
            .await
            .unwrap();
        let adopted = tracker.open_positions();
        assert_eq!(adopted.len(), 1);
        assert!((adopted[0].quantity - 0.0002).abs() < 1e-12);
    }

    // ============= Unwind =============

    #[tokio::test]
    async fn test_close_short_idempotent_without_debt() {
        let venue = Arc::new(MockVenue::new());
        let (exec, tracker) = executor(venue.clone());
        let position = active_short("ord-9");
        tracker.add(position.clone());

        let report = exec.close_short(&position).await;

        assert!(report.success);
        assert!(report.message.contains("already closed"));
        assert_eq!(tracker.find("ord-9").unwrap().status, PositionStatus::Closed);
        assert!(venue.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_short_buys_shortfall_and_repays() {
        let venue = Arc::new(
            MockVenue::new()
                .with_borrowed("BTC", 0.0003)
                .with_free("BTC", 0.0001),
        );
        let (exec, tracker) = executor(venue.clone());
        let position = active_short("ord-9");
        tracker.add(position.clone());

        let report = exec.close_short(&position).await;

        assert!(report.success);
        let calls = venue.calls();
        assert!(calls.iter().any(|c| c == "buy:BTCUSDT:0.00020000"));
        assert!(calls.iter().any(|c| c == "repay:BTC:0.00030000"));
        assert_eq!(tracker.find("ord-9").unwrap().status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_short_repays_directly_when_free_covers_debt() {
        let venue = Arc::new(
            MockVenue::new()
                .with_borrowed("BTC", 0.0002)
                .with_free("BTC", 0.0005),
        );
        let (exec, tracker) = executor(venue.clone());
        let position = active_short("ord-9");
        tracker.add(position.clone());

        let report = exec.close_short(&position).await;

        assert!(report.success);
        assert!(!venue.calls().iter().any(|c| c.starts_with("buy")));
        assert!(venue.calls().iter().any(|c| c == "repay:BTC:0.00020000"));
        assert_eq!(tracker.find("ord-9").unwrap().status, PositionStatus::Closed);
    }
}
