//! Authoritative in-memory view of the short positions this bot opened.
//!
//! The open-position set is the bot's entire transactional memory. Because
//! the borrow/sell sequence is not transactional on the venue, the tracker
//! also reconciles against venue-reported debt so an outstanding loan is
//! never invisible to the operator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::constants::trading;
use crate::error::ExchangeError;
use crate::exchange::traits::MarginApi;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closing,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShortPosition {
    pub id: String,
    pub symbol: String,
    pub quantity: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub opened_at: String,
    pub status: PositionStatus,
}

#[derive(Clone)]
pub struct PositionTracker {
    positions: Arc<Mutex<Vec<ShortPosition>>>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            positions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add(&self, position: ShortPosition) {
        let mut positions = self.positions.lock().unwrap();
        info!(
            "📊 [TRACKER] added short {}: {} {} @ {} ({}x)",
            position.id, position.quantity, position.symbol, position.entry_price, position.leverage
        );
        positions.push(position);
    }

    pub fn remove(&self, id: &str) -> Option<ShortPosition> {
        let mut positions = self.positions.lock().unwrap();
        let index = positions.iter().position(|p| p.id == id)?;
        let removed = positions.remove(index);
        info!("📊 [TRACKER] removed short {}", removed.id);
        Some(removed)
    }

    pub fn find(&self, id: &str) -> Option<ShortPosition> {
        let positions = self.positions.lock().unwrap();
        positions.iter().find(|p| p.id == id).cloned()
    }

    /// All positions in insertion order, including closed ones.
    pub fn list(&self) -> Vec<ShortPosition> {
        self.positions.lock().unwrap().clone()
    }

    /// Positions that still carry exposure (active or closing).
    pub fn open_positions(&self) -> Vec<ShortPosition> {
        self.positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect()
    }

    pub fn has_open_for(&self, symbol: &str) -> bool {
        self.positions
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.symbol == symbol && p.status != PositionStatus::Closed)
    }

    pub fn mark_closing(&self, id: &str) {
        self.set_status(id, PositionStatus::Closing);
    }

    pub fn mark_closed(&self, id: &str) {
        self.set_status(id, PositionStatus::Closed);
    }

    fn set_status(&self, id: &str, status: PositionStatus) {
        let mut positions = self.positions.lock().unwrap();
        if let Some(position) = positions.iter_mut().find(|p| p.id == id) {
            position.status = status;
            info!("📊 [TRACKER] short {} -> {:?}", id, status);
        }
    }

    /// Compare tracked state against venue-reported debt for `base_asset`.
    ///
    /// Venue debt with no tracked open position means a run failed after
    /// borrowing (or a restart lost state): adopt it so the operator sees
    /// the exposure. Zero debt promotes any `closing` position on the symbol
    /// to `closed`.
    pub async fn reconcile(
        &self,
        exchange: &dyn MarginApi,
        base_asset: &str,
        symbol: &str,
    ) -> Result<(), ExchangeError> {
        let balance = exchange.margin_balance(base_asset).await?;

        if balance.borrowed > trading::QTY_EPSILON {
            if !self.has_open_for(symbol) {
                let entry_price = match exchange.price(symbol).await {
                    Ok(price) => price,
                    Err(e) => {
                        warn!("🔄 [RECONCILE] no price for {}: {}", symbol, e);
                        0.0
                    }
                };
                warn!(
                    "🔄 [RECONCILE] venue reports {} {} borrowed with no tracked short; adopting",
                    balance.borrowed, base_asset
                );
                self.add(ShortPosition {
                    id: format!("margin-{}-{}", base_asset.to_lowercase(), uuid::Uuid::new_v4()),
                    symbol: symbol.to_string(),
                    quantity: balance.borrowed,
                    leverage: 1,
                    entry_price,
                    opened_at: Utc::now().to_rfc3339(),
                    status: PositionStatus::Active,
                });
            }
        } else {
            let closing: Vec<String> = self
                .positions
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.symbol == symbol && p.status == PositionStatus::Closing)
                .map(|p| p.id.clone())
                .collect();
            for id in closing {
                info!("🔄 [RECONCILE] debt cleared, closing short {}", id);
                self.mark_closed(&id);
            }
        }
        Ok(())
    }
}
