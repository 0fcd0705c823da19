//! Binance cross-margin adapter (signed REST).
//!
//! Request flow: build the query string, append a millisecond timestamp,
//! sign with HMAC-SHA256 using the API secret, send with the `X-MBX-APIKEY`
//! header. Market orders carry `sideEffectType=NO_SIDE_EFFECT` so the venue
//! never borrows on our behalf.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::info;

use crate::constants::{http, trading};
use crate::error::ExchangeError;

use super::traits::MarginApi;
use super::types::{AssetBalance, BorrowResult, OrderResult, RepayResult, SymbolRules};

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct VenueErrorBody {
    code: i64,
    msg: String,
}

#[derive(Clone)]
pub struct BinanceMargin {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceMargin {
    pub fn new(api_key: String, api_secret: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(http::REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client build failed");
        Self {
            client,
            base_url,
            api_key,
            api_secret,
        }
    }

    /// Sign a query string with HMAC-SHA256.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC key error");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn public(&self, path: &str, params: &str) -> Result<Value, ExchangeError> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, params)
        };
        let resp = self.client.get(&url).send().await?;
        Self::decode(resp).await
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<Value, ExchangeError> {
        let ts = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("timestamp={}", ts)
        } else {
            format!("{}&timestamp={}", params, ts)
        };
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );
        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(ExchangeError::Decode);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExchangeError::Unauthenticated { reason: body });
        }
        if status.is_server_error() {
            return Err(ExchangeError::VenueUnavailable {
                reason: format!("HTTP {}: {}", status, body),
            });
        }
        match serde_json::from_str::<VenueErrorBody>(&body) {
            Ok(venue) => Err(ExchangeError::VenueRejected {
                code: venue.code,
                msg: venue.msg,
            }),
            Err(_) => Err(ExchangeError::VenueRejected {
                code: i64::from(status.as_u16()),
                msg: body,
            }),
        }
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&sideEffectType=NO_SIDE_EFFECT",
            symbol,
            side,
            format_qty(qty)
        );
        let raw = self
            .signed(Method::POST, "/sapi/v1/margin/order", &params)
            .await?;

        let order_id = raw
            .get("orderId")
            .and_then(id_as_string)
            .unwrap_or_else(|| "unknown".to_string());
        let executed_qty = f64_field(&raw, "executedQty");
        let quote_qty = f64_field(&raw, "cummulativeQuoteQty");
        let avg_price = if executed_qty > 0.0 {
            quote_qty / executed_qty
        } else {
            0.0
        };

        info!(
            "🏦 [VENUE] {} {} {} filled {} @ ~{} (order {})",
            side, symbol, qty, executed_qty, avg_price, order_id
        );
        Ok(OrderResult {
            order_id,
            executed_qty,
            avg_price,
        })
    }
}

#[async_trait]
impl MarginApi for BinanceMargin {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        let status = self.public("/sapi/v1/system/status", "").await?;
        if status.get("status").and_then(|s| s.as_i64()) != Some(0) {
            return Err(ExchangeError::VenueUnavailable {
                reason: format!("system status: {}", status),
            });
        }
        // Credentials check: the margin account must be readable.
        self.signed(Method::GET, "/sapi/v1/margin/account", "")
            .await
            .map(|_| ())
    }

    async fn margin_balance(&self, asset: &str) -> Result<AssetBalance, ExchangeError> {
        let account = self
            .signed(Method::GET, "/sapi/v1/margin/account", "")
            .await?;
        let entry = account
            .get("userAssets")
            .and_then(|a| a.as_array())
            .and_then(|assets| {
                assets
                    .iter()
                    .find(|a| a.get("asset").and_then(|s| s.as_str()) == Some(asset))
            });
        Ok(match entry {
            Some(entry) => AssetBalance {
                free: f64_field(entry, "free"),
                locked: f64_field(entry, "locked"),
                borrowed: f64_field(entry, "borrowed"),
            },
            None => AssetBalance::default(),
        })
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let info = self
            .public("/api/v3/exchangeInfo", &format!("symbol={}", symbol))
            .await
            .map_err(|e| match e {
                // Binance answers an unknown symbol with a 400 error body.
                ExchangeError::VenueRejected { .. } => ExchangeError::SymbolNotFound {
                    symbol: symbol.to_string(),
                },
                other => other,
            })?;

        let entry = info
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|symbols| symbols.first())
            .ok_or_else(|| ExchangeError::SymbolNotFound {
                symbol: symbol.to_string(),
            })?;

        let filters = entry
            .get("filters")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();
        let filter = |kind: &str| -> Option<Value> {
            filters
                .iter()
                .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(kind))
                .cloned()
        };

        let lot = filter("LOT_SIZE");
        let notional = filter("NOTIONAL").or_else(|| filter("MIN_NOTIONAL"));

        Ok(SymbolRules {
            min_qty: lot.as_ref().map_or(0.0, |f| f64_field(f, "minQty")),
            step_size: lot.as_ref().map_or(0.0, |f| f64_field(f, "stepSize")),
            min_notional: notional
                .as_ref()
                .map(|f| f64_field(f, "minNotional"))
                .filter(|v| *v > 0.0)
                .unwrap_or(trading::FALLBACK_MIN_NOTIONAL),
            margin_allowed: entry
                .get("isMarginTradingAllowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    async fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker = self
            .public("/api/v3/ticker/price", &format!("symbol={}", symbol))
            .await?;
        let price = f64_field(&ticker, "price");
        if price <= 0.0 {
            return Err(ExchangeError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        }
        Ok(price)
    }

    async fn max_borrowable(&self, asset: &str) -> Result<f64, ExchangeError> {
        let reply = self
            .signed(
                Method::GET,
                "/sapi/v1/margin/maxBorrowable",
                &format!("asset={}", asset),
            )
            .await?;
        Ok(f64_field(&reply, "amount"))
    }

    async fn borrow(&self, asset: &str, amount: f64) -> Result<BorrowResult, ExchangeError> {
        let reply = self
            .signed(
                Method::POST,
                "/sapi/v1/margin/loan",
                &format!("asset={}&amount={}", asset, format_qty(amount)),
            )
            .await?;
        let tran_id = reply
            .get("tranId")
            .and_then(id_as_string)
            .unwrap_or_else(|| "unknown".to_string());
        info!("🏦 [VENUE] borrowed {} {} (tran {})", amount, asset, tran_id);
        Ok(BorrowResult { tran_id })
    }

    async fn repay(&self, asset: &str, amount: f64) -> Result<RepayResult, ExchangeError> {
        let reply = self
            .signed(
                Method::POST,
                "/sapi/v1/margin/repay",
                &format!("asset={}&amount={}", asset, format_qty(amount)),
            )
            .await?;
        let tran_id = reply
            .get("tranId")
            .and_then(id_as_string)
            .unwrap_or_else(|| "unknown".to_string());
        info!("🏦 [VENUE] repaid {} {} (tran {})", amount, asset, tran_id);
        Ok(RepayResult { tran_id })
    }

    async fn sell_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
        self.market_order(symbol, "SELL", qty).await
    }

    async fn buy_market(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
        self.market_order(symbol, "BUY", qty).await
    }
}

fn id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Binance reports numeric fields as strings ("0.00023"); accept both.
fn f64_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Plain decimal formatting; scientific notation is rejected by the venue.
pub fn format_qty(qty: f64) -> String {
    let s = format!("{:.8}", qty);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}
