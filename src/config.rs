use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::constants::{pipeline, trading};

/// Credentials and endpoints, read once at startup.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub exchange_base_url: String,
    pub feed_bearer_token: String,
    pub feed_base_url: String,
    pub llm_api_key: String,
    pub llm_base_url: Option<String>,
    pub llm_model: String,
    pub bind_addr: String,
    pub settings_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let exchange_api_key = var("BINANCE_API_KEY").unwrap_or_default();
        let exchange_api_secret = var("BINANCE_API_SECRET").unwrap_or_default();
        if exchange_api_key.is_empty() || exchange_api_secret.is_empty() {
            warn!("Binance API keys not found in environment variables");
        }

        let feed_bearer_token = var("FEED_BEARER_TOKEN").unwrap_or_default();
        if feed_bearer_token.is_empty() {
            warn!("Feed bearer token not found in environment variables");
        }

        let llm_api_key = var("LLM_API_KEY").unwrap_or_default();
        if llm_api_key.is_empty() {
            warn!("LLM API key not found in environment variables");
        }

        Self {
            exchange_api_key,
            exchange_api_secret,
            exchange_base_url: var("BINANCE_BASE_URL")
                .unwrap_or_else(|| "https://api.binance.com".to_string()),
            feed_bearer_token,
            feed_base_url: var("FEED_BASE_URL")
                .unwrap_or_else(|| "https://api.twitter.com".to_string()),
            llm_api_key,
            llm_base_url: var("LLM_BASE_URL"),
            llm_model: var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:7823".to_string()),
            settings_path: var("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json")),
            checkpoint_path: var("CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("last_signal.json")),
        }
    }
}

/// Operator-tunable runtime settings. Read fresh at every decision point,
/// never cached across one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TradingSettings {
    pub trading_enabled: bool,
    pub target_account: String,
    pub target_coin: String,
    pub leverage: u32,
    pub check_interval: u64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            trading_enabled: false,
            target_account: std::env::var("TARGET_FEED_ACCOUNT")
                .unwrap_or_else(|_| "whale_alert".to_string()),
            target_coin: std::env::var("DEFAULT_COIN").unwrap_or_else(|_| "BTC".to_string()),
            leverage: 1,
            check_interval: std::env::var("CHECK_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(pipeline::DEFAULT_CHECK_INTERVAL_SECS),
        }
    }
}

impl TradingSettings {
    /// Trading pair for the monitored coin, quoted in the primary quote asset.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.target_coin, trading::PRIMARY_QUOTE)
    }

    fn clamp(&mut self) {
        self.leverage = self.leverage.clamp(1, trading::MAX_LEVERAGE);
        self.check_interval = self.check_interval.max(1);
    }
}

/// Process-wide settings store backed by a JSON file.
///
/// Every update is merged field-by-field, clamped, and rewritten atomically
/// (tmp file + rename) so a crash mid-write never corrupts the record.
pub struct SettingsStore {
    path: PathBuf,
    inner: Mutex<TradingSettings>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Self::load(&path);
        let store = Self {
            path,
            inner: Mutex::new(settings),
        };
        // First run (or unreadable file): persist the effective record.
        store.save(&store.get());
        store
    }

    fn load(path: &Path) -> TradingSettings {
        let mut settings = TradingSettings::default();
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(stored) => {
                    if let Err(e) = merge_known_fields(&mut settings, &stored) {
                        warn!("⚙️ [SETTINGS] ignoring invalid stored settings: {}", e);
                    } else {
                        info!("⚙️ [SETTINGS] loaded from {}", path.display());
                    }
                }
                Err(e) => warn!("⚙️ [SETTINGS] unreadable {}: {}", path.display(), e),
            },
            Err(_) => {
                info!(
                    "⚙️ [SETTINGS] {} not found, using defaults",
                    path.display()
                );
            }
        }
        settings.clamp();
        settings
    }

    pub fn get(&self) -> TradingSettings {
        self.inner.lock().unwrap().clone()
    }

    /// Merge a partial update. Unknown keys are ignored; a type mismatch on
    /// a known key rejects the whole update.
    pub fn update(&self, partial: &Map<String, Value>) -> Result<TradingSettings, String> {
        let mut current = self.inner.lock().unwrap();
        let mut next = current.clone();
        merge_known_fields(&mut next, partial)?;
        next.clamp();
        *current = next.clone();
        drop(current);
        self.save(&next);
        info!("⚙️ [SETTINGS] updated: {:?}", partial);
        Ok(next)
    }

    fn save(&self, settings: &TradingSettings) {
        let tmp = self.path.with_extension("json.tmp");
        let body = match serde_json::to_string_pretty(settings) {
            Ok(body) => body,
            Err(e) => {
                warn!("⚙️ [SETTINGS] serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!("⚙️ [SETTINGS] persist to {} failed: {}", self.path.display(), e);
        }
    }
}

fn merge_known_fields(
    settings: &mut TradingSettings,
    partial: &Map<String, Value>,
) -> Result<(), String> {
    let mut merged = match serde_json::to_value(&*settings) {
        Ok(Value::Object(map)) => map,
        _ => return Err("settings record is not an object".to_string()),
    };
    for (key, value) in partial {
        if merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    *settings = serde_json::from_value(Value::Object(merged)).map_err(|e| e.to_string())?;
    Ok(())
}
