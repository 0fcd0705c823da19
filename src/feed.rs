//! Social-feed signal source and the last-seen checkpoint.
//!
//! One poll fetches the most recent post of the monitored account. Identity
//! is the post id: the pipeline only reacts when the id differs from the
//! checkpointed one.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::constants::http;
use crate::error::FeedError;

/// One fetched post.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub metrics: Value,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Most recent post from the monitored account. Read-only.
    async fn fetch_latest(&self, account: &str) -> Result<Signal, FeedError>;

    /// Connection self-test for the control surface.
    async fn probe(&self) -> Result<(), FeedError>;
}

/// X (Twitter) API v2 source: resolve the username to a user id, then take
/// the newest entry of the user timeline.
pub struct XFeedSource {
    client: Client,
    base_url: String,
    bearer_token: String,
}

impl XFeedSource {
    pub fn new(bearer_token: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(http::REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client build failed");
        Self {
            client,
            base_url,
            bearer_token,
        }
    }

    async fn get(&self, path: &str) -> Result<Value, FeedError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        match status {
            s if s.is_success() => {
                serde_json::from_str(&body).map_err(|e| FeedError::Malformed(e.to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(FeedError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FeedError::Unauthenticated {
                reason: format!("HTTP {}: {}", status, body),
            }),
            _ => Err(FeedError::Malformed(format!("HTTP {}: {}", status, body))),
        }
    }

    async fn resolve_user_id(&self, account: &str) -> Result<String, FeedError> {
        let reply = self
            .get(&format!("/2/users/by/username/{}", account))
            .await?;
        reply
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(id_as_string)
            .ok_or_else(|| FeedError::NotFound {
                account: account.to_string(),
            })
    }
}

#[async_trait]
impl SignalSource for XFeedSource {
    async fn fetch_latest(&self, account: &str) -> Result<Signal, FeedError> {
        let user_id = self.resolve_user_id(account).await?;

        let reply = self
            .get(&format!(
                "/2/users/{}/tweets?max_results=10&tweet.fields=created_at,public_metrics",
                user_id
            ))
            .await?;

        let latest = reply
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|posts| posts.first())
            .ok_or_else(|| FeedError::NotFound {
                account: account.to_string(),
            })?;

        let id = latest
            .get("id")
            .and_then(id_as_string)
            .ok_or_else(|| FeedError::Malformed("post without id".to_string()))?;
        let text = latest
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        let signal = Signal {
            id,
            text,
            created_at: latest
                .get("created_at")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metrics: latest
                .get("public_metrics")
                .cloned()
                .unwrap_or(Value::Null),
        };

        info!(
            "🐦 [FEED] fetched post {} from {}: {}",
            signal.id,
            account,
            truncate(&signal.text, 50)
        );
        Ok(signal)
    }

    async fn probe(&self) -> Result<(), FeedError> {
        // Any resolvable account proves the token works.
        self.resolve_user_id("X").await.map(|_| ())
    }
}

fn id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Last-seen-signal checkpoint, persisted so a restart does not reprocess
/// (and potentially re-trade) the post it already reacted to.
pub struct CheckpointStore {
    path: PathBuf,
    inner: Mutex<Option<Signal>>,
}

impl CheckpointStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Signal>(&content) {
                Ok(signal) => {
                    info!(
                        "📌 [CHECKPOINT] resuming after signal {}: {}",
                        signal.id,
                        truncate(&signal.text, 50)
                    );
                    Some(signal)
                }
                Err(e) => {
                    warn!("📌 [CHECKPOINT] unreadable {}: {}", path.display(), e);
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path,
            inner: Mutex::new(last),
        }
    }

    pub fn last(&self) -> Option<Signal> {
        self.inner.lock().unwrap().clone()
    }

    /// Whether this signal has not been reacted to yet.
    pub fn is_new(&self, signal: &Signal) -> bool {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |last| last.id != signal.id)
    }

    /// Record the signal as reacted-to, regardless of the trading outcome.
    pub fn advance(&self, signal: &Signal) {
        *self.inner.lock().unwrap() = Some(signal.clone());
        let tmp = self.path.with_extension("json.tmp");
        let body = match serde_json::to_string_pretty(signal) {
            Ok(body) => body,
            Err(e) => {
                warn!("📌 [CHECKPOINT] serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!(
                "📌 [CHECKPOINT] persist to {} failed: {}",
                self.path.display(),
                e
            );
        }
    }
}
