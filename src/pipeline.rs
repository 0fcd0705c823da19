//! The alert pipeline: poll the feed, deduplicate, classify, trade.
//!
//! Single-flow loop: the next iteration never starts before the previous
//! one finishes, and the interval sleep is measured after the iteration
//! completes. Nothing raised inside an iteration may terminate the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::classifier::IncidentClassifier;
use crate::config::SettingsStore;
use crate::constants::pipeline as tuning;
use crate::error::FeedError;
use crate::executor::{ShortOrderExecutor, ShortReport, ShortRequest};
use crate::feed::{truncate, CheckpointStore, SignalSource};

/// What one iteration did. Returned by [`AlertPipeline::run_once`] so tests
/// and the loop can observe decisions without scraping logs.
#[derive(Debug, Default)]
pub struct IterationReport {
    pub signal_id: Option<String>,
    pub is_new: bool,
    pub is_incident: Option<bool>,
    pub trade: Option<ShortReport>,
    /// Iteration failed; the loop backs off longer before the next poll.
    pub had_error: bool,
    /// Unrecoverable until reconfigured (bad credentials); stop the loop.
    pub fatal: bool,
}

pub struct AlertPipeline {
    feed: Arc<dyn SignalSource>,
    classifier: Arc<dyn IncidentClassifier>,
    executor: Arc<ShortOrderExecutor>,
    settings: Arc<SettingsStore>,
    checkpoint: Arc<CheckpointStore>,
    running: Arc<AtomicBool>,
}

impl AlertPipeline {
    pub fn new(
        feed: Arc<dyn SignalSource>,
        classifier: Arc<dyn IncidentClassifier>,
        executor: Arc<ShortOrderExecutor>,
        settings: Arc<SettingsStore>,
        checkpoint: Arc<CheckpointStore>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            feed,
            classifier,
            executor,
            settings,
            checkpoint,
            running,
        }
    }

    /// Spawn the polling loop. Clearing the running flag stops the loop
    /// before the *next* iteration; an in-flight iteration (including an
    /// executor sequence) always runs to completion.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            info!("🔁 [PIPELINE] started");
            while pipeline.running.load(Ordering::SeqCst) {
                let report = pipeline.run_once().await;

                if report.fatal {
                    error!("🔁 [PIPELINE] stopping on unrecoverable error");
                    pipeline.running.store(false, Ordering::SeqCst);
                    break;
                }

                let delay = if report.had_error {
                    tuning::ERROR_BACKOFF
                } else {
                    Duration::from_secs(pipeline.settings.get().check_interval.max(1))
                };
                sleep(delay).await;
            }
            info!("🔁 [PIPELINE] stopped");
        })
    }

    /// One iteration. Settings are re-read here so changes apply without a
    /// restart; the checkpoint advances for every new signal whether or not
    /// trading succeeded, so a failed trade never re-triggers on the same
    /// post.
    pub async fn run_once(&self) -> IterationReport {
        let mut report = IterationReport::default();
        let settings = self.settings.get();

        let signal = match self.feed.fetch_latest(&settings.target_account).await {
            Ok(signal) => signal,
            Err(FeedError::RateLimited) => {
                warn!("🔁 [PIPELINE] feed rate limited, waiting for next tick");
                return report;
            }
            Err(FeedError::NotFound { account }) => {
                warn!("🔁 [PIPELINE] no posts found for {}", account);
                return report;
            }
            Err(e @ FeedError::Unauthenticated { .. }) => {
                error!("🔁 [PIPELINE] {}", e);
                report.fatal = true;
                return report;
            }
            Err(e) => {
                warn!("🔁 [PIPELINE] feed error: {}", e);
                report.had_error = true;
                return report;
            }
        };

        report.signal_id = Some(signal.id.clone());
        if !self.checkpoint.is_new(&signal) {
            return report;
        }
        report.is_new = true;
        info!(
            "🔁 [PIPELINE] new signal {}: {}",
            signal.id,
            truncate(&signal.text, 80)
        );

        let is_incident = self.classifier.classify(&signal.text).await;
        report.is_incident = Some(is_incident);

        if is_incident {
            warn!(
                "🚨 [PIPELINE] incident detected in signal {}: {}",
                signal.id,
                truncate(&signal.text, 80)
            );
            if settings.trading_enabled {
                let request = ShortRequest::from_settings(&settings);
                let trade = self.executor.open_short(&request).await;
                if trade.success {
                    info!(
                        "✅ [PIPELINE] short placed on {} ({:?})",
                        request.symbol, trade.order_id
                    );
                } else {
                    error!(
                        "❌ [PIPELINE] short on {} failed: {}",
                        request.symbol, trade.message
                    );
                }
                report.trade = Some(trade);
            } else {
                info!("🔁 [PIPELINE] trading disabled in settings, no order placed");
            }
        } else {
            info!("🔁 [PIPELINE] signal {} is not an incident", signal.id);
        }

        self.checkpoint.advance(&signal);
        report
    }
}
