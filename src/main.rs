use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hackshort::api::{run_server, AppState};
use hackshort::classifier::{IncidentClassifier, LlmClassifier};
use hackshort::config::{EnvConfig, SettingsStore};
use hackshort::exchange::binance::BinanceMargin;
use hackshort::exchange::traits::MarginApi;
use hackshort::executor::ShortOrderExecutor;
use hackshort::feed::{CheckpointStore, SignalSource, XFeedSource};
use hackshort::tracker::PositionTracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting hackshort...");

    let env = EnvConfig::from_env();

    let settings = Arc::new(SettingsStore::open(&env.settings_path));
    let checkpoint = Arc::new(CheckpointStore::open(&env.checkpoint_path));

    info!("Initializing exchange gateway...");
    let exchange: Arc<dyn MarginApi> = Arc::new(BinanceMargin::new(
        env.exchange_api_key.clone(),
        env.exchange_api_secret.clone(),
        env.exchange_base_url.clone(),
    ));

    info!("Initializing feed source...");
    let feed: Arc<dyn SignalSource> = Arc::new(XFeedSource::new(
        env.feed_bearer_token.clone(),
        env.feed_base_url.clone(),
    ));

    info!("Initializing classifier (model: {})...", env.llm_model);
    let classifier: Arc<dyn IncidentClassifier> = Arc::new(LlmClassifier::new(
        env.llm_api_key.clone(),
        env.llm_base_url.clone(),
        env.llm_model.clone(),
    ));

    let tracker = PositionTracker::new();

    // Adopt any venue-side debt left behind by a previous run before the
    // operator can act on stale state.
    let current = settings.get();
    if let Err(e) = tracker
        .reconcile(exchange.as_ref(), &current.target_coin, &current.symbol())
        .await
    {
        warn!("startup reconciliation failed: {}", e);
    }

    let executor = Arc::new(ShortOrderExecutor::new(exchange.clone(), tracker.clone()));

    let state = Arc::new(AppState {
        running: Arc::new(AtomicBool::new(false)),
        pipeline_handle: Mutex::new(None),
        exchange,
        feed,
        classifier,
        executor,
        settings,
        checkpoint,
        tracker,
    });

    info!("Initializing API server...");
    run_server(state, &env.bind_addr).await;

    Ok(())
}
