mod state;

use state::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state = Arc::new(AppState::initialize().await?);

    tokio::spawn(log_cache_updates(state.clone()));
    tokio::select! {
        _ = background_refresh_loop(state.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutdown requested");
        }
    }

    let cleared = state.sync.scheduler().clear_tasks();
    let report = state.sync.report();
    tracing::info!(
        cleared,
        succeeded = report.stats.success_count,
        failed = report.stats.failed_count,
        retried = report.stats.retried_count,
        average_ms = report.stats.average_time_ms,
        "chatlog sync stopped"
    );
    Ok(())
}

async fn background_refresh_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.refresh.interval_secs.max(1));

    loop {
        match state.sync.auto_refresh_tick().await {
            Ok(summary) if summary.requested > 0 => {
                tracing::info!(
                    requested = summary.requested,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "background refresh cycle completed"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::error!("background refresh failed: {err}"),
        }

        sleep(interval).await;
    }
}

async fn log_cache_updates(state: Arc<AppState>) {
    let mut updates = state.sync.subscribe();
    loop {
        match updates.recv().await {
            Ok(update) => tracing::debug!(
                conversation = %update.conversation_id,
                entries = update.entries.len(),
                "cache updated"
            ),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "cache update listener lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
