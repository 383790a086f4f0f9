use chatlog_api::HttpChatlogSource;
use chatlog_config::{AppConfig, ConfigManager};
use chatlog_notify::TracingSink;
use chatlog_storage::SqliteCacheStore;
use chatlog_sync::SyncService;
use anyhow::Context;
use std::sync::Arc;

/// Overrides the platform directories with a single root folder.
const HOME_ENV: &str = "CHATLOG_SYNC_HOME";

pub struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) sync: SyncService,
}

impl AppState {
    pub async fn initialize() -> anyhow::Result<Self> {
        let config_manager = match std::env::var_os(HOME_ENV) {
            Some(root) => ConfigManager::with_root(root),
            None => ConfigManager::new(),
        }
        .context("initialize config manager")?;
        let config = config_manager.load().context("load app config")?;
        let zone = config.civil_zone().context("resolve civil timezone")?;

        let cache_path = config_manager.cache_path(&config);
        let store = SqliteCacheStore::connect(&cache_path)
            .await
            .with_context(|| format!("open message cache at {}", cache_path.display()))?;

        let source = HttpChatlogSource::new(&config.api, zone).context("build archive client")?;
        let sync =
            SyncService::new(&config, Arc::new(source), Arc::new(store), Arc::new(TracingSink))
                .context("initialize sync service")?;

        tracing::info!(
            config = %config_manager.config_path().display(),
            cache = %cache_path.display(),
            archive = %config.api.base_url,
            "chatlog sync initialized"
        );
        Ok(Self { config, sync })
    }
}
