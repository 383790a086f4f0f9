use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "ChatlogSync";
const APP: &str = "ChatlogSync";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::with_dirs(
            dirs.config_dir().to_path_buf(),
            dirs.data_dir().to_path_buf(),
            dirs.cache_dir().to_path_buf(),
        )
    }

    /// Lays out `config/`, `data/` and `cache/` below a single root.
    pub fn with_root(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        Self::with_dirs(root.join("config"), root.join("data"), root.join("cache"))
    }

    fn with_dirs(
        config_dir: PathBuf,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&cache_dir)?;

        let config_path = config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
        }

        Ok(Self {
            config_path,
            data_dir,
            cache_dir,
        })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_path(&self, config: &AppConfig) -> PathBuf {
        self.data_dir.join(&config.cache.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefreshConfigPatch;

    fn scratch_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "chatlog-config-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        root
    }

    #[test]
    fn writes_defaults_on_first_use() {
        let root = scratch_root("defaults");
        let manager = ConfigManager::with_root(&root).expect("manager created");
        assert!(manager.config_path().exists());
        let config = manager.load().expect("config loaded");
        assert_eq!(config.refresh.max_concurrency, 3);
        assert_eq!(
            manager.cache_path(&config),
            root.join("data").join("chatlog-cache.sqlite3")
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn save_round_trips_through_disk() {
        let root = scratch_root("save");
        let manager = ConfigManager::with_root(&root).expect("manager created");
        let mut config = manager.load().expect("config loaded");
        config.refresh = config
            .refresh
            .apply(&RefreshConfigPatch {
                interval_secs: Some(60),
                ..Default::default()
            })
            .expect("patch valid");
        config.notifications.mute_list.push("noisy@chatroom".to_string());
        manager.save(&config).expect("config saved");

        let reloaded = manager.load().expect("config reloaded");
        assert_eq!(reloaded.refresh.interval_secs, 60);
        assert_eq!(reloaded.notifications.mute_list, vec!["noisy@chatroom"]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let root = scratch_root("invalid");
        let manager = ConfigManager::with_root(&root).expect("manager created");
        fs::write(
            manager.config_path(),
            "version = 1\n[refresh]\nenabled = true\ninterval_secs = 300\nmax_concurrency = 0\n\
             max_retries = 2\ntimeout_ms = 10000\nbatch_size = 10\npage_size = 200\n\
             incremental_max_days = 7\nfetch_limit_multiplier = 2\nretained_page_multiplier = 3\n\
             staleness_tolerance_ms = 1000\n",
        )
        .expect("config written");
        assert!(matches!(manager.load(), Err(ConfigError::Invalid { .. })));
        let _ = fs::remove_dir_all(&root);
    }
}
