use crate::ConfigError;
use chatlog_core::time::DEFAULT_CIVIL_ZONE;
use chatlog_core::CivilZone;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl AppConfig {
    pub fn civil_zone(&self) -> Result<CivilZone, ConfigError> {
        CivilZone::parse(&self.timezone).map_err(|err| ConfigError::Invalid {
            field: "timezone",
            reason: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.civil_zone()?;
        self.api.base_url()?;
        self.refresh.validate()?;
        self.history.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            timezone: default_timezone(),
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            refresh: RefreshConfig::default(),
            history: HistoryConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

fn default_timezone() -> String {
    DEFAULT_CIVIL_ZONE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Transport-level retries for connection errors, timeouts and 5xx.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl ApiConfig {
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|err| ConfigError::Invalid {
            field: "api.base_url",
            reason: err.to_string(),
        })
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5030".to_string(),
            request_timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub file_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_name: "chatlog-cache.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_concurrency: usize,
    pub max_retries: u32,
    /// Per-attempt limit; every retry gets a fresh one.
    pub timeout_ms: u64,
    pub batch_size: usize,
    pub page_size: usize,
    /// Background refresh never reaches further back than this.
    pub incremental_max_days: i64,
    pub fetch_limit_multiplier: usize,
    pub retained_page_multiplier: usize,
    pub staleness_tolerance_ms: i64,
}

impl RefreshConfig {
    pub fn fetch_limit(&self) -> usize {
        self.page_size * self.fetch_limit_multiplier.max(1)
    }

    pub fn max_retained(&self) -> usize {
        self.page_size * self.retained_page_multiplier.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(invalid("refresh.max_concurrency", "must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(invalid("refresh.page_size", "must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("refresh.timeout_ms", "must be positive"));
        }
        if self.incremental_max_days <= 0 {
            return Err(invalid("refresh.incremental_max_days", "must be positive"));
        }
        if self.staleness_tolerance_ms < 0 {
            return Err(invalid("refresh.staleness_tolerance_ms", "must not be negative"));
        }
        Ok(())
    }

    /// Returns a new config with every `Some` field of `patch` applied.
    pub fn apply(&self, patch: &RefreshConfigPatch) -> Result<RefreshConfig, ConfigError> {
        let mut next = self.clone();
        if let Some(value) = patch.enabled {
            next.enabled = value;
        }
        if let Some(value) = patch.interval_secs {
            next.interval_secs = value;
        }
        if let Some(value) = patch.max_concurrency {
            next.max_concurrency = value;
        }
        if let Some(value) = patch.max_retries {
            next.max_retries = value;
        }
        if let Some(value) = patch.timeout_ms {
            next.timeout_ms = value;
        }
        if let Some(value) = patch.batch_size {
            next.batch_size = value;
        }
        if let Some(value) = patch.page_size {
            next.page_size = value;
        }
        if let Some(value) = patch.incremental_max_days {
            next.incremental_max_days = value;
        }
        if let Some(value) = patch.staleness_tolerance_ms {
            next.staleness_tolerance_ms = value;
        }
        next.validate()?;
        Ok(next)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_concurrency: 3,
            max_retries: 2,
            timeout_ms: 10_000,
            batch_size: 10,
            page_size: 200,
            incremental_max_days: 7,
            fetch_limit_multiplier: 2,
            retained_page_multiplier: 3,
            staleness_tolerance_ms: 1000,
        }
    }
}

/// Partial update for [`RefreshConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshConfigPatch {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub page_size: Option<usize>,
    pub incremental_max_days: Option<i64>,
    pub staleness_tolerance_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub page_size: usize,
    pub default_density_per_day: f64,
    pub min_window_days: f64,
    pub max_window_days: f64,
    pub max_attempts: u32,
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(invalid("history.page_size", "must be at least 1"));
        }
        if !(self.default_density_per_day > 0.0) {
            return Err(invalid("history.default_density_per_day", "must be positive"));
        }
        if !(self.min_window_days > 0.0) || self.min_window_days > self.max_window_days {
            return Err(invalid(
                "history.min_window_days",
                "must be positive and not above max_window_days",
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("history.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            default_density_per_day: 25.0,
            min_window_days: 0.5,
            max_window_days: 90.0,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub enable_mention: bool,
    pub enable_quote: bool,
    pub enable_message: bool,
    pub mute_list: Vec<String>,
    /// Local user's archive id, needed to recognise mentions and quotes.
    pub my_id: Option<String>,
    pub my_display_names: Vec<String>,
    pub show_message_content: bool,
    pub max_tracked_ids: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_mention: true,
            enable_quote: true,
            enable_message: false,
            mute_list: Vec::new(),
            my_id: None,
            my_display_names: Vec::new(),
            show_message_content: true,
            max_tracked_ids: 1000,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn patch_applies_only_given_fields() {
        let base = RefreshConfig::default();
        let next = base
            .apply(&RefreshConfigPatch {
                max_concurrency: Some(5),
                enabled: Some(false),
                ..Default::default()
            })
            .expect("patch valid");
        assert_eq!(next.max_concurrency, 5);
        assert!(!next.enabled);
        assert_eq!(next.page_size, base.page_size);
        assert_eq!(next.incremental_max_days, 7);
    }

    #[test]
    fn patch_rejects_zero_concurrency() {
        let err = RefreshConfig::default()
            .apply(&RefreshConfigPatch {
                max_concurrency: Some(0),
                ..Default::default()
            })
            .expect_err("zero concurrency rejected");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "refresh.max_concurrency",
                ..
            }
        ));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            version = 1

            [api]
            base_url = "http://archive.local:5030"
            request_timeout_secs = 10
            retry_count = 0
            retry_delay_ms = 0
            "#,
        )
        .expect("config parsed");
        assert_eq!(parsed.api.base_url, "http://archive.local:5030");
        assert_eq!(parsed.refresh, RefreshConfig::default());
        assert_eq!(parsed.timezone, "Asia/Shanghai");
        parsed.validate().expect("parsed config valid");
    }

    #[test]
    fn unknown_timezone_is_invalid() {
        let config = AppConfig {
            timezone: "Mars/Olympus".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retention_limits_scale_with_page_size() {
        let config = RefreshConfig::default();
        assert_eq!(config.fetch_limit(), 400);
        assert_eq!(config.max_retained(), 600);
    }
}
