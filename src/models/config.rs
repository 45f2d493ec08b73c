// src/models/config.rs

//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::ContentThreshold;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream archive serving WARC text
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Search engine receiving the records
    #[serde(default)]
    pub search: SearchConfig,

    /// Rule feed and nightly reconciliation
    #[serde(default)]
    pub restrictions: RestrictionsConfig,

    /// Worker pools and record building
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry, backoff and pause intervals
    #[serde(default)]
    pub retry: RetryConfig,

    /// Range-driven full reindex
    #[serde(default)]
    pub full: FullConfig,

    /// Token-driven periodic indexing of new WARCs
    #[serde(default)]
    pub periodic: PeriodicConfig,

    /// Checkpoint and rule state location
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        validate_base_url("archive.base_url", &self.archive.base_url)?;
        validate_base_url("search.base_url", &self.search.base_url)?;
        url::Url::parse(&self.restrictions.rules_url).map_err(|e| {
            AppError::validation(format!("restrictions.rules_url is not a URL: {e}"))
        })?;

        if self.archive.user_agent.trim().is_empty() {
            return Err(AppError::validation("archive.user_agent is empty"));
        }
        if self.archive.timeout_secs == 0 || self.search.timeout_secs == 0 {
            return Err(AppError::validation("timeouts must be > 0"));
        }
        if self.search.page_size == 0 {
            return Err(AppError::validation("search.page_size must be > 0"));
        }
        if self.restrictions.schedule_hour > 23 || self.restrictions.schedule_minute > 59 {
            return Err(AppError::validation(
                "restrictions schedule is not a valid time of day",
            ));
        }
        if self.restrictions.recheck_workers == 0 {
            return Err(AppError::validation(
                "restrictions.recheck_workers must be > 0",
            ));
        }

        let p = &self.pipeline;
        if p.filter_workers == 0 || p.transform_workers == 0 || p.index_workers == 0 {
            return Err(AppError::validation("pipeline worker counts must be > 0"));
        }
        if p.poll_interval_ms == 0 {
            return Err(AppError::validation("pipeline.poll_interval_ms must be > 0"));
        }
        if p.async_writes && p.max_pending_writes == 0 {
            return Err(AppError::validation(
                "pipeline.max_pending_writes must be > 0 with async writes",
            ));
        }
        if p.text_limit == 0 {
            return Err(AppError::validation("pipeline.text_limit must be > 0"));
        }

        if self.retry.max_retries == 0 {
            return Err(AppError::validation("retry.max_retries must be > 0"));
        }

        self.full.coordinator.validate("full")?;
        self.periodic.coordinator.validate("periodic")?;

        match (self.full.modulo_divisor, self.full.modulo_remainder) {
            (None, None) => {}
            (Some(divisor), Some(remainder)) => {
                if divisor < 2 {
                    return Err(AppError::validation("full.modulo_divisor must be >= 2"));
                }
                if remainder >= divisor {
                    return Err(AppError::validation(
                        "full.modulo_remainder must be below full.modulo_divisor",
                    ));
                }
            }
            _ => {
                return Err(AppError::validation(
                    "full.modulo_divisor and full.modulo_remainder go together",
                ));
            }
        }

        if let Some(window) = &self.periodic.window {
            window.validate()?;
        }
        Ok(())
    }
}

fn validate_base_url(field: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::validation(format!("{field} is not a URL: {e}")))?;
    if !parsed.path().ends_with('/') {
        return Err(AppError::validation(format!(
            "{field} must end with '/': {value}"
        )));
    }
    Ok(())
}

/// Archive endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL, ending in '/'
    #[serde(default = "defaults::archive_url")]
    pub base_url: String,

    /// Collection whose WARCs are indexed
    #[serde(default = "defaults::collection_id")]
    pub collection_id: u64,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::archive_timeout")]
    pub timeout_secs: u64,

    /// Collection holding curated (pandora) content
    #[serde(default = "defaults::pandora_collection_id")]
    pub pandora_collection_id: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::archive_url(),
            collection_id: defaults::collection_id(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::archive_timeout(),
            pandora_collection_id: defaults::pandora_collection_id(),
        }
    }
}

/// Search engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Collection URL, ending in '/'
    #[serde(default = "defaults::search_url")]
    pub base_url: String,

    #[serde(default = "defaults::search_timeout")]
    pub timeout_secs: u64,

    /// Rows per cursor page
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,

    #[serde(default = "defaults::commit_within")]
    pub commit_within_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::search_url(),
            timeout_secs: defaults::search_timeout(),
            page_size: defaults::page_size(),
            commit_within_ms: defaults::commit_within(),
        }
    }
}

/// Rule feed and reconciliation schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionsConfig {
    #[serde(default = "defaults::rules_url")]
    pub rules_url: String,

    /// Local hour of the daily reconciliation run
    #[serde(default = "defaults::schedule_hour")]
    pub schedule_hour: u32,

    #[serde(default)]
    pub schedule_minute: u32,

    /// Concurrent re-evaluations per query page
    #[serde(default = "defaults::recheck_workers")]
    pub recheck_workers: usize,
}

impl Default for RestrictionsConfig {
    fn default() -> Self {
        Self {
            rules_url: defaults::rules_url(),
            schedule_hour: defaults::schedule_hour(),
            schedule_minute: 0,
            recheck_workers: defaults::recheck_workers(),
        }
    }
}

/// Stage worker pools and record building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "defaults::filter_workers")]
    pub filter_workers: usize,

    #[serde(default = "defaults::transform_workers")]
    pub transform_workers: usize,

    #[serde(default = "defaults::index_workers")]
    pub index_workers: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_ms: u64,

    /// Spawn index writes instead of awaiting them in the worker
    #[serde(default = "defaults::enabled")]
    pub async_writes: bool,

    #[serde(default = "defaults::max_pending_writes")]
    pub max_pending_writes: usize,

    /// Characters kept at DOCUMENT_START_ONLY
    #[serde(default = "defaults::text_limit")]
    pub text_limit: usize,

    /// Distinct terms kept at UNIQUE_TERMS_ONLY
    #[serde(default = "defaults::unique_terms_limit")]
    pub unique_terms_limit: usize,

    /// Store body text at all
    #[serde(default = "defaults::enabled")]
    pub index_full_text: bool,

    /// Site suffixes indexed in full
    #[serde(default = "defaults::full_text_suffixes")]
    pub full_text_suffixes: Vec<String>,

    /// Threshold for searchable content outside those sites
    #[serde(default = "defaults::partial_threshold")]
    pub partial_threshold: ContentThreshold,
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter_workers: defaults::filter_workers(),
            transform_workers: defaults::transform_workers(),
            index_workers: defaults::index_workers(),
            poll_interval_ms: defaults::poll_interval(),
            async_writes: true,
            max_pending_writes: defaults::max_pending_writes(),
            text_limit: defaults::text_limit(),
            unique_terms_limit: defaults::unique_terms_limit(),
            index_full_text: true,
            full_text_suffixes: defaults::full_text_suffixes(),
            partial_threshold: defaults::partial_threshold(),
        }
    }
}

/// Retry and pause intervals shared by both coordinators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts before a WARC is quarantined
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Delay before a failed WARC is retried
    #[serde(default = "defaults::backoff")]
    pub backoff_secs: u64,

    /// Delay before a failed listing call is repeated once
    #[serde(default = "defaults::upstream_retry")]
    pub upstream_retry_secs: u64,

    /// Pause after a transient acquisition failure
    #[serde(default = "defaults::io_pause")]
    pub io_pause_secs: u64,

    /// Pause after any other acquisition failure
    #[serde(default = "defaults::fatal_pause")]
    pub fatal_pause_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            backoff_secs: defaults::backoff(),
            upstream_retry_secs: defaults::upstream_retry(),
            io_pause_secs: defaults::io_pause(),
            fatal_pause_secs: defaults::fatal_pause(),
        }
    }
}

/// Settings common to both coordinator modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// WARCs requested per listing call
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    #[serde(default = "defaults::read_workers")]
    pub read_workers: usize,

    /// Tracked plus pending WARCs before acquisition waits
    #[serde(default = "defaults::queue_limit")]
    pub queue_limit: usize,

    #[serde(default = "defaults::tick")]
    pub tick_ms: u64,

    /// Age after which an unfinished batch counts as stale
    #[serde(default = "defaults::stale_after")]
    pub stale_after_secs: u64,

    /// Minimum gap between stale warnings for one batch
    #[serde(default = "defaults::stale_warning")]
    pub stale_warning_secs: u64,

    /// Sleep after an empty listing
    #[serde(default = "defaults::idle_poll")]
    pub idle_poll_secs: u64,
}

impl CoordinatorConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AppError::validation(format!(
                "{section}.batch_size must be > 0"
            )));
        }
        if self.read_workers == 0 {
            return Err(AppError::validation(format!(
                "{section}.read_workers must be > 0"
            )));
        }
        if self.queue_limit == 0 {
            return Err(AppError::validation(format!(
                "{section}.queue_limit must be > 0"
            )));
        }
        if self.tick_ms == 0 {
            return Err(AppError::validation(format!("{section}.tick_ms must be > 0")));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: defaults::batch_size(),
            read_workers: defaults::read_workers(),
            queue_limit: defaults::queue_limit(),
            tick_ms: defaults::tick(),
            stale_after_secs: defaults::stale_after(),
            stale_warning_secs: defaults::stale_warning(),
            idle_poll_secs: defaults::idle_poll(),
        }
    }
}

/// Full reindex, walking WARC ids in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullConfig {
    #[serde(flatten)]
    pub coordinator: CoordinatorConfig,

    /// Split the id space across several indexers
    #[serde(default)]
    pub modulo_divisor: Option<u64>,

    #[serde(default)]
    pub modulo_remainder: Option<u64>,
}

/// Periodic indexing driven by the sync resumption token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(flatten)]
    pub coordinator: CoordinatorConfig,

    /// Daily run window, always running when absent
    #[serde(default)]
    pub window: Option<WindowConfig>,

    #[serde(default = "defaults::window_recheck")]
    pub window_recheck_secs: u64,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            window: None,
            window_recheck_secs: defaults::window_recheck(),
        }
    }
}

/// Local start and stop time of a daily window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub start_hour: u32,
    #[serde(default)]
    pub start_minute: u32,
    pub stop_hour: u32,
    #[serde(default)]
    pub stop_minute: u32,
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.start_hour > 23
            || self.stop_hour > 23
            || self.start_minute > 59
            || self.stop_minute > 59
        {
            return Err(AppError::validation(
                "periodic.window is not a valid time of day",
            ));
        }
        if (self.start_hour, self.start_minute) == (self.stop_hour, self.stop_minute) {
            return Err(AppError::validation(
                "periodic.window start and stop are equal",
            ));
        }
        Ok(())
    }
}

/// Where checkpoints and rule state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: defaults::storage_dir(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    use crate::models::ContentThreshold;

    // Upstream defaults
    pub fn archive_url() -> String {
        "http://localhost:8080/bamboo/".into()
    }
    pub fn collection_id() -> u64 {
        1
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; warc-indexer/0.1)".into()
    }
    pub fn archive_timeout() -> u64 {
        300
    }
    pub fn pandora_collection_id() -> u64 {
        4
    }
    pub fn search_url() -> String {
        "http://localhost:8983/solr/webarchive/".into()
    }
    pub fn search_timeout() -> u64 {
        60
    }
    pub fn page_size() -> usize {
        1000
    }
    pub fn commit_within() -> u64 {
        60_000
    }
    pub fn rules_url() -> String {
        "http://localhost:8080/bamboo/access/rules".into()
    }
    pub fn schedule_hour() -> u32 {
        2
    }
    pub fn recheck_workers() -> usize {
        5
    }

    // Pipeline defaults
    pub fn enabled() -> bool {
        true
    }
    pub fn filter_workers() -> usize {
        2
    }
    pub fn transform_workers() -> usize {
        4
    }
    pub fn index_workers() -> usize {
        2
    }
    pub fn poll_interval() -> u64 {
        100
    }
    pub fn max_pending_writes() -> usize {
        20
    }
    pub fn text_limit() -> usize {
        3000
    }
    pub fn unique_terms_limit() -> usize {
        500
    }
    pub fn full_text_suffixes() -> Vec<String> {
        vec![".gov.au".into()]
    }
    pub fn partial_threshold() -> ContentThreshold {
        ContentThreshold::DocumentStartOnly
    }

    // Retry defaults
    pub fn max_retries() -> u32 {
        5
    }
    pub fn backoff() -> u64 {
        900
    }
    pub fn upstream_retry() -> u64 {
        10
    }
    pub fn io_pause() -> u64 {
        300
    }
    pub fn fatal_pause() -> u64 {
        3600
    }

    // Coordinator defaults
    pub fn batch_size() -> usize {
        100
    }
    pub fn read_workers() -> usize {
        1
    }
    pub fn queue_limit() -> usize {
        5
    }
    pub fn tick() -> u64 {
        1000
    }
    pub fn stale_after() -> u64 {
        600
    }
    pub fn stale_warning() -> u64 {
        300
    }
    pub fn idle_poll() -> u64 {
        60
    }
    pub fn window_recheck() -> u64 {
        60
    }

    pub fn storage_dir() -> PathBuf {
        PathBuf::from("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [archive]
            base_url = "http://archive.example/"
            collection_id = 7

            [full]
            enabled = true
            batch_size = 10
            modulo_divisor = 4
            modulo_remainder = 1

            [periodic.window]
            start_hour = 22
            stop_hour = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.archive.collection_id, 7);
        assert_eq!(config.archive.pandora_collection_id, 4);
        assert!(config.full.coordinator.enabled);
        assert_eq!(config.full.coordinator.batch_size, 10);
        assert_eq!(config.full.coordinator.queue_limit, 5);
        assert_eq!(config.full.modulo_remainder, Some(1));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.pipeline.text_limit, 3000);
        assert_eq!(
            config.pipeline.partial_threshold,
            ContentThreshold::DocumentStartOnly
        );
        assert_eq!(config.periodic.window.unwrap().stop_hour, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_modulo() {
        let mut config = Config::default();
        config.full.modulo_divisor = Some(3);
        assert!(config.validate().is_err());
        config.full.modulo_remainder = Some(3);
        assert!(config.validate().is_err());
        config.full.modulo_remainder = Some(2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.pipeline.index_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.pipeline.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.pipeline.poll_interval_ms = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_base_url_without_slash() {
        let mut config = Config::default();
        config.search.base_url = "http://solr:8983/solr/core".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.toml");
        assert_eq!(config.search.page_size, 1000);
    }
}
