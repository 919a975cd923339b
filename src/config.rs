//! TOML configuration.
//!
//! Every section except `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//! ```
//!
//! [`load_config`] parses and validates; an invalid value fails with a
//! message naming the offending key.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kb_sync_core::models::{RetrievalSlice, DEFAULT_FILTERED_BOOST};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            max_wait_secs: default_max_wait_secs(),
            conflict_retries: default_conflict_retries(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }
    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

fn default_poll_initial_ms() -> u64 {
    2000
}
fn default_poll_max_ms() -> u64 {
    30_000
}
fn default_max_wait_secs() -> u64 {
    600
}
fn default_conflict_retries() -> u32 {
    3
}
fn default_conflict_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_redeliver_delay_secs")]
    pub redeliver_delay_secs: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            redeliver_delay_secs: default_redeliver_delay_secs(),
            max_deliveries: default_max_deliveries(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

fn default_dedup_window_secs() -> u64 {
    300
}
fn default_visibility_timeout_secs() -> u64 {
    900
}
fn default_redeliver_delay_secs() -> u64 {
    60
}
fn default_max_deliveries() -> u32 {
    5
}
fn default_idle_poll_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_step_budget_secs")]
    pub step_budget_secs: u64,
    #[serde(default = "default_sync_poll_secs")]
    pub sync_poll_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Fail the job when the share of failed items exceeds this. When
    /// unset the job fails only if every item failed.
    #[serde(default)]
    pub max_failure_ratio: Option<f64>,
    #[serde(default = "default_max_error_messages")]
    pub max_error_messages: usize,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            step_budget_secs: default_step_budget_secs(),
            sync_poll_secs: default_sync_poll_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            max_failure_ratio: None,
            max_error_messages: default_max_error_messages(),
        }
    }
}

fn default_page_size() -> usize {
    100
}
fn default_step_budget_secs() -> u64 {
    50
}
fn default_sync_poll_secs() -> u64 {
    15
}
fn default_sync_timeout_secs() -> u64 {
    3600
}
fn default_max_error_messages() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default)]
    pub slices: Vec<SliceConfig>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            candidate_k: default_candidate_k(),
            slices: Vec::new(),
        }
    }
}

fn default_final_limit() -> usize {
    8
}
fn default_candidate_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct SliceConfig {
    pub slice_id: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub boost_factor: Option<f64>,
    #[serde(default)]
    pub min_guaranteed: usize,
}

impl RetrievalConfig {
    /// Slices in priority order. An empty list yields one unfiltered
    /// `default` slice.
    pub fn slices(&self) -> Vec<RetrievalSlice> {
        if self.slices.is_empty() {
            return vec![RetrievalSlice::unfiltered("default")];
        }
        self.slices
            .iter()
            .map(|s| {
                let base = match &s.filter {
                    Some(f) => RetrievalSlice::filtered(s.slice_id.clone(), f.clone()),
                    None => RetrievalSlice::unfiltered(s.slice_id.clone()),
                };
                let base = match s.boost_factor {
                    Some(b) => base.with_boost(b),
                    None => base,
                };
                base.with_min_guaranteed(s.min_guaranteed)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Defaults with the database at `db_path`. Used by tests and embedders.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            backend: BackendConfig::default(),
            coordinator: CoordinatorConfig::default(),
            queue: QueueConfig::default(),
            reindex: ReindexConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.path.as_os_str().is_empty() {
        bail!("db.path must not be empty");
    }

    // Backend
    match config.backend.provider.as_str() {
        "memory" => {}
        "http" => {
            if config.backend.base_url.as_deref().map_or(true, str::is_empty) {
                bail!("backend.base_url must be set when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown backend provider: '{}'. Must be memory or http.",
            other
        ),
    }
    if config.backend.timeout_secs == 0 {
        bail!("backend.timeout_secs must be > 0");
    }

    // Coordinator
    let c = &config.coordinator;
    if c.poll_initial_ms == 0 {
        bail!("coordinator.poll_initial_ms must be > 0");
    }
    if c.poll_max_ms < c.poll_initial_ms {
        bail!("coordinator.poll_max_ms must be >= coordinator.poll_initial_ms");
    }

    // Queue
    if config.queue.max_deliveries < 1 {
        bail!("queue.max_deliveries must be >= 1");
    }
    if config.queue.visibility_timeout_secs <= c.max_wait_secs {
        bail!("queue.visibility_timeout_secs must be greater than coordinator.max_wait_secs");
    }

    // Reindex
    if config.reindex.page_size == 0 {
        bail!("reindex.page_size must be > 0");
    }
    if config.reindex.step_budget_secs == 0 {
        bail!("reindex.step_budget_secs must be > 0");
    }
    if let Some(r) = config.reindex.max_failure_ratio {
        if !(0.0..=1.0).contains(&r) {
            bail!("reindex.max_failure_ratio must be in [0.0, 1.0]");
        }
    }

    // Retrieval
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.candidate_k < 1 {
        bail!("retrieval.candidate_k must be >= 1");
    }
    let mut seen = HashSet::new();
    for slice in &config.retrieval.slices {
        if slice.slice_id.trim().is_empty() {
            bail!("retrieval.slices: slice_id must not be empty");
        }
        if !seen.insert(slice.slice_id.as_str()) {
            bail!("retrieval.slices: duplicate slice_id '{}'", slice.slice_id);
        }
        let boost = slice.boost_factor.unwrap_or(if slice.filter.is_some() {
            DEFAULT_FILTERED_BOOST
        } else {
            1.0
        });
        if !boost.is_finite() || boost < 1.0 {
            bail!(
                "retrieval.slices.{}: boost_factor must be >= 1.0",
                slice.slice_id
            );
        }
    }

    Ok(())
}
