use config::Config;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path, result::Result};
use url::Url;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub poll_interval_secs: u64,
    pub classify_concurrency: usize,
    pub max_retries: u32,
    pub stale_after_secs: i64,
    pub review_threshold: f32,
    pub status_interval_secs: u64,
    pub feedback_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub feed_url: String,
    pub username: String,
}

impl MailboxConfig {
    /// The mailbox password is a secret and never lives in config.toml.
    pub fn password() -> Option<String> {
        env::var("MAILBOX_PASSWORD").ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketLimits {
    pub rate_limit_per_sec: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub key: String,
    pub generation_endpoint: String,
    pub embedding_endpoint: String,
    pub prompt_limits: BucketLimits,
    pub embed_limits: BucketLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub embedding_id: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub open_cooldown_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub parent: String,
    pub description: String,
    pub kinds: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    settings: Settings,
    mailbox: MailboxConfig,
    api: ApiConfig,
    model: ModelConfig,
    retrieval: RetrievalConfig,
    resilience: ResilienceConfig,
    notifier: NotifierConfig,
    categories: Vec<Category>,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub settings: Settings,
    pub mailbox: MailboxConfig,
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub resilience: ResilienceConfig,
    pub notifier: NotifierConfig,
    pub categories: Vec<Category>,
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\n{:?}\n\nMailbox: {} @ {}\n\nModel Config: {:?}\n\nRetrieval Config: {:?}\n\nResilience Config: {:?}\n\nCategories:\n{}",
            self.settings,
            self.mailbox.username,
            self.mailbox.feed_url,
            self.model,
            self.retrieval,
            self.resilience,
            self.categories
                .iter()
                .map(|c| format!("{} -> [{}]", c.parent, c.kinds.join(", ")))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

fn config_root() -> String {
    env::var("APP_DIR").unwrap_or_else(|_| {
        let dir =
            env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
        let dir = Path::new(&dir).parent().unwrap().display().to_string();
        format!("{}/config", dir)
    })
}

/// Fail-fast startup validation. Runs before the scheduler accepts any work so
/// a missing endpoint or credential aborts the process instead of surfacing as
/// per-item failures later.
pub fn validate_required_settings() -> AppResult<()> {
    Url::parse(&cfg.mailbox.feed_url)
        .map_err(|e| AppError::Config(format!("mailbox.feed_url is invalid: {e}")))?;
    Url::parse(&cfg.api.generation_endpoint)
        .map_err(|e| AppError::Config(format!("api.generation_endpoint is invalid: {e}")))?;
    Url::parse(&cfg.api.embedding_endpoint)
        .map_err(|e| AppError::Config(format!("api.embedding_endpoint is invalid: {e}")))?;

    if api_key().is_empty() {
        return Err(AppError::Config(
            "api.key (or GENAI_API_KEY) is required".to_string(),
        ));
    }
    if MailboxConfig::password().is_none() {
        return Err(AppError::Config("MAILBOX_PASSWORD is not set".to_string()));
    }
    if cfg.settings.poll_interval_secs == 0 {
        return Err(AppError::Config(
            "settings.poll_interval_secs must be at least 1".to_string(),
        ));
    }
    if cfg.categories.is_empty() {
        return Err(AppError::Config("no categories configured".to_string()));
    }

    Ok(())
}

pub fn api_key() -> String {
    env::var("GENAI_API_KEY").unwrap_or_else(|_| cfg.api.key.clone())
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = config_root();
        let path = format!("{root}/config.toml");
        let cfg_file: ConfigFile = Config::builder()
            .add_source(config::File::with_name(&path))
            .build()
            .expect("config.toml is required")
            .try_deserialize()
            .expect("config.toml is invalid");

        let ConfigFile {
            settings,
            mailbox,
            api,
            model,
            retrieval,
            resilience,
            notifier,
            categories,
        } = cfg_file;

        ServerConfig {
            settings,
            mailbox,
            api,
            model,
            retrieval,
            resilience,
            notifier,
            categories,
        }
    };
}
