use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GmailError, Result};
use crate::request::{Operation, OperationKind};

/// Gmail's batchModify/batchDelete accept at most this many ids per call
pub const PROVIDER_MAX_BATCH: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_ceiling")]
    pub daily_ceiling: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Persist the daily window here so restarts keep counting
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_ceiling: default_daily_ceiling(),
            warning_threshold: default_warning_threshold(),
            state_path: None,
        }
    }
}

/// Quota units charged per Gmail API method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_cost_five")]
    pub list_messages: u32,
    #[serde(default = "default_cost_five")]
    pub get_message: u32,
    #[serde(default = "default_cost_one")]
    pub list_labels: u32,
    #[serde(default = "default_cost_five")]
    pub get_attachment: u32,
    #[serde(default = "default_cost_five")]
    pub modify_message: u32,
    #[serde(default = "default_cost_five")]
    pub trash_message: u32,
    #[serde(default = "default_cost_ten")]
    pub delete_message: u32,
    #[serde(default = "default_cost_five")]
    pub create_label: u32,
    #[serde(default = "default_cost_ten")]
    pub create_draft: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            list_messages: 5,
            get_message: 5,
            list_labels: 1,
            get_attachment: 5,
            modify_message: 5,
            trash_message: 5,
            delete_message: 10,
            create_label: 5,
            create_draft: 10,
        }
    }
}

impl CostConfig {
    pub fn units_for(&self, operation: &Operation) -> u32 {
        match operation {
            Operation::ListMessages { .. } => self.list_messages,
            Operation::GetMessage { .. } => self.get_message,
            Operation::ListLabels => self.list_labels,
            Operation::GetAttachment { .. } => self.get_attachment,
            Operation::ModifyMessage { .. } => self.modify_message,
            Operation::TrashMessage { .. } => self.trash_message,
            Operation::DeleteMessage { .. } => self.delete_message,
            Operation::CreateLabel { .. } => self.create_label,
            Operation::CreateDraft { .. } => self.create_draft,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_message_list_ttl")]
    pub message_list_ttl_secs: u64,
    #[serde(default = "default_message_content_ttl")]
    pub message_content_ttl_secs: u64,
    #[serde(default = "default_labels_ttl")]
    pub labels_ttl_secs: u64,
    #[serde(default = "default_attachment_ttl")]
    pub attachment_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            capacity: default_cache_capacity(),
            message_list_ttl_secs: default_message_list_ttl(),
            message_content_ttl_secs: default_message_content_ttl(),
            labels_ttl_secs: default_labels_ttl(),
            attachment_ttl_secs: default_attachment_ttl(),
        }
    }
}

impl CacheConfig {
    /// TTL for a read operation's cached response
    pub fn ttl_for(&self, operation: &Operation) -> Option<Duration> {
        let secs = match operation {
            Operation::ListMessages { .. } => self.message_list_ttl_secs,
            // Message content is immutable once sent
            Operation::GetMessage { .. } => self.message_content_ttl_secs,
            Operation::ListLabels => self.labels_ttl_secs,
            Operation::GetAttachment { .. } => self.attachment_ttl_secs,
            _ => return None,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
    #[serde(default = "default_weight")]
    pub read_weight: f64,
    #[serde(default = "default_weight")]
    pub write_weight: f64,
    /// Give up waiting for tokens (or quota) after this long
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_per_second: default_refill_per_second(),
            read_weight: default_weight(),
            write_weight: default_weight(),
            acquire_timeout_secs: None,
        }
    }
}

impl RateLimitConfig {
    pub fn weight_for(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Read => self.read_weight,
            OperationKind::Write | OperationKind::Delete => self.write_weight,
        }
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_wait_ms: default_batch_max_wait_ms(),
        }
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            token_cache_path: default_token_cache_path(),
        }
    }
}

fn default_daily_ceiling() -> u64 {
    1_000_000
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_cost_one() -> u32 {
    1
}

fn default_cost_five() -> u32 {
    5
}

fn default_cost_ten() -> u32 {
    10
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_message_list_ttl() -> u64 {
    300
}

fn default_message_content_ttl() -> u64 {
    3600
}

fn default_labels_ttl() -> u64 {
    3600
}

fn default_attachment_ttl() -> u64 {
    86_400
}

fn default_max_tokens() -> f64 {
    500.0
}

fn default_refill_per_second() -> f64 {
    250.0
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_jitter() -> bool {
    true
}

fn default_batch_max_size() -> usize {
    100
}

fn default_batch_max_wait_ms() -> u64 {
    2000
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".gmail-access/token.json")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GmailError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GmailError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GmailError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.quota.daily_ceiling == 0 {
            return Err(GmailError::ConfigError(
                "quota.daily_ceiling must be greater than 0".to_string(),
            ));
        }
        if !(self.quota.warning_threshold > 0.0 && self.quota.warning_threshold <= 1.0) {
            return Err(GmailError::ConfigError(
                "quota.warning_threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(GmailError::ConfigError(
                "cache.capacity must be at least 1 when the cache is enabled".to_string(),
            ));
        }

        if !(self.rate_limit.max_tokens > 0.0) {
            return Err(GmailError::ConfigError(
                "rate_limit.max_tokens must be greater than 0".to_string(),
            ));
        }
        if !(self.rate_limit.refill_per_second > 0.0) {
            return Err(GmailError::ConfigError(
                "rate_limit.refill_per_second must be greater than 0".to_string(),
            ));
        }
        if !(self.rate_limit.read_weight > 0.0) || !(self.rate_limit.write_weight > 0.0) {
            return Err(GmailError::ConfigError(
                "rate_limit weights must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(GmailError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(GmailError::ConfigError(
                "retry.base_delay_ms cannot exceed retry.max_delay_ms".to_string(),
            ));
        }

        if self.batch.max_size == 0 {
            return Err(GmailError::ConfigError(
                "batch.max_size must be at least 1".to_string(),
            ));
        }
        if self.batch.max_size > PROVIDER_MAX_BATCH {
            return Err(GmailError::ConfigError(format!(
                "batch.max_size cannot exceed {} (Gmail batch endpoint limit)",
                PROVIDER_MAX_BATCH
            )));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
