use chat_relay_persistence::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub source: SourceConfig,
    pub completion: CompletionConfig,
    pub persistence: PersistenceConfig,
    pub dispatch: DispatchConfig,
    pub sweeper: SweeperConfig,
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub api_base: String,
    pub bot_token: String,
    /// Long-poll timeout passed to the source
    pub poll_timeout_secs: u64,
    /// Pause between poll cycles
    pub poll_interval_ms: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub api_base: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub model: String,
    /// USD per 1K tokens, by model
    pub pricing_per_1k_tokens: HashMap<String, f64>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub max_history_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of items handled at once
    pub concurrency: usize,
    pub idle_sleep_ms: u64,
    pub handler_timeout_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Must exceed the handler timeout so live work is never reclaimed
    pub lease_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub source_attempts: u32,
    pub completion_attempts: u32,
    pub store_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            source: SourceConfig::default(),
            completion: CompletionConfig::default(),
            persistence: PersistenceConfig::default(),
            dispatch: DispatchConfig::default(),
            sweeper: SweeperConfig::default(),
            retry: RetryConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            poll_timeout_secs: 30,
            poll_interval_ms: 3000,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        CompletionConfig {
            api_base: "https://api.openai.com".to_string(),
            api_key: String::new(),
            organization: None,
            model: "gpt-3.5-turbo".to_string(),
            pricing_per_1k_tokens: HashMap::from([("gpt-3.5-turbo".to_string(), 0.002)]),
            request_timeout_secs: 25,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            data_dir: PathBuf::from("./data"),
            max_history_messages: 40,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            concurrency: 4,
            idle_sleep_ms: 1000,
            handler_timeout_secs: 30,
            graceful_shutdown_timeout_secs: 20,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        SweeperConfig {
            interval_secs: 60,
            lease_timeout_secs: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            source_attempts: 5,
            completion_attempts: 3,
            store_attempts: 3,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_port: None,
        }
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &redact(&self.bot_token))
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &redact(&self.api_key))
            .field("organization", &self.organization)
            .field("model", &self.model)
            .field("pricing_per_1k_tokens", &self.pricing_per_1k_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl RelayConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Fill secrets from the environment (`TELEGRAM_BOT_TOKEN`,
    /// `OPENAI_API_KEY`, `OPENAI_ORG_ID`), overriding the file
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.source.bot_token = token;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.completion.api_key = key;
        }
        if let Some(org) = lookup("OPENAI_ORG_ID") {
            self.completion.organization = Some(org);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch.concurrency == 0 {
            anyhow::bail!("dispatch.concurrency must be at least 1");
        }
        if self.sweeper.lease_timeout_secs <= self.dispatch.handler_timeout_secs {
            anyhow::bail!(
                "sweeper.lease_timeout_secs ({}) must exceed dispatch.handler_timeout_secs ({})",
                self.sweeper.lease_timeout_secs,
                self.dispatch.handler_timeout_secs
            );
        }
        if self.source.bot_token.is_empty() {
            anyhow::bail!("source.bot_token is not set (TELEGRAM_BOT_TOKEN)");
        }
        if self.completion.api_key.is_empty() {
            anyhow::bail!("completion.api_key is not set (OPENAI_API_KEY)");
        }
        Ok(())
    }

    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.persistence.data_dir.clone(),
            max_history_messages: self.persistence.max_history_messages,
        }
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl DispatchConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}
