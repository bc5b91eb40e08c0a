use std::collections::HashSet;

use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PalaverError, Result};
use crate::types::ExtensionKind;

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TELNET_PORT: u16 = 2323;
pub const DEFAULT_QUEUE_DEPTH: usize = 8;
pub const DEFAULT_CONTEXT_MAX: usize = 40;
pub const DEFAULT_CLEAR_COMMAND: &str = "//clear.";
pub const DEFAULT_FALLBACK_RESPONSE: &str = "Sorry, I couldn't come up with a reply just now.";

/// Top-level config (palaver.toml + PALAVER_* env overrides).
///
/// Built once at startup and shared read-only (`Arc<PalaverConfig>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PalaverConfig {
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Ordered extension descriptors. Position is the tie-break priority.
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telnet: TelnetConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// System persona injected by the `builtin.persona` extension.
    #[serde(default)]
    pub persona: String,
    /// Sent instead of a model reply when completion fails.
    #[serde(default = "default_fallback")]
    pub fallback_response: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            persona: String::new(),
            fallback_response: default_fallback(),
        }
    }
}

/// How the context window size is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetMode {
    /// Number of entries.
    Count,
    /// Estimated tokens (`ceil(chars / 4)` per entry).
    Tokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBudget {
    pub mode: BudgetMode,
    pub max: usize,
}

impl Default for WindowBudget {
    fn default() -> Self {
        Self {
            mode: BudgetMode::Count,
            max: DEFAULT_CONTEXT_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub budget: WindowBudget,
    /// Persist committed history through the key-value store.
    #[serde(default = "bool_true")]
    pub persist: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: WindowBudget::default(),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Messages a conversation may have waiting behind its active run.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_extension_timeout_ms")]
    pub extension_timeout_ms: u64,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// Log the full context window sent to completion at debug level.
    #[serde(default)]
    pub debug_conversation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            extension_timeout_ms: default_extension_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            debug_conversation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_clear_command")]
    pub clear: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            clear: default_clear_command(),
        }
    }
}

/// One `[[extensions]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Stage kind as written in the file (`"ctx"`, `"rag"`, …).
    pub kind: String,
    /// Factory key, e.g. `"builtin.persona"`.
    pub module: String,
    /// Target platforms; empty means every platform.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Free-form options handed to the factory.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ExtensionConfig {
    pub fn new(kind: ExtensionKind, module: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            module: module.into(),
            platforms: Vec::new(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_platforms(mut self, platforms: &[&str]) -> Self {
        self.platforms = platforms.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Parsed stage kind, or a `ConfigurationError` naming the bad value.
    pub fn parsed_kind(&self) -> Result<ExtensionKind> {
        self.kind
            .parse()
            .map_err(|e: String| PalaverError::Configuration(format!("{e} (module {})", self.module)))
    }
}

/// Defines when a scheduled IPC command fires (all times UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given instant.
    Once { at: DateTime<Utc> },
    /// Fire repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },
    /// Fire every day at HH:MM.
    Daily { hour: u8, minute: u8 },
    /// Fire on a weekday (0 = Monday … 6 = Sunday) at HH:MM.
    Weekly { day: u8, hour: u8, minute: u8 },
}

/// One `[[schedules]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub command: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionBackendKind {
    /// Replies with the latest user entry (local smoke testing).
    Echo,
    /// Always fails, so every turn takes the fallback path.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_backend")]
    pub backend: CompletionBackendKind,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backend: default_completion_backend(),
        }
    }
}

/// A static document served by the built-in keyword knowledge backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub topic: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub documents: Vec<KnowledgeDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelnetConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_telnet_port")]
    pub port: u16,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_TELNET_PORT,
        }
    }
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (`X-Hub-Signature-256: sha256=<hex>`).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication, trusted networks only.
    None,
}

/// One push source: `POST /webhooks/{name}` becomes IPC command `command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    pub name: String,
    pub command: String,
    pub secret: Option<String>,
    pub auth_mode: WebhookAuthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

fn bool_true() -> bool {
    true
}
fn default_fallback() -> String {
    DEFAULT_FALLBACK_RESPONSE.to_string()
}
fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}
fn default_extension_timeout_ms() -> u64 {
    10_000
}
fn default_completion_timeout_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_clear_command() -> String {
    DEFAULT_CLEAR_COMMAND.to_string()
}
fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sqlite
}
fn default_completion_backend() -> CompletionBackendKind {
    CompletionBackendKind::Echo
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_telnet_port() -> u16 {
    DEFAULT_TELNET_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.palaver/palaver.db", home)
}

impl PalaverConfig {
    /// Load config from a TOML file with PALAVER_* env var overrides.
    ///
    /// Nested keys use a double underscore: `PALAVER_PIPELINE__QUEUE_DEPTH=4`.
    /// The result is validated before it is returned.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PalaverConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PALAVER_").split("__"))
            .extract()
            .map_err(|e| PalaverError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse config from an in-memory TOML string (no env overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: PalaverConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| PalaverError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed values and duplicate extension descriptors.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_depth == 0 {
            return Err(PalaverError::config("pipeline.queue_depth must be at least 1"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(PalaverError::config("dispatch.max_attempts must be at least 1"));
        }
        if self.context.budget.max == 0 {
            return Err(PalaverError::config("context.budget.max must be at least 1"));
        }

        let mut seen = HashSet::new();
        for ext in &self.extensions {
            let kind = ext.parsed_kind()?;
            if ext.module.trim().is_empty() {
                return Err(PalaverError::config(format!(
                    "extension of kind {kind} has an empty module reference"
                )));
            }
            if !seen.insert((kind, ext.module.clone())) {
                return Err(PalaverError::config(format!(
                    "duplicate extension descriptor: {kind} {}",
                    ext.module
                )));
            }
        }

        for source in &self.webhooks.sources {
            if source.auth_mode != WebhookAuthMode::None && source.secret.is_none() {
                return Err(PalaverError::config(format!(
                    "webhook source '{}' requires a secret",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.palaver/palaver.toml", home)
}
