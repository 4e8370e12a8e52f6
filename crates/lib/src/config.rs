//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.standin/config.json`) and environment.
//! Secrets (bot token, database URL, LLM key) are resolved env-first so the bot can
//! run from environment variables alone, with the file as an optional base.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings (health endpoint, webhook receiver).
    #[serde(default)]
    pub server: ServerConfig,

    /// Channel settings (Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// LLM settings (Groq or any OpenAI-compatible endpoint).
    #[serde(default)]
    pub llm: LlmConfig,

    /// Owner identity (the only account allowed to drive the bot).
    #[serde(default)]
    pub owner: OwnerConfig,
}

/// HTTP bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for the health endpoint and webhook receiver (default 8080).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
}

/// Database config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// PostgreSQL connection string. Overridden by DATABASE_URL env when set.
    pub url: Option<String>,
    /// Pool size (default 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// LLM config (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// API key. Overridden by GROQ_API_KEY env when set.
    pub api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API. Default is the Groq endpoint.
    pub base_url: Option<String>,
    /// Model name (default "llama-3.3-70b-versatile").
    pub model: Option<String>,
}

/// Owner identity config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerConfig {
    /// Telegram username of the owner (without @). Overridden by OWNER_USERNAME env when set.
    pub username: Option<String>,
}

const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_OWNER: &str = "owner";

/// Required settings resolved and validated at startup. Missing values are fatal.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub telegram_token: String,
    pub database_url: String,
    pub llm_api_key: String,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_nonempty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_nonempty("TELEGRAM_BOT_TOKEN")
        .or_else(|| config_nonempty(config.channels.telegram.bot_token.as_ref()))
}

/// Resolve the database URL: env DATABASE_URL overrides config.
pub fn resolve_database_url(config: &Config) -> Option<String> {
    env_nonempty("DATABASE_URL").or_else(|| config_nonempty(config.database.url.as_ref()))
}

/// Resolve the LLM API key: env GROQ_API_KEY overrides config.
pub fn resolve_llm_api_key(config: &Config) -> Option<String> {
    env_nonempty("GROQ_API_KEY").or_else(|| config_nonempty(config.llm.api_key.as_ref()))
}

/// Resolve the owner username: env OWNER_USERNAME overrides config; falls back to "owner".
pub fn resolve_owner_username(config: &Config) -> String {
    env_nonempty("OWNER_USERNAME")
        .or_else(|| config_nonempty(config.owner.username.as_ref()))
        .unwrap_or_else(|| DEFAULT_OWNER.to_string())
}

/// Resolve the model name from config or default.
pub fn resolve_model(config: &Config) -> String {
    config_nonempty(config.llm.model.as_ref()).unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Validate the required settings. The error names the missing env var so startup
/// failures are self-explanatory.
pub fn resolve_secrets(config: &Config) -> Result<Secrets> {
    let telegram_token = resolve_telegram_token(config)
        .context("telegram bot token not set (TELEGRAM_BOT_TOKEN or channels.telegram.botToken)")?;
    let database_url = resolve_database_url(config)
        .context("database URL not set (DATABASE_URL or database.url)")?;
    let llm_api_key = resolve_llm_api_key(config)
        .context("LLM API key not set (GROQ_API_KEY or llm.apiKey)")?;
    Ok(Secrets {
        telegram_token,
        database_url,
        llm_api_key,
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("STANDIN_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".standin").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or STANDIN_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
