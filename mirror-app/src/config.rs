//! tgmirror configuration loader.

use mirror_engine::EngineConfig;
use mirror_telegram::TELEGRAM_API_BASE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Disable to run the engine against events from other intake sources only.
    #[serde(default = "default_true")]
    pub intake_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
}

fn default_api_base() -> String {
    TELEGRAM_API_BASE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_data_dir_string() -> String {
    "~/.tgmirror/data".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            intake_enabled: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir_string(),
        }
    }
}

impl AppConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: AppConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.telegram.bot_token = v;
            }
        }
        if let Ok(v) = std::env::var("TGMIRROR_DATA_DIR") {
            if !v.trim().is_empty() {
                self.storage.data_dir = v;
            }
        }
        if let Ok(v) = std::env::var("TGMIRROR_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("TGMIRROR_WORKERS") {
            match v.trim().parse::<usize>() {
                Ok(workers) => self.engine.workers = workers,
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid TGMIRROR_WORKERS")
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set TELEGRAM_BOT_TOKEN)"
            ));
        }
        self.bind_addr()?;
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        self.engine
            .validate()
            .map_err(|e| anyhow::anyhow!("engine: {e}"))?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".tgmirror").join("config.toml")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}
