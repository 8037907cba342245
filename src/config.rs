//! Configuration loader and validator for the blog API.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub server: Server,
    pub database: Database,
    #[serde(default)]
    pub log: Log,
    pub jwt: Jwt,
    #[serde(default)]
    pub password: Password,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub throttle: Throttle,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub url: String,
}

/// Fallback log filter used when `RUST_LOG` is unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Access/refresh token settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwt {
    pub secret: String,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_minutes: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_hours: u64,
}

/// Password strength policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Password {
    pub min_length: usize,
    pub must_shift_case: bool,
    pub must_have_digits: bool,
    pub must_have_symbols: bool,
}

impl Default for Password {
    fn default() -> Self {
        Self {
            min_length: 6,
            must_shift_case: true,
            must_have_digits: true,
            must_have_symbols: true,
        }
    }
}

/// Delayed-publication scheduler settings. Read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Scheduler {
    pub interval_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backlog_warn_threshold: usize,
    pub page_size: i64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            workers: 5,
            queue_capacity: 1000,
            backlog_warn_threshold: 500,
            page_size: 100,
        }
    }
}

impl Scheduler {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-IP rate limiting for the auth endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Throttle {
    pub auth_limit: u32,
    pub auth_window_secs: u64,
    pub trusted_proxies: Vec<String>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            auth_limit: 10,
            auth_window_secs: 60,
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_access_ttl() -> u64 {
    5
}

fn default_refresh_ttl() -> u64 {
    24
}

impl Config {
    /// Apply `DATABASE_URL` and `JWT_SECRET` from the environment when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.trim().is_empty() {
                self.jwt.secret = secret;
            }
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.host.trim().is_empty() {
        return Err(ConfigError::Invalid("server.host must be non-empty"));
    }
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }

    if cfg.jwt.secret.trim().is_empty() {
        return Err(ConfigError::Invalid("jwt.secret must be non-empty"));
    }
    if cfg.jwt.access_token_ttl_minutes == 0 {
        return Err(ConfigError::Invalid("jwt.access_token_ttl_minutes must be > 0"));
    }
    if cfg.jwt.refresh_token_ttl_hours == 0 {
        return Err(ConfigError::Invalid("jwt.refresh_token_ttl_hours must be > 0"));
    }

    let s = &cfg.scheduler;
    if s.interval_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.interval_secs must be > 0"));
    }
    if s.workers == 0 {
        return Err(ConfigError::Invalid("scheduler.workers must be > 0"));
    }
    if s.queue_capacity == 0 {
        return Err(ConfigError::Invalid("scheduler.queue_capacity must be > 0"));
    }
    if s.page_size <= 0 {
        return Err(ConfigError::Invalid("scheduler.page_size must be > 0"));
    }

    if cfg.throttle.auth_limit == 0 {
        return Err(ConfigError::Invalid("throttle.auth_limit must be > 0"));
    }
    if cfg.throttle.auth_window_secs == 0 {
        return Err(ConfigError::Invalid("throttle.auth_window_secs must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML configuration shipped with the repo.
pub fn example() -> &'static str {
    r#"server:
  host: "0.0.0.0"
  port: 8080
  shutdown_timeout_secs: 30

database:
  url: "sqlite://./data/blog.db"

log:
  level: "info"

jwt:
  secret: "CHANGE_ME"
  access_token_ttl_minutes: 5
  refresh_token_ttl_hours: 24

password:
  min_length: 6
  must_shift_case: true
  must_have_digits: true
  must_have_symbols: true

scheduler:
  interval_secs: 60
  workers: 5
  queue_capacity: 1000
  backlog_warn_threshold: 500
  page_size: 100

throttle:
  auth_limit: 10
  auth_window_secs: 60
  trusted_proxies:
    - "127.0.0.1"
"#
}
