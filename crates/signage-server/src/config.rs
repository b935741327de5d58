//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitOverrides,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL displays are told to use for the verification page, e.g.
    /// "https://signage.example.com".
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Timeout for public device-grant endpoints, in seconds.
    #[serde(default = "default_public_timeout_seconds")]
    pub public_timeout_seconds: u64,
    /// Timeout for bearer-authenticated endpoints, in seconds.
    #[serde(default = "default_protected_timeout_seconds")]
    pub protected_timeout_seconds: u64,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_db_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// CORS configuration. Empty `allowed_origins` means same-origin only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Per-class rate overrides. Absent fields keep the baseline rate; period,
/// burst, and wait-timeout are not exposed here — operators who need to
/// change those register a fresh policy programmatically.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitOverrides {
    pub token_refresh_rate: Option<u32>,
    pub api_request_rate: Option<u32>,
    pub device_code_rate: Option<u32>,
    pub ws_connection_rate: Option<u32>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}
fn default_port() -> u16 {
    8080
}
fn default_public_url() -> String {
    String::new()
}
fn default_public_timeout_seconds() -> u64 {
    10
}
fn default_protected_timeout_seconds() -> u64 {
    30
}
fn default_db_path() -> String {
    "signage.db".to_string()
}
fn default_db_busy_timeout_ms() -> u32 {
    5_000
}
fn default_db_pool_max_size() -> u32 {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            public_timeout_seconds: default_public_timeout_seconds(),
            protected_timeout_seconds: default_protected_timeout_seconds(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_db_busy_timeout_ms(),
            pool_max_size: default_db_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: &'static str, reason: String },
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

const MIN_DB_BUSY_TIMEOUT_MS: u32 = 1;
const MAX_DB_BUSY_TIMEOUT_MS: u32 = 60_000;
const MIN_DB_POOL_MAX_SIZE: u32 = 1;
const MAX_DB_POOL_MAX_SIZE: u32 = 64;

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if !(MIN_DB_BUSY_TIMEOUT_MS..=MAX_DB_BUSY_TIMEOUT_MS).contains(&config.database.busy_timeout_ms)
    {
        return Err(ConfigError::InvalidValue {
            field: "database.busy_timeout_ms",
            reason: format!(
                "must be in range {MIN_DB_BUSY_TIMEOUT_MS}..={MAX_DB_BUSY_TIMEOUT_MS}, got {}",
                config.database.busy_timeout_ms
            ),
        });
    }

    if !(MIN_DB_POOL_MAX_SIZE..=MAX_DB_POOL_MAX_SIZE).contains(&config.database.pool_max_size) {
        return Err(ConfigError::InvalidValue {
            field: "database.pool_max_size",
            reason: format!(
                "must be in range {MIN_DB_POOL_MAX_SIZE}..={MAX_DB_POOL_MAX_SIZE}, got {}",
                config.database.pool_max_size
            ),
        });
    }

    if config.server.public_timeout_seconds == 0 || config.server.protected_timeout_seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "server.*_timeout_seconds",
            reason: "timeouts must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn parse_env_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw.parse::<T>().map_err(|err| ConfigError::InvalidEnvVar {
                name,
                reason: err.to_string(),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            let parsed = match normalized.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
            .ok_or_else(|| ConfigError::InvalidEnvVar {
                name,
                reason: format!("expected one of [true,false,1,0,yes,no,on,off], got '{raw}'"),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file does not exist. Environment variables listed below override
/// whatever the file (or the defaults) provided.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(host) = parse_env_var("SIGNAGE_HOST")? {
        config.server.host = host;
    }
    if let Some(port) = parse_env_var("SIGNAGE_PORT")? {
        config.server.port = port;
    }
    if let Some(url) = parse_env_var::<String>("SIGNAGE_PUBLIC_URL")? {
        config.server.public_url = url;
    }
    if let Some(db_path) = parse_env_var::<String>("SIGNAGE_DB_PATH")? {
        config.database.path = db_path;
    }
    if let Some(timeout) = parse_env_var("SIGNAGE_DB_BUSY_TIMEOUT_MS")? {
        config.database.busy_timeout_ms = timeout;
    }
    if let Some(max_size) = parse_env_var("SIGNAGE_DB_POOL_MAX_SIZE")? {
        config.database.pool_max_size = max_size;
    }
    if let Some(level) = parse_env_var::<String>("SIGNAGE_LOG_LEVEL")? {
        config.logging.level = level;
    }
    if let Some(json) = parse_env_bool("SIGNAGE_LOG_JSON")? {
        config.logging.json = json;
    }
    if let Ok(origins) = std::env::var("SIGNAGE_CORS_ORIGINS") {
        config.cors.allowed_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(rate) = parse_env_var("SIGNAGE_RATE_TOKEN_REFRESH")? {
        config.rate_limit.token_refresh_rate = Some(rate);
    }
    if let Some(rate) = parse_env_var("SIGNAGE_RATE_API_REQUEST")? {
        config.rate_limit.api_request_rate = Some(rate);
    }
    if let Some(rate) = parse_env_var("SIGNAGE_RATE_DEVICE_CODE")? {
        config.rate_limit.device_code_rate = Some(rate);
    }
    if let Some(rate) = parse_env_var("SIGNAGE_RATE_WS_CONNECTION")? {
        config.rate_limit.ws_connection_rate = Some(rate);
    }

    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_env() {
        for name in [
            "SIGNAGE_HOST",
            "SIGNAGE_PORT",
            "SIGNAGE_PUBLIC_URL",
            "SIGNAGE_DB_PATH",
            "SIGNAGE_DB_BUSY_TIMEOUT_MS",
            "SIGNAGE_DB_POOL_MAX_SIZE",
            "SIGNAGE_LOG_LEVEL",
            "SIGNAGE_LOG_JSON",
            "SIGNAGE_CORS_ORIGINS",
            "SIGNAGE_RATE_TOKEN_REFRESH",
            "SIGNAGE_RATE_API_REQUEST",
            "SIGNAGE_RATE_DEVICE_CODE",
            "SIGNAGE_RATE_WS_CONNECTION",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn defaults_when_no_file_present() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        let config = load_config(Some("/nonexistent/signage-config.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, "signage.db");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        std::env::set_var("SIGNAGE_PORT", "9090");
        std::env::set_var("SIGNAGE_LOG_JSON", "true");
        std::env::set_var("SIGNAGE_RATE_DEVICE_CODE", "3");

        let config = load_config(None).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.logging.json);
        assert_eq!(config.rate_limit.device_code_rate, Some(3));

        clear_env();
    }

    #[test]
    fn rejects_out_of_range_busy_timeout() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        std::env::set_var("SIGNAGE_DB_BUSY_TIMEOUT_MS", "0");
        let err = load_config(None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        clear_env();
    }

    #[test]
    fn rejects_malformed_env_var() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        std::env::set_var("SIGNAGE_PORT", "not-a-port");
        let err = load_config(None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
        clear_env();
    }
}
