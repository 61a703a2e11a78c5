use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{HostType, SessionConfig, User};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub widget: WidgetConfig,
    #[serde(default)]
    pub user: Option<UserConfig>,
    #[serde(default)]
    pub unread: UnreadConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn session(&self) -> SessionConfig {
        SessionConfig::new(self.widget.app_id.clone(), self.widget.host)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WidgetConfig {
    pub app_id: String,
    #[serde(default)]
    pub host: HostType,
}

/// A registered user; without this section the session runs anonymously.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl From<UserConfig> for User {
    fn from(config: UserConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            surname: config.surname,
            email: config.email,
            phone: config.phone,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnreadConfig {
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_recheck_seconds")]
    pub recheck_seconds: u64,
}

impl UnreadConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn recheck(&self) -> Duration {
        Duration::from_secs(self.recheck_seconds)
    }
}

impl Default for UnreadConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            recheck_seconds: default_recheck_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_host: default_probe_host(),
            probe_port: default_probe_port(),
            probe_interval_seconds: default_probe_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
    pub archive_dir: Option<String>,
}

impl StorageConfig {
    /// SQLite file for the key-value slots.
    pub fn database_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("sabycom.db"))
    }

    /// Directory holding the offline archive.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("sabycom"))
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    app_id: Option<String>,
    host: Option<String>,
    user_id: Option<String>,
    log_level: Option<String>,
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_recheck_seconds() -> u64 {
    10
}

fn default_probe_host() -> String {
    "consultant.sbis.ru".to_string()
}

fn default_probe_port() -> u16 {
    443
}

fn default_probe_interval_seconds() -> u64 {
    5
}

fn default_probe_timeout_seconds() -> u64 {
    3
}

fn default_request_timeout_seconds() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[widget]
app_id = ""
host = "prod"

# [user]
# id = "customer-42"
# name = "Anna"
# email = "anna@example.com"

[unread]
cooldown_seconds = 60
recheck_seconds = 10

[connectivity]
probe_host = "consultant.sbis.ru"
probe_port = 443
probe_interval_seconds = 5
probe_timeout_seconds = 3

[api]
request_timeout_seconds = 15

[logging]
level = "info"

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/sabycom/sabycom.db"
# archive_dir = "~/.local/share/sabycom/sabycom"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("ru", "sbis", "sabycom") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Platform-appropriate directory for persisted SDK data.
pub fn data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("ru", "sbis", "sabycom") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec!["widget.app_id".to_string()],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        app_id: std::env::var("SABYCOM_APP_ID").ok(),
        host: std::env::var("SABYCOM_HOST").ok(),
        user_id: std::env::var("SABYCOM_USER_ID").ok(),
        log_level: std::env::var("SABYCOM_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(app_id) = overrides.app_id {
        config.widget.app_id = app_id;
    }
    if let Some(host) = overrides.host {
        config.widget.host = host.parse().map_err(|_| ConfigError::InvalidValue {
            field: "widget.host".to_string(),
            message: format!("unknown host `{host}`"),
        })?;
    }
    if let Some(user_id) = overrides.user_id {
        match config.user.as_mut() {
            Some(user) => user.id = user_id,
            None => {
                config.user = Some(UserConfig {
                    id: user_id,
                    name: None,
                    surname: None,
                    email: None,
                    phone: None,
                })
            }
        }
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.widget.app_id.is_empty() {
        missing.push("widget.app_id".to_string());
    }
    if config.user.as_ref().is_some_and(|user| user.id.is_empty()) {
        missing.push("user.id".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if !config.session().has_valid_app_id() {
        return Err(ConfigError::InvalidValue {
            field: "widget.app_id".to_string(),
            message: "must be a UUID".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    for (field, value) in [
        ("unread.cooldown_seconds", config.unread.cooldown_seconds),
        ("unread.recheck_seconds", config.unread.recheck_seconds),
        (
            "connectivity.probe_interval_seconds",
            config.connectivity.probe_interval_seconds,
        ),
        (
            "connectivity.probe_timeout_seconds",
            config.connectivity.probe_timeout_seconds,
        ),
        ("api.request_timeout_seconds", config.api.request_timeout_seconds),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
    }

    if config.event_bus.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "event_bus.channel_capacity".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
