use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tenant::TenantStatus;
use crate::scoring::ScoringConfig;

pub const DEFAULT_CONFIG_FILE: &str = "affinity.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
    pub recalculation: RecalculationConfig,
    pub scoring: ScoringConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    /// Bearer token for the admin routes. Admin routes are open when unset.
    pub admin_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Refresh the affected cache pairs after each incremental update.
    pub refresh_cache: bool,
    /// Compare-and-swap attempts per product before giving up.
    pub max_write_retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecalculationConfig {
    pub enabled: bool,
    pub schedule_hour_utc: u32,
    pub schedule_minute: u32,
    /// Pair workers per tenant.
    pub concurrency: usize,
    pub progress_every: u64,
    pub tenant_statuses: Vec<TenantStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub server_port: Option<u16>,
    pub admin_token: Option<String>,
    pub recalculation_enabled: Option<bool>,
    pub recalculation_concurrency: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://affinity.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                admin_token: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            pipeline: PipelineConfig::default(),
            recalculation: RecalculationConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { refresh_cache: true, max_write_retries: 5 }
    }
}

impl Default for RecalculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_hour_utc: 3,
            schedule_minute: 0,
            concurrency: 4,
            progress_every: 100,
            tenant_statuses: vec![TenantStatus::Active, TenantStatus::Trial],
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(admin_token) = server.admin_token {
                self.server.admin_token = Some(secret_value(admin_token));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(refresh_cache) = pipeline.refresh_cache {
                self.pipeline.refresh_cache = refresh_cache;
            }
            if let Some(max_write_retries) = pipeline.max_write_retries {
                self.pipeline.max_write_retries = max_write_retries;
            }
        }

        if let Some(recalculation) = patch.recalculation {
            if let Some(enabled) = recalculation.enabled {
                self.recalculation.enabled = enabled;
            }
            if let Some(hour) = recalculation.schedule_hour_utc {
                self.recalculation.schedule_hour_utc = hour;
            }
            if let Some(minute) = recalculation.schedule_minute {
                self.recalculation.schedule_minute = minute;
            }
            if let Some(concurrency) = recalculation.concurrency {
                self.recalculation.concurrency = concurrency;
            }
            if let Some(progress_every) = recalculation.progress_every {
                self.recalculation.progress_every = progress_every;
            }
            if let Some(tenant_statuses) = recalculation.tenant_statuses {
                self.recalculation.tenant_statuses = tenant_statuses;
            }
        }

        if let Some(scoring) = patch.scoring {
            self.scoring = scoring;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("AFFINITY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("AFFINITY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("AFFINITY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("AFFINITY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AFFINITY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("AFFINITY_SERVER_PORT") {
            self.server.port = parse_u16("AFFINITY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("AFFINITY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_SERVER_ADMIN_TOKEN") {
            self.server.admin_token = Some(secret_value(value));
        }

        let log_level =
            read_env("AFFINITY_LOGGING_LEVEL").or_else(|| read_env("AFFINITY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("AFFINITY_LOGGING_FORMAT").or_else(|| read_env("AFFINITY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("AFFINITY_PIPELINE_REFRESH_CACHE") {
            self.pipeline.refresh_cache = parse_bool("AFFINITY_PIPELINE_REFRESH_CACHE", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_PIPELINE_MAX_WRITE_RETRIES") {
            self.pipeline.max_write_retries =
                parse_u32("AFFINITY_PIPELINE_MAX_WRITE_RETRIES", &value)?;
        }

        if let Some(value) = read_env("AFFINITY_RECALCULATION_ENABLED") {
            self.recalculation.enabled = parse_bool("AFFINITY_RECALCULATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_RECALCULATION_SCHEDULE_HOUR_UTC") {
            self.recalculation.schedule_hour_utc =
                parse_u32("AFFINITY_RECALCULATION_SCHEDULE_HOUR_UTC", &value)?;
        }
        if let Some(value) = read_env("AFFINITY_RECALCULATION_CONCURRENCY") {
            self.recalculation.concurrency =
                parse_usize("AFFINITY_RECALCULATION_CONCURRENCY", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(admin_token) = overrides.admin_token {
            self.server.admin_token = Some(secret_value(admin_token));
        }
        if let Some(enabled) = overrides.recalculation_enabled {
            self.recalculation.enabled = enabled;
        }
        if let Some(concurrency) = overrides.recalculation_concurrency {
            self.recalculation.concurrency = concurrency;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_pipeline(&self.pipeline)?;
        validate_recalculation(&self.recalculation)?;
        self.scoring.validate().map_err(|error| ConfigError::Validation(error.to_string()))?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config/affinity.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if let Some(token) = &server.admin_token {
        if token.expose_secret().trim().len() < 16 {
            return Err(ConfigError::Validation(
                "server.admin_token must be at least 16 characters when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.max_write_retries == 0 || pipeline.max_write_retries > 50 {
        return Err(ConfigError::Validation(
            "pipeline.max_write_retries must be in range 1..=50".to_string(),
        ));
    }
    Ok(())
}

fn validate_recalculation(recalculation: &RecalculationConfig) -> Result<(), ConfigError> {
    if recalculation.schedule_hour_utc > 23 {
        return Err(ConfigError::Validation(
            "recalculation.schedule_hour_utc must be in range 0..=23".to_string(),
        ));
    }
    if recalculation.schedule_minute > 59 {
        return Err(ConfigError::Validation(
            "recalculation.schedule_minute must be in range 0..=59".to_string(),
        ));
    }
    if recalculation.concurrency == 0 || recalculation.concurrency > 64 {
        return Err(ConfigError::Validation(
            "recalculation.concurrency must be in range 1..=64".to_string(),
        ));
    }
    if recalculation.progress_every == 0 {
        return Err(ConfigError::Validation(
            "recalculation.progress_every must be greater than zero".to_string(),
        ));
    }
    if recalculation.tenant_statuses.is_empty() {
        return Err(ConfigError::Validation(
            "recalculation.tenant_statuses must name at least one status".to_string(),
        ));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    pipeline: Option<PipelinePatch>,
    recalculation: Option<RecalculationPatch>,
    scoring: Option<ScoringConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    admin_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    refresh_cache: Option<bool>,
    max_write_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RecalculationPatch {
    enabled: Option<bool>,
    schedule_hour_utc: Option<u32>,
    schedule_minute: Option<u32>,
    concurrency: Option<usize>,
    progress_every: Option<u64>,
    tenant_statuses: Option<Vec<TenantStatus>>,
}
