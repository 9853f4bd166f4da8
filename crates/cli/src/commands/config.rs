use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use affinity_core::config::{AppConfig, LoadOptions, DEFAULT_CONFIG_FILE};
use affinity_core::domain::tenant::TenantStatus;
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    for row in effective_values(&config) {
        lines.push(render_line(row.key, &row.value, source(row.key, row.env_keys)));
    }

    lines.join("\n")
}

struct ConfigRow {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn row(key: &'static str, value: String, env_keys: &'static [&'static str]) -> ConfigRow {
    ConfigRow { key, value, env_keys }
}

fn effective_values(config: &AppConfig) -> Vec<ConfigRow> {
    let admin_token = config
        .server
        .admin_token
        .as_ref()
        .map_or_else(|| "<unset>".to_string(), |token| redact_token(token.expose_secret()));
    let statuses = config
        .recalculation
        .tenant_statuses
        .iter()
        .map(|status| TenantStatus::as_str(*status))
        .collect::<Vec<_>>()
        .join(",");

    vec![
        row("database.url", config.database.url.clone(), &["AFFINITY_DATABASE_URL"]),
        row(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["AFFINITY_DATABASE_MAX_CONNECTIONS"],
        ),
        row(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["AFFINITY_DATABASE_TIMEOUT_SECS"],
        ),
        row(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["AFFINITY_SERVER_BIND_ADDRESS"],
        ),
        row("server.port", config.server.port.to_string(), &["AFFINITY_SERVER_PORT"]),
        row(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["AFFINITY_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        row("server.admin_token", admin_token, &["AFFINITY_SERVER_ADMIN_TOKEN"]),
        row(
            "logging.level",
            config.logging.level.clone(),
            &["AFFINITY_LOGGING_LEVEL", "AFFINITY_LOG_LEVEL"],
        ),
        row(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["AFFINITY_LOGGING_FORMAT", "AFFINITY_LOG_FORMAT"],
        ),
        row(
            "pipeline.refresh_cache",
            config.pipeline.refresh_cache.to_string(),
            &["AFFINITY_PIPELINE_REFRESH_CACHE"],
        ),
        row(
            "pipeline.max_write_retries",
            config.pipeline.max_write_retries.to_string(),
            &["AFFINITY_PIPELINE_MAX_WRITE_RETRIES"],
        ),
        row(
            "recalculation.enabled",
            config.recalculation.enabled.to_string(),
            &["AFFINITY_RECALCULATION_ENABLED"],
        ),
        row(
            "recalculation.schedule",
            format!(
                "{:02}:{:02} UTC",
                config.recalculation.schedule_hour_utc, config.recalculation.schedule_minute
            ),
            &["AFFINITY_RECALCULATION_SCHEDULE_HOUR_UTC"],
        ),
        row(
            "recalculation.concurrency",
            config.recalculation.concurrency.to_string(),
            &["AFFINITY_RECALCULATION_CONCURRENCY"],
        ),
        row("recalculation.progress_every", config.recalculation.progress_every.to_string(), &[]),
        row("recalculation.tenant_statuses", statuses, &[]),
        row("scoring.max_score", config.scoring.max_score.to_string(), &[]),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config/affinity.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        let file_key = match key_path {
            "recalculation.schedule" => "recalculation.schedule_hour_utc",
            other => other,
        };
        if contains_path(doc, file_key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps at most a four character prefix so operators can tell tokens apart.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let prefix: String = trimmed.chars().take(4).collect();
    if trimmed.chars().count() > 12 {
        return format!("{prefix}***");
    }

    "<redacted>".to_string()
}
