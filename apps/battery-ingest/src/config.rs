use crate::arbitration::{ArbitrationPolicy, DEFAULT_REOPEN_WINDOW_SECS};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/battery-ingest/config.json";

/// Upper bound for the reopening window: one day.
const MAX_REOPEN_WINDOW_SECS: u64 = 86_400;

fn check_reopen_window(secs: u64, source: &str) -> Result<u64> {
    if secs > MAX_REOPEN_WINDOW_SECS {
        return Err(anyhow!(
            "{source} must be at most {MAX_REOPEN_WINDOW_SECS} seconds, got {secs}"
        ));
    }
    Ok(secs)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow!("unknown storage backend {other:?}")),
        }
    }
}

fn setup_config_path() -> PathBuf {
    env_optional("INGEST_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    reopen_window_secs: Option<u64>,
    #[serde(default)]
    arbitration_policy: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "battery-ingest failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents, &path)
}

fn parse_setup_config(contents: String, path: &std::path::Path) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "battery-ingest failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Setup-file values only fill settings whose env var is unset.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> Result<()> {
    let env_allows = |key: &str| env_optional(key).is_none();
    let trimmed = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("INGEST_MQTT_HOST") {
        if let Some(host) = trimmed(&overrides.mqtt_host) {
            config.mqtt_host = host;
        }
    }
    if env_allows("INGEST_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("INGEST_MQTT_USERNAME") && overrides.mqtt_username.is_some() {
        config.mqtt_username = trimmed(&overrides.mqtt_username);
    }
    if env_allows("INGEST_MQTT_PASSWORD") && overrides.mqtt_password.is_some() {
        config.mqtt_password = trimmed(&overrides.mqtt_password);
    }
    if env_allows("INGEST_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = trimmed(&overrides.mqtt_topic_prefix) {
            config.mqtt_topic_prefix = prefix;
        }
    }
    if env_allows("INGEST_REOPEN_WINDOW_SECS") {
        if let Some(secs) = overrides.reopen_window_secs {
            config.reopen_window_secs = check_reopen_window(secs, "reopen_window_secs")?;
        }
    }
    if env_allows("INGEST_ARBITRATION_POLICY") {
        if let Some(policy) = trimmed(&overrides.arbitration_policy) {
            config.arbitration_policy = policy
                .parse::<ArbitrationPolicy>()
                .map_err(|err: String| anyhow!(err))
                .context("invalid arbitration_policy in setup config")?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub http_bind: String,
    pub reopen_window_secs: u64,
    pub arbitration_policy: ArbitrationPolicy,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let storage_backend = match env_optional("INGEST_STORAGE_BACKEND") {
            Some(raw) => raw.parse().context("invalid INGEST_STORAGE_BACKEND")?,
            None => StorageBackend::Postgres,
        };

        let database_url = env_optional("INGEST_DATABASE_URL")
            .or_else(|| env_optional("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .map(normalize_database_url);
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            return Err(anyhow!(
                "INGEST_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)"
            ));
        }

        let db_pool_size = env_parse("INGEST_DB_POOL_SIZE", 10u32)?;
        let mqtt_host = env_optional("INGEST_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = env_parse("INGEST_MQTT_PORT", 1883u16)?;
        let mqtt_username = env_optional("INGEST_MQTT_USERNAME");
        let mqtt_password = env_optional("INGEST_MQTT_PASSWORD");
        let mqtt_topic_prefix = env_optional("INGEST_MQTT_TOPIC_PREFIX")
            .unwrap_or_else(|| "battery-monitor".to_string());
        let mqtt_keepalive_secs = env_parse("INGEST_MQTT_KEEPALIVE_SECS", 30u64)?;
        let mqtt_client_id = env_optional("INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("battery-ingest-{}", std::process::id()));
        let enable_mqtt_listener = env_optional("INGEST_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let http_bind =
            env_optional("INGEST_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:9102".to_string());
        let reopen_window_secs = check_reopen_window(
            env_parse("INGEST_REOPEN_WINDOW_SECS", DEFAULT_REOPEN_WINDOW_SECS)?,
            "INGEST_REOPEN_WINDOW_SECS",
        )?;
        let arbitration_policy = match env_optional("INGEST_ARBITRATION_POLICY") {
            Some(raw) => raw
                .parse::<ArbitrationPolicy>()
                .map_err(|err: String| anyhow!(err))
                .context("invalid INGEST_ARBITRATION_POLICY")?,
            None => ArbitrationPolicy::default(),
        };
        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            storage_backend,
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            http_bind,
            reopen_window_secs,
            arbitration_policy,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides)?;
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reopen_window(&self) -> Duration {
        Duration::from_secs(self.reopen_window_secs)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(key) {
        Some(raw) => raw.parse::<T>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sqlalchemy_driver_prefixes() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u:p@db/readings".to_string()),
            "postgresql://u:p@db/readings"
        );
        assert_eq!(
            normalize_database_url("postgres://db/readings".to_string()),
            "postgres://db/readings"
        );
    }

    #[test]
    fn parses_backend_and_policy_names() {
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("dynamo".parse::<StorageBackend>().is_err());
        assert_eq!(" RSSI ".parse::<ArbitrationPolicy>().unwrap(), ArbitrationPolicy::Rssi);
        assert!("latest".parse::<ArbitrationPolicy>().is_err());
    }

    #[test]
    fn reopen_window_is_bounded() {
        assert_eq!(check_reopen_window(3, "w").unwrap(), 3);
        assert_eq!(check_reopen_window(86_400, "w").unwrap(), 86_400);
        let err = check_reopen_window(10_000_000_000_000, "INGEST_REOPEN_WINDOW_SECS").unwrap_err();
        assert!(err.to_string().contains("INGEST_REOPEN_WINDOW_SECS"));
    }

    #[test]
    fn setup_file_parses_partial_overrides() {
        let overrides = parse_setup_config(
            r#"{"mqtt_host":" broker.local ","reopen_window_secs":5,"arbitration_policy":"rssi"}"#
                .to_string(),
            std::path::Path::new("config.json"),
        )
        .unwrap();
        assert_eq!(overrides.mqtt_host.as_deref(), Some(" broker.local "));
        assert_eq!(overrides.reopen_window_secs, Some(5));
        assert!(overrides.database_url.is_none());
        assert!(parse_setup_config("not json".to_string(), std::path::Path::new("x")).is_none());
    }
}
