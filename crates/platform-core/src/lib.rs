use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub observability: ObservabilitySection,
    pub database: DatabaseSection,
    pub plaza: PlazaSection,
    pub battle_sync: BattleSyncSection,
    pub credit: CreditSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// In-memory stores are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    pub mode: BackoffMode,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlazaSection {
    pub keepalive_secs: u64,
    pub reconnect: ReconnectSection,
    pub wait_online_poll_ms: u64,
    pub probe_login_timeout_ms: u64,
}

impl PlazaSection {
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn wait_online_poll(&self) -> Duration {
        Duration::from_millis(self.wait_online_poll_ms)
    }

    #[must_use]
    pub fn probe_login_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_login_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleSyncSection {
    pub enabled: bool,
    pub endpoint: String,
    pub poll_interval_secs: u64,
    pub initial_lookback_secs: u64,
    pub lookback_secs: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditSection {
    pub fallback_ceiling: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    observability: Option<PartialObservabilitySection>,
    database: Option<PartialDatabaseSection>,
    plaza: Option<PartialPlazaSection>,
    battle_sync: Option<PartialBattleSyncSection>,
    credit: Option<PartialCreditSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialReconnectSection {
    mode: Option<BackoffMode>,
    max_retries: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialPlazaSection {
    keepalive_secs: Option<u64>,
    reconnect: Option<PartialReconnectSection>,
    wait_online_poll_ms: Option<u64>,
    probe_login_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialBattleSyncSection {
    enabled: Option<bool>,
    endpoint: Option<String>,
    poll_interval_secs: Option<u64>,
    initial_lookback_secs: Option<u64>,
    lookback_secs: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialCreditSection {
    fallback_ceiling: Option<i64>,
}

macro_rules! merge {
    ($target:expr, $value:expr) => {
        if let Some(value) = $value {
            $target = value;
        }
    };
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "plaza-gate".to_string(),
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
            database: DatabaseSection {
                url: None,
                max_connections: 10,
            },
            plaza: PlazaSection {
                keepalive_secs: 30,
                reconnect: ReconnectSection {
                    mode: BackoffMode::Exponential,
                    max_retries: 10,
                    base_backoff_ms: 500,
                    max_backoff_ms: 30_000,
                },
                wait_online_poll_ms: 100,
                probe_login_timeout_ms: 10_000,
            },
            battle_sync: BattleSyncSection {
                enabled: true,
                endpoint: "http://127.0.0.1:8800/api/battles".to_string(),
                poll_interval_secs: 5,
                initial_lookback_secs: 3_600,
                lookback_secs: 300,
                request_timeout_ms: 5_000,
            },
            credit: CreditSection {
                fallback_ceiling: 99_999_999,
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("PLAZA_GATE__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = (!url.trim().is_empty()).then_some(url);
        }
        if let Ok(endpoint) = env::var("PLAZA_GATE__BATTLE_SYNC_ENDPOINT") {
            self.battle_sync.endpoint = endpoint;
        }
        if let Ok(raw) = env::var("PLAZA_GATE__BATTLE_SYNC_ENABLED") {
            self.battle_sync.enabled = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PLAZA_GATE__BATTLE_SYNC_ENABLED",
                value: raw.clone(),
            })?;
        }
        if let Ok(raw) = env::var("PLAZA_GATE__KEEPALIVE_SECS") {
            self.plaza.keepalive_secs = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PLAZA_GATE__KEEPALIVE_SECS",
                value: raw.clone(),
            })?;
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            merge!(self.app.env, app.env);
            merge!(self.app.service_name, app.service_name);
        }
        if let Some(observability) = partial.observability {
            merge!(self.observability.log_filter, observability.log_filter);
        }
        if let Some(database) = partial.database {
            if database.url.is_some() {
                self.database.url = database.url;
            }
            merge!(self.database.max_connections, database.max_connections);
        }
        if let Some(plaza) = partial.plaza {
            merge!(self.plaza.keepalive_secs, plaza.keepalive_secs);
            merge!(self.plaza.wait_online_poll_ms, plaza.wait_online_poll_ms);
            merge!(self.plaza.probe_login_timeout_ms, plaza.probe_login_timeout_ms);
            if let Some(reconnect) = plaza.reconnect {
                merge!(self.plaza.reconnect.mode, reconnect.mode);
                merge!(self.plaza.reconnect.max_retries, reconnect.max_retries);
                merge!(self.plaza.reconnect.base_backoff_ms, reconnect.base_backoff_ms);
                merge!(self.plaza.reconnect.max_backoff_ms, reconnect.max_backoff_ms);
            }
        }
        if let Some(sync) = partial.battle_sync {
            merge!(self.battle_sync.enabled, sync.enabled);
            merge!(self.battle_sync.endpoint, sync.endpoint);
            merge!(self.battle_sync.poll_interval_secs, sync.poll_interval_secs);
            merge!(self.battle_sync.initial_lookback_secs, sync.initial_lookback_secs);
            merge!(self.battle_sync.lookback_secs, sync.lookback_secs);
            merge!(self.battle_sync.request_timeout_ms, sync.request_timeout_ms);
        }
        if let Some(credit) = partial.credit {
            merge!(self.credit.fallback_ceiling, credit.fallback_ceiling);
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("PLAZA_GATE_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_config_dir(tag: &str) -> PathBuf {
        let base_dir = std::env::temp_dir().join(format!(
            "platform-core-{tag}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        std::fs::create_dir_all(&base_dir).expect("create temp dir");
        base_dir
    }

    #[test]
    fn config_loader_merges_default_and_env_files() {
        let base_dir = temp_config_dir("merge");
        std::fs::write(
            base_dir.join("default.toml"),
            r#"
[app]
service_name = "default-service"

[plaza]
keepalive_secs = 20

[plaza.reconnect]
mode = "fixed"
max_retries = 3

[observability]
log_filter = "info"
"#,
        )
        .expect("write default.toml");
        std::fs::write(
            base_dir.join("dev.toml"),
            r#"
[app]
service_name = "dev-service"

[battle_sync]
poll_interval_secs = 2

[credit]
fallback_ceiling = 5000

[observability]
log_filter = "debug"
"#,
        )
        .expect("write dev.toml");

        let config = AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Dev).expect("load config");
        let expected_log_filter = std::env::var("OBSERVABILITY__LOG_FILTER")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "debug".to_string());
        assert_eq!(config.app.env, AppEnv::Dev);
        assert_eq!(config.app.service_name, "dev-service");
        assert_eq!(config.plaza.reconnect.mode, BackoffMode::Fixed);
        assert_eq!(config.plaza.reconnect.max_retries, 3);
        assert_eq!(config.plaza.reconnect.max_backoff_ms, 30_000);
        assert_eq!(config.battle_sync.poll_interval_secs, 2);
        assert_eq!(config.battle_sync.initial_lookback_secs, 3_600);
        assert_eq!(config.credit.fallback_ceiling, 5000);
        assert_eq!(config.observability.log_filter, expected_log_filter);
    }

    #[test]
    fn missing_env_file_falls_back_to_default_only() {
        let base_dir = temp_config_dir("default-only");
        std::fs::write(
            base_dir.join("default.toml"),
            r#"
[database]
max_connections = 4
"#,
        )
        .expect("write default.toml");

        let config =
            AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Prod).expect("load config");
        assert_eq!(config.app.env, AppEnv::Prod);
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.plaza.wait_online_poll(), Duration::from_millis(100));
    }

    #[test]
    fn app_env_parses_aliases() {
        assert_eq!("Production".parse::<AppEnv>().expect("parse"), AppEnv::Prod);
        assert!("staging".parse::<AppEnv>().is_err());
    }
}
