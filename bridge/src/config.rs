use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};
use crate::retry::RetryPolicy;

const CONFIG_VERSION: u16 = 1;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Environment types selecting configuration defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }

    fn default_log_level(&self) -> &'static str {
        match self {
            Environment::Production => "info",
            Environment::Development => "debug",
            Environment::Test => "warn",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendConfig {
    pub lightning_endpoint: Option<String>,
    pub spark_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub auto_lock_minutes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        let clamped = self.auto_lock_minutes.max(1) as u64;
        Duration::from_secs(clamped.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    pub environment: Environment,
    pub log_level: String,
    pub retry: RetryPolicy,
    pub transport: TransportConfig,
    pub default_chain_id: u64,
    pub backends: BackendConfig,
    pub session: SessionConfig,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl BridgeConfig {
    pub fn new(environment: Environment) -> Self {
        let session = match environment {
            Environment::Test => SessionConfig {
                auto_lock_minutes: 2,
            },
            _ => SessionConfig::default(),
        };
        Self {
            environment,
            log_level: environment.default_log_level().to_string(),
            retry: RetryPolicy::default(),
            transport: TransportConfig::default(),
            default_chain_id: 1,
            backends: BackendConfig::default(),
            session,
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }

    /// Defaults for the environment named by `BRIDGE_ENVIRONMENT`, overlaid with env vars.
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::new(environment_from_env());
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(BridgeError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(BridgeError::ValidationError(
                "transport.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> BridgeResult<()> {
        for (env_var, value) in read_env_overrides() {
            match env_var {
                "BRIDGE_LOG_LEVEL" => self.log_level = value,
                "BRIDGE_REQUEST_TIMEOUT_MS" => {
                    self.transport.request_timeout_ms = parse_u64_value(&value, env_var)?
                }
                "BRIDGE_RETRY_MAX_ATTEMPTS" => {
                    self.retry.max_attempts = parse_u64_value(&value, env_var)?
                        .try_into()
                        .map_err(|_| {
                            BridgeError::ValidationError(format!("{} is too large", env_var))
                        })?
                }
                "BRIDGE_RETRY_BACKOFF_MS" => {
                    self.retry.backoff_ms = parse_u64_value(&value, env_var)?
                }
                "BRIDGE_DEFAULT_CHAIN_ID" => {
                    self.default_chain_id = crate::network::parse_chain_id(&value)?
                }
                "BRIDGE_LIGHTNING_ENDPOINT" => self.backends.lightning_endpoint = Some(value),
                "BRIDGE_SPARK_ENDPOINT" => self.backends.spark_endpoint = Some(value),
                _ => {}
            }
            log::debug!("Loaded configuration from environment variable {}", env_var);
        }
        Ok(())
    }
}

fn environment_from_env() -> Environment {
    std::env::var("BRIDGE_ENVIRONMENT")
        .map(|raw| Environment::parse(&raw))
        .unwrap_or(Environment::Development)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(Environment::Development)
    }
}

const ENV_OVERRIDES: [&str; 7] = [
    "BRIDGE_LOG_LEVEL",
    "BRIDGE_REQUEST_TIMEOUT_MS",
    "BRIDGE_RETRY_MAX_ATTEMPTS",
    "BRIDGE_RETRY_BACKOFF_MS",
    "BRIDGE_DEFAULT_CHAIN_ID",
    "BRIDGE_LIGHTNING_ENDPOINT",
    "BRIDGE_SPARK_ENDPOINT",
];

fn read_env_overrides() -> Vec<(&'static str, String)> {
    let mut overrides = Vec::new();
    for env_var in ENV_OVERRIDES {
        let Ok(value) = std::env::var(env_var) else {
            continue;
        };
        if value.trim().is_empty() {
            log::warn!("Environment variable {} is empty", env_var);
            continue;
        }
        if value.chars().any(|c| c.is_control()) {
            log::warn!(
                "Environment variable {} contains control characters, ignoring",
                env_var
            );
            continue;
        }
        overrides.push((env_var, value.trim().to_string()));
    }
    overrides
}

fn parse_u64_value(value: &str, key: &str) -> BridgeResult<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        BridgeError::ValidationError(format!(
            "Invalid numeric value '{}' for key '{}'",
            value, key
        ))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: BridgeConfig,
    modified_at_unix: i64,
}

/// Handles persistence of bridge configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(&self, environment: Environment) -> BridgeResult<BridgeConfig> {
        if !self.path.exists() {
            let config = BridgeConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(BridgeError::ValidationError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(BridgeError::ValidationError(
                "Config integrity verification failed".to_string(),
            ));
        }

        Ok(envelope.payload)
    }

    pub fn save(&self, config: &BridgeConfig) -> BridgeResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_err(|e| BridgeError::StorageError(e.to_string()))?
                .as_secs() as i64,
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    pub fn update<F>(&self, environment: Environment, updater: F) -> BridgeResult<BridgeConfig>
    where
        F: FnOnce(&mut BridgeConfig) -> BridgeResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        config.validate()?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &BridgeConfig) -> BridgeResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    hasher.update(&serde_json::to_vec(config)?);
    Ok(*hasher.finalize().as_bytes())
}

/// Process-wide configuration, resolved once by the host at startup.
static BRIDGE_CONFIG: OnceCell<BridgeConfig> = OnceCell::new();

/// Resolve the configuration from `path` (if given) and the environment, exactly once.
pub fn init_config(path: Option<&Path>) -> BridgeResult<&'static BridgeConfig> {
    BRIDGE_CONFIG.get_or_try_init(|| {
        let config = match path {
            Some(path) => {
                let mut config = ConfigStore::new(path).load_or_default(environment_from_env())?;
                config.apply_env_overrides()?;
                config
            }
            None => BridgeConfig::from_env()?,
        };
        config.validate()?;
        log::info!(
            "Bridge configuration initialized for {:?} environment",
            config.environment
        );
        Ok(config)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_load_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("bridge.config"));

        let mut config = BridgeConfig::new(Environment::Development);
        config.transport.request_timeout_ms = 5_000;
        config.backends.lightning_endpoint = Some("http://localhost:9735".into());
        store.save(&config).unwrap();

        let loaded = store.load_or_default(Environment::Development).unwrap();
        assert_eq!(loaded.transport.request_timeout_ms, 5_000);
        assert_eq!(
            loaded.backends.lightning_endpoint.as_deref(),
            Some("http://localhost:9735")
        );
    }

    #[test]
    fn tampered_config_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bridge.config");
        let store = ConfigStore::new(&path);
        store.save(&BridgeConfig::new(Environment::Test)).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("\"default_chain_id\": 1", "\"default_chain_id\": 5");
        assert_ne!(raw, tampered);
        fs::write(&path, tampered).unwrap();

        let result = store.load_or_default(Environment::Test);
        assert!(matches!(result, Err(BridgeError::ValidationError(_))));
    }

    #[test]
    fn update_rejects_invalid_values() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("bridge.config"));
        let result = store.update(Environment::Development, |config| {
            config.retry.max_attempts = 0;
            Ok(())
        });
        assert!(matches!(result, Err(BridgeError::ValidationError(_))));
    }

    #[test]
    fn from_env_overlays_variables_on_environment_defaults() {
        std::env::set_var("BRIDGE_ENVIRONMENT", "test");
        std::env::set_var("BRIDGE_RETRY_BACKOFF_MS", "250");
        let config = BridgeConfig::from_env().unwrap();
        std::env::remove_var("BRIDGE_ENVIRONMENT");
        std::env::remove_var("BRIDGE_RETRY_BACKOFF_MS");

        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.session.auto_lock_minutes, 2);
        assert_eq!(config.retry.backoff_ms, 250);
    }

    #[test]
    fn environment_defaults_differ() {
        assert_eq!(BridgeConfig::new(Environment::Production).log_level, "info");
        assert_eq!(BridgeConfig::new(Environment::Test).session.auto_lock_minutes, 2);
        assert_eq!(Environment::parse("PROD"), Environment::Production);
        assert_eq!(BridgeConfig::default().retry, RetryPolicy::default());
    }
}
