use crate::services::session_authority::SessionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Manager configuration, loaded from `~/.infermesh/manager.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub server: ServerConfig,
    pub workers: WorkersConfig,
    pub sessions: SessionsConfig,
    pub dispatch: DispatchConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

/// Heartbeat and membership timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub heartbeat_interval_ms: u64,
    /// A worker silent for longer than this is excluded from candidates.
    pub heartbeat_timeout_ms: u64,
    /// A worker silent for longer than this is removed from the directory.
    pub removal_grace_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub ttl_ms: u64,
    pub policy: SessionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Extra candidate lookups while the worker directory is busy.
    pub directory_retries: u32,
    pub retry_backoff_ms: u64,
    /// Allow asking an idle worker to load a model nobody hosts.
    pub cold_start: bool,
    pub cold_start_timeout_ms: u64,
    /// Used when an assign request carries no deadline.
    pub default_deadline_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject assign requests without a valid API key.
    pub require_api_key: bool,
    /// Key with every permission, for bootstrapping.
    pub admin_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `~/.infermesh/manager.db`.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            removal_grace_ms: 60_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            policy: SessionPolicy::SingleUse,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            directory_retries: 3,
            retry_backoff_ms: 25,
            cold_start: true,
            cold_start_timeout_ms: 30_000,
            default_deadline_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_dir: None,
        }
    }
}

impl WorkersConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl DispatchConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cold_start_timeout(&self) -> Duration {
        Duration::from_millis(self.cold_start_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

impl ManagerConfig {
    /// Default configuration file path: `~/.infermesh/manager.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Cannot determine home directory".into()))?;
        Ok(home.join(".infermesh").join("manager.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: ManagerConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let workers = &self.workers;
        if workers.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "workers.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if workers.heartbeat_timeout_ms <= workers.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "workers.heartbeat_timeout_ms must exceed the heartbeat interval".into(),
            ));
        }
        if workers.removal_grace_ms < workers.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(
                "workers.removal_grace_ms must be at least the heartbeat timeout".into(),
            ));
        }
        if workers.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "workers.sweep_interval_ms must be positive".into(),
            ));
        }

        if self.sessions.ttl_ms == 0 {
            return Err(ConfigError::Invalid("sessions.ttl_ms must be positive".into()));
        }
        if let SessionPolicy::MultiUse { max_calls } = self.sessions.policy {
            if max_calls == 0 {
                return Err(ConfigError::Invalid(
                    "sessions.policy.max_calls must be at least 1".into(),
                ));
            }
        }

        if self.dispatch.default_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.default_deadline_ms must be positive".into(),
            ));
        }

        if let Some(key) = &self.auth.admin_api_key {
            if key.len() < 16 {
                return Err(ConfigError::Invalid(
                    "auth.admin_api_key must be at least 16 characters".into(),
                ));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "logging.level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string)?;
        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.workers.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(config.sessions.ttl(), Duration::from_secs(10));
        assert_eq!(config.sessions.policy, SessionPolicy::SingleUse);
        assert!(config.dispatch.cold_start);
        assert!(!config.auth.require_api_key);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let mut config = ManagerConfig::default();
        config.workers.heartbeat_timeout_ms = config.workers.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_use_needs_calls() {
        let mut config = ManagerConfig::default();
        config.sessions.policy = SessionPolicy::MultiUse { max_calls: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_admin_key_rejected() {
        let mut config = ManagerConfig::default();
        config.auth.admin_api_key = Some("short".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
            [sessions]
            ttl_ms = 2000
            policy = { mode = "multi_use", max_calls = 5 }
            "#,
        )
        .unwrap();

        assert_eq!(config.sessions.ttl_ms, 2000);
        assert_eq!(config.sessions.policy, SessionPolicy::MultiUse { max_calls: 5 });
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("manager.toml");

        let mut config = ManagerConfig::default();
        config.server.port = 9191;
        config.auth.admin_api_key = Some("admin-key-0123456789".into());
        config.save(&path).unwrap();

        let loaded = ManagerConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9191);
        assert_eq!(loaded.auth.admin_api_key.as_deref(), Some("admin-key-0123456789"));
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = ManagerConfig::load_or_default(&temp_dir.path().join("none.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
