use crate::errors::{AgentError, Result};
use infermesh_common::logging::default_state_dir;
use infermesh_common::AcceleratorClass;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Worker identity and settings, saved at `~/.infermesh/worker.toml`.
///
/// The `worker_id` is generated once by `init` and kept across restarts so
/// the manager sees the same worker after a reboot.
///
/// ```no_run
/// use agent::WorkerConfig;
///
/// let config = WorkerConfig::generate(
///     "http://localhost:8080".to_string(),
///     "http://10.0.0.7:9000".to_string(),
/// );
/// let path = WorkerConfig::default_path().unwrap();
/// config.save(&path).unwrap();
///
/// let loaded = WorkerConfig::load(&path).unwrap();
/// assert_eq!(config.worker_id, loaded.worker_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable worker identifier (UUID v4)
    pub worker_id: String,

    /// Socket address the worker API binds to
    pub listen_addr: String,

    /// Base URL clients and the manager use to reach this worker
    pub advertise_address: String,

    /// Manager API URL
    pub control_plane_url: String,

    /// Key presented to the manager, if it requires one
    pub api_key: Option<String>,

    /// Concurrent execution capacity; 0 means one per CPU core
    pub capacity: u32,

    /// Overrides the detected accelerator class
    pub accelerator: Option<AcceleratorClass>,

    pub heartbeat_interval_ms: u64,
    pub manager_timeout_ms: u64,
    pub default_deadline_ms: u64,

    /// Resident model cap; the least recently used model is evicted beyond it
    pub max_resident_models: usize,

    /// Unload models idle for this long; 0 disables
    pub idle_unload_secs: u64,

    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: Option<PathBuf>,
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

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            listen_addr: "0.0.0.0:9000".to_string(),
            advertise_address: "http://127.0.0.1:9000".to_string(),
            control_plane_url: "http://localhost:8080".to_string(),
            api_key: None,
            capacity: 0,
            accelerator: None,
            heartbeat_interval_ms: 5_000,
            manager_timeout_ms: 5_000,
            default_deadline_ms: 30_000,
            max_resident_models: 4,
            idle_unload_secs: 600,
            dedup_capacity: 10_000,
            dedup_ttl_secs: 300,
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// New configuration with a fresh worker identity.
    pub fn generate(control_plane_url: String, advertise_address: String) -> Self {
        Self {
            worker_id: Uuid::new_v4().to_string(),
            control_plane_url,
            advertise_address,
            ..Self::default()
        }
    }

    /// Default configuration file path: `~/.infermesh/worker.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_state_dir().join("worker.toml"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn manager_timeout(&self) -> Duration {
        Duration::from_millis(self.manager_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn idle_unload(&self) -> Option<Duration> {
        (self.idle_unload_secs > 0).then(|| Duration::from_secs(self.idle_unload_secs))
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(AgentError::Config(
                "worker_id is empty; run `init` first".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(AgentError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_resident_models == 0 {
            return Err(AgentError::Config(
                "max_resident_models must be positive".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(AgentError::Config("dedup_capacity must be positive".to_string()));
        }
        if !self.advertise_address.starts_with("http://")
            && !self.advertise_address.starts_with("https://")
        {
            return Err(AgentError::Config(format!(
                "advertise_address must be an http(s) URL, got {}",
                self.advertise_address
            )));
        }
        Ok(())
    }

    /// Save configuration to file.
    ///
    /// Creates parent directories if they don't exist and writes atomically
    /// through a temp file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Worker configuration saved");
        Ok(())
    }

    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: WorkerConfig = toml::from_str(&contents)?;

        tracing::debug!(
            path = %path.display(),
            worker_id = %config.worker_id,
            "Worker configuration loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_assigns_identity() {
        let a = WorkerConfig::generate("http://m:8080".into(), "http://w:9000".into());
        let b = WorkerConfig::generate("http://m:8080".into(), "http://w:9000".into());
        assert_ne!(a.worker_id, b.worker_id);
        assert!(Uuid::parse_str(&a.worker_id).is_ok());
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("worker.toml");

        let mut config = WorkerConfig::generate("http://m:8080".into(), "http://w:9000".into());
        config.capacity = 3;
        config.accelerator = Some(AcceleratorClass::Gpu);
        config.save(&path).unwrap();

        let loaded = WorkerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: WorkerConfig = toml::from_str("worker_id = \"w-1\"\ncapacity = 2\n").unwrap();
        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.capacity, 2);
        assert_eq!(config.max_resident_models, 4);
        assert_eq!(config.idle_unload(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_validation_failures() {
        assert!(WorkerConfig::default().validate().is_err());

        let mut config = WorkerConfig::generate("http://m".into(), "w:9000".into());
        assert!(config.validate().is_err());

        config.advertise_address = "http://w:9000".into();
        config.max_resident_models = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = WorkerConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(AgentError::Io(_))));
    }
}
