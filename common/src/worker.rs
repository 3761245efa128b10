use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute class a worker offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorClass {
    #[default]
    Cpu,
    Gpu,
}

impl fmt::Display for AcceleratorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorClass::Cpu => f.write_str("cpu"),
            AcceleratorClass::Gpu => f.write_str("gpu"),
        }
    }
}

/// Capabilities a worker declares with every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub accelerator: AcceleratorClass,
    /// Concurrent session capacity.
    pub max_concurrent_sessions: u32,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram_mb: u64,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

impl WorkerCapabilities {
    pub fn cpu(max_concurrent_sessions: u32) -> Self {
        Self {
            accelerator: AcceleratorClass::Cpu,
            max_concurrent_sessions,
            cpu_cores: 0,
            ram_mb: 0,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Load status of a worker as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Overloaded,
    Stale,
}

impl WorkerStatus {
    /// Busy at or above 80% of capacity, overloaded at capacity.
    pub fn classify(active: u32, capacity: u32, fresh: bool) -> Self {
        if !fresh {
            return WorkerStatus::Stale;
        }
        if capacity == 0 || active >= capacity {
            return WorkerStatus::Overloaded;
        }
        if active == 0 {
            WorkerStatus::Idle
        } else if active * 5 >= capacity * 4 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }
}
