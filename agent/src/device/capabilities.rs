use infermesh_common::{AcceleratorClass, WorkerCapabilities};
use sysinfo::System;

/// Host hardware as seen by `sysinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub gpu_present: bool,
    pub os: String,
    pub arch: String,
}

impl HostInfo {
    /// Detect current host hardware.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_cores = sys.cpus().len() as u32;
        let ram_mb = sys.total_memory() / 1_048_576; // bytes to MB

        Self {
            cpu_cores,
            ram_mb,
            gpu_present: Self::detect_gpu(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Basic GPU detection: a CUDA device node, or Metal on macOS.
    fn detect_gpu() -> bool {
        #[cfg(target_os = "macos")]
        {
            true
        }

        #[cfg(not(target_os = "macos"))]
        {
            std::path::Path::new("/dev/nvidia0").exists()
        }
    }

    /// Capabilities to advertise in heartbeats.
    ///
    /// `capacity == 0` means one concurrent session per core. An explicit
    /// `accelerator` wins over detection.
    pub fn capabilities(
        &self,
        capacity: u32,
        accelerator: Option<AcceleratorClass>,
    ) -> WorkerCapabilities {
        let accelerator = accelerator.unwrap_or(if self.gpu_present {
            AcceleratorClass::Gpu
        } else {
            AcceleratorClass::Cpu
        });
        let max_concurrent_sessions = if capacity == 0 {
            self.cpu_cores.max(1)
        } else {
            capacity
        };

        WorkerCapabilities {
            accelerator,
            max_concurrent_sessions,
            cpu_cores: self.cpu_cores,
            ram_mb: self.ram_mb,
            os: self.os.clone(),
            arch: self.arch.clone(),
        }
    }
}

/// Detect the host and derive its advertised capabilities.
pub fn detect_capabilities(
    capacity: u32,
    accelerator: Option<AcceleratorClass>,
) -> WorkerCapabilities {
    HostInfo::detect().capabilities(capacity, accelerator)
}
