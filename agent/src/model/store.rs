//! Resident model set for this worker.
//!
//! Models are loaded on request from the manager, kept until evicted by the
//! resident cap (least recently used first) or by the idle sweep, and looked
//! up on every execute.

use crate::executor::{ExecutorError, LoadedModel, ModelExecutor};
use infermesh_common::{ModelRef, ModelVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("model load failed: {0}")]
    Load(#[from] ExecutorError),

    #[error("model store unavailable")]
    Unavailable,
}

/// A loaded model handle plus the version it was loaded from.
#[derive(Clone)]
pub struct ResidentModel {
    pub version: Arc<ModelVersion>,
    pub handle: Arc<dyn LoadedModel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub already_loaded: bool,
    pub evicted: Vec<ModelRef>,
}

/// Per-model counters, reported by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: ModelRef,
    pub inference_count: u64,
    pub total_execution_ms: u64,
    pub idle_ms: u64,
}

struct Entry {
    model: ResidentModel,
    last_used: Instant,
    inference_count: u64,
    total_execution_ms: u64,
}

impl Entry {
    fn stats(&self, model: &ModelRef, now: Instant) -> ModelStats {
        ModelStats {
            model: model.clone(),
            inference_count: self.inference_count,
            total_execution_ms: self.total_execution_ms,
            idle_ms: now.duration_since(self.last_used).as_millis() as u64,
        }
    }
}

pub struct ModelStore {
    executor: Arc<dyn ModelExecutor>,
    max_resident: usize,
    models: Mutex<HashMap<ModelRef, Entry>>,
}

impl ModelStore {
    pub fn new(executor: Arc<dyn ModelExecutor>, max_resident: usize) -> Self {
        Self {
            executor,
            max_resident: max_resident.max(1),
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Load a model version, evicting the least recently used models beyond
    /// the resident cap. Loading an already resident version only touches it.
    pub fn load(&self, version: ModelVersion) -> Result<LoadOutcome, StoreError> {
        let model_ref = version.model_ref();

        if self.touch(&model_ref)? {
            return Ok(LoadOutcome {
                already_loaded: true,
                evicted: Vec::new(),
            });
        }

        // Executor work happens outside the lock.
        let handle = self.executor.load(&version)?;
        let resident = ResidentModel {
            version: Arc::new(version),
            handle,
        };

        let mut models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        if models.contains_key(&model_ref) {
            // A concurrent load of the same version won.
            return Ok(LoadOutcome {
                already_loaded: true,
                evicted: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        while models.len() >= self.max_resident {
            let Some(oldest) = models
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(model, _)| model.clone())
            else {
                break;
            };
            models.remove(&oldest);
            evicted.push(oldest);
        }

        models.insert(
            model_ref.clone(),
            Entry {
                model: resident,
                last_used: Instant::now(),
                inference_count: 0,
                total_execution_ms: 0,
            },
        );
        drop(models);

        info!(model = %model_ref, evicted = evicted.len(), "Model loaded");
        Ok(LoadOutcome {
            already_loaded: false,
            evicted,
        })
    }

    fn touch(&self, model: &ModelRef) -> Result<bool, StoreError> {
        let mut models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(match models.get_mut(model) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        })
    }

    /// Resident model for `model`, marking it used.
    pub fn get(&self, model: &ModelRef) -> Result<Option<ResidentModel>, StoreError> {
        let mut models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(models.get_mut(model).map(|entry| {
            entry.last_used = Instant::now();
            entry.model.clone()
        }))
    }

    /// Drop a model. In-flight executions keep their own handle and finish.
    pub fn unload(&self, model: &ModelRef) -> Result<bool, StoreError> {
        let removed = self
            .models
            .lock()
            .map_err(|_| StoreError::Unavailable)?
            .remove(model)
            .is_some();
        if removed {
            info!(model = %model, "Model unloaded");
        }
        Ok(removed)
    }

    /// Unload every model unused for at least `idle`.
    pub fn unload_idle(&self, idle: Duration) -> Result<Vec<ModelRef>, StoreError> {
        let now = Instant::now();
        let mut models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        let idle_models: Vec<ModelRef> = models
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) >= idle)
            .map(|(model, _)| model.clone())
            .collect();
        for model in &idle_models {
            models.remove(model);
            info!(model = %model, idle_secs = idle.as_secs(), "Idle model unloaded");
        }
        Ok(idle_models)
    }

    /// Loaded model refs, sorted.
    pub fn loaded(&self) -> Result<Vec<ModelRef>, StoreError> {
        let models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        let mut refs: Vec<ModelRef> = models.keys().cloned().collect();
        refs.sort();
        Ok(refs)
    }

    /// Count a completed execution against the model, if still resident.
    pub fn record_execution(&self, model: &ModelRef, elapsed: Duration) {
        if let Ok(mut models) = self.models.lock() {
            if let Some(entry) = models.get_mut(model) {
                entry.inference_count += 1;
                entry.total_execution_ms += elapsed.as_millis() as u64;
            }
        }
    }

    pub fn stats(&self) -> Result<Vec<ModelStats>, StoreError> {
        let now = Instant::now();
        let models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        let mut stats: Vec<ModelStats> = models
            .iter()
            .map(|(model, entry)| entry.stats(model, now))
            .collect();
        stats.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(stats)
    }

    /// Version and counters of a resident model. Does not count as a use.
    pub fn info(
        &self,
        model: &ModelRef,
    ) -> Result<Option<(Arc<ModelVersion>, ModelStats)>, StoreError> {
        let now = Instant::now();
        let models = self.models.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(models
            .get(model)
            .map(|entry| (entry.model.version.clone(), entry.stats(model, now))))
    }
}
