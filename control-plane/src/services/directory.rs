//! Live worker membership.
//!
//! Workers appear on their first heartbeat and are refreshed by every
//! subsequent one. A worker that stops heartbeating is first excluded from
//! candidate lists (after `heartbeat_timeout`) and later removed entirely by
//! the sweeper (after `removal_grace`).

use crate::config::WorkersConfig;
use infermesh_common::wire::{HeartbeatRequest, WorkerSummary};
use infermesh_common::{AcceleratorClass, ModelRef, WorkerCapabilities, WorkerStatus};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, TryLockError};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Worker {0} not found")]
    NotFound(String),

    #[error("Invalid heartbeat: {0}")]
    InvalidHeartbeat(String),

    /// A writer holds the table; clears once it finishes.
    #[error("Worker directory busy")]
    Busy,

    /// The lock was poisoned by a panicking writer. Permanent.
    #[error("Worker directory unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Directory entry for one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub address: String,
    pub capabilities: WorkerCapabilities,
    pub loaded_models: BTreeSet<ModelRef>,
    /// Never exceeds `capabilities.max_concurrent_sessions`.
    pub active_sessions: u32,
    pub last_heartbeat: Instant,
    pub last_heartbeat_wall: OffsetDateTime,
    pub registered_at: OffsetDateTime,
}

impl WorkerRecord {
    pub fn capacity(&self) -> u32 {
        self.capabilities.max_concurrent_sessions
    }

    pub fn has_capacity(&self) -> bool {
        self.active_sessions < self.capacity()
    }

    pub fn hosts(&self, model: &ModelRef) -> bool {
        self.loaded_models.contains(model)
    }

    fn load_ratio(&self) -> f64 {
        if self.capacity() == 0 {
            return f64::INFINITY;
        }
        self.active_sessions as f64 / self.capacity() as f64
    }

    fn is_fresh(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) <= timeout
    }

    fn summary(&self, fresh: bool) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.worker_id.clone(),
            address: self.address.clone(),
            capabilities: self.capabilities.clone(),
            loaded_models: self.loaded_models.iter().cloned().collect(),
            active_sessions: self.active_sessions,
            status: WorkerStatus::classify(self.active_sessions, self.capacity(), fresh),
            last_heartbeat: self.last_heartbeat_wall,
            registered_at: self.registered_at,
        }
    }
}

/// Workers eligible for an assignment.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    /// Fresh workers hosting the model with free capacity, best first.
    pub warm: Vec<WorkerRecord>,
    /// Least-loaded fresh worker that could load the model. Only set when
    /// `warm` is empty.
    pub cold: Option<WorkerRecord>,
}

/// Least loaded first, then most recent heartbeat, then id for determinism.
fn by_preference(a: &WorkerRecord, b: &WorkerRecord) -> Ordering {
    a.load_ratio()
        .partial_cmp(&b.load_ratio())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

pub struct WorkerDirectory {
    config: WorkersConfig,
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerDirectory {
    pub fn new(config: WorkersConfig) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_table(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WorkerRecord>> {
        self.workers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn config(&self) -> &WorkersConfig {
        &self.config
    }

    /// Apply a heartbeat, creating the record if needed.
    ///
    /// The reported active count replaces the manager's own count, clamped to
    /// the declared capacity. Returns true when the worker was newly registered.
    pub fn register_or_update(&self, heartbeat: HeartbeatRequest) -> Result<bool> {
        if heartbeat.worker_id.trim().is_empty() {
            return Err(DirectoryError::InvalidHeartbeat("worker_id cannot be empty".into()));
        }
        if heartbeat.address.trim().is_empty() {
            return Err(DirectoryError::InvalidHeartbeat("address cannot be empty".into()));
        }

        let now = Instant::now();
        let wall = OffsetDateTime::now_utc();
        let capacity = heartbeat.capabilities.max_concurrent_sessions;
        let active = heartbeat.active_sessions.min(capacity);
        if heartbeat.active_sessions > capacity {
            warn!(
                worker_id = %heartbeat.worker_id,
                reported = heartbeat.active_sessions,
                capacity,
                "Worker reported more sessions than its capacity"
            );
        }

        let mut workers = self.workers.write().map_err(|_| DirectoryError::Unavailable)?;

        match workers.get_mut(&heartbeat.worker_id) {
            Some(record) => {
                record.address = heartbeat.address;
                record.capabilities = heartbeat.capabilities;
                record.loaded_models = heartbeat.loaded_models.into_iter().collect();
                record.active_sessions = active;
                record.last_heartbeat = now;
                record.last_heartbeat_wall = wall;
                debug!(worker_id = %record.worker_id, active, "Heartbeat");
                Ok(false)
            }
            None => {
                info!(
                    worker_id = %heartbeat.worker_id,
                    address = %heartbeat.address,
                    capacity,
                    accelerator = %heartbeat.capabilities.accelerator,
                    "Worker registered"
                );
                workers.insert(
                    heartbeat.worker_id.clone(),
                    WorkerRecord {
                        worker_id: heartbeat.worker_id,
                        address: heartbeat.address,
                        capabilities: heartbeat.capabilities,
                        loaded_models: heartbeat.loaded_models.into_iter().collect(),
                        active_sessions: active,
                        last_heartbeat: now,
                        last_heartbeat_wall: wall,
                        registered_at: wall,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Fresh workers able to serve `model`, plus a cold-start fallback.
    pub fn list_candidates(
        &self,
        model: &ModelRef,
        accelerator: Option<AcceleratorClass>,
    ) -> Result<Candidates> {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout();
        // Async callers must not park a runtime thread behind the sweep.
        let workers = match self.workers.try_read() {
            Ok(workers) => workers,
            Err(TryLockError::WouldBlock) => return Err(DirectoryError::Busy),
            Err(TryLockError::Poisoned(_)) => return Err(DirectoryError::Unavailable),
        };

        let eligible = |w: &&WorkerRecord| {
            w.is_fresh(now, timeout)
                && w.has_capacity()
                && accelerator.map_or(true, |a| w.capabilities.accelerator == a)
        };

        let mut warm: Vec<WorkerRecord> = workers
            .values()
            .filter(eligible)
            .filter(|w| w.hosts(model))
            .cloned()
            .collect();
        warm.sort_by(by_preference);

        let cold = if warm.is_empty() {
            workers.values().filter(eligible).min_by(|a, b| by_preference(a, b)).cloned()
        } else {
            None
        };

        Ok(Candidates { warm, cold })
    }

    /// Atomically take one session slot on a worker.
    ///
    /// Returns `None` if the worker is gone, stale or full. The returned guard
    /// gives the slot back when dropped.
    pub fn try_reserve(self: &Arc<Self>, worker_id: &str) -> Result<Option<SlotReservation>> {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout();
        let mut workers = self.workers.write().map_err(|_| DirectoryError::Unavailable)?;

        let Some(record) = workers.get_mut(worker_id) else {
            return Ok(None);
        };
        if !record.is_fresh(now, timeout) || !record.has_capacity() {
            return Ok(None);
        }

        record.active_sessions += 1;
        debug!(
            worker_id,
            active = record.active_sessions,
            capacity = record.capacity(),
            "Slot reserved"
        );

        Ok(Some(SlotReservation {
            directory: Arc::clone(self),
            worker_id: worker_id.to_string(),
        }))
    }

    fn release(&self, worker_id: &str) {
        match self.workers.write() {
            Ok(mut workers) => {
                if let Some(record) = workers.get_mut(worker_id) {
                    record.active_sessions = record.active_sessions.saturating_sub(1);
                    debug!(worker_id, active = record.active_sessions, "Slot released");
                }
            }
            Err(_) => warn!(worker_id, "Directory lock poisoned, slot not released"),
        }
    }

    /// Record a cold-start load ahead of the worker's next heartbeat.
    pub fn mark_loaded(&self, worker_id: &str, model: &ModelRef, evicted: &[ModelRef]) -> Result<()> {
        let mut workers = self.workers.write().map_err(|_| DirectoryError::Unavailable)?;
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| DirectoryError::NotFound(worker_id.to_string()))?;
        for gone in evicted {
            record.loaded_models.remove(gone);
        }
        record.loaded_models.insert(model.clone());
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let workers = self.workers.read().map_err(|_| DirectoryError::Unavailable)?;
        Ok(workers.get(worker_id).cloned())
    }

    pub fn contains(&self, worker_id: &str) -> Result<bool> {
        let workers = self.workers.read().map_err(|_| DirectoryError::Unavailable)?;
        Ok(workers.contains_key(worker_id))
    }

    pub fn unregister(&self, worker_id: &str) -> Result<WorkerRecord> {
        let mut workers = self.workers.write().map_err(|_| DirectoryError::Unavailable)?;
        let record = workers
            .remove(worker_id)
            .ok_or_else(|| DirectoryError::NotFound(worker_id.to_string()))?;
        info!(worker_id, "Worker unregistered");
        Ok(record)
    }

    /// Snapshot of every known worker, sorted by id.
    pub fn list(&self) -> Result<Vec<WorkerSummary>> {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout();
        let workers = self.workers.read().map_err(|_| DirectoryError::Unavailable)?;

        let mut summaries: Vec<WorkerSummary> = workers
            .values()
            .map(|w| w.summary(w.is_fresh(now, timeout)))
            .collect();
        summaries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(summaries)
    }

    /// Remove workers silent for longer than the removal grace period.
    pub fn sweep(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let grace = self.config.removal_grace();
        let mut workers = self.workers.write().map_err(|_| DirectoryError::Unavailable)?;

        let expired: Vec<String> = workers
            .values()
            .filter(|w| now.saturating_duration_since(w.last_heartbeat) > grace)
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &expired {
            workers.remove(worker_id);
            info!(worker_id = %worker_id, "Removed silent worker");
        }

        Ok(expired)
    }
}

/// One reserved session slot. Dropping it returns the slot.
pub struct SlotReservation {
    directory: Arc<WorkerDirectory>,
    worker_id: String,
}

impl SlotReservation {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl std::fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReservation")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.directory.release(&self.worker_id);
    }
}
