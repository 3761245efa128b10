//! Turns an assignment request into a worker, a reserved slot and a credential.

use crate::config::DispatchConfig;
use crate::services::api_keys::ClientIdentity;
use crate::services::directory::{Candidates, DirectoryError, SlotReservation, WorkerDirectory};
use crate::services::model_registry::{ModelRegistry, RegistryError};
use crate::services::placement::{ModelPlacement, PlacementError};
use crate::services::session_authority::{SessionAuthority, SessionCredential, SessionError};
use infermesh_common::{ModelRef, ModelVersion, Stage, VersionSelector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("No available worker for {0}")]
    NoAvailableWorker(ModelRef),

    #[error("Worker directory unavailable")]
    Unavailable,

    #[error("Assignment deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Cold start failed: {0}")]
    ColdStart(#[from] PlacementError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// A successful assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_id: String,
    pub worker_address: String,
    pub credential: SessionCredential,
    pub model: Arc<ModelVersion>,
    pub cold_start: bool,
}

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    directory: Arc<WorkerDirectory>,
    authority: Arc<SessionAuthority>,
    placement: Arc<dyn ModelPlacement>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        directory: Arc<WorkerDirectory>,
        authority: Arc<SessionAuthority>,
        placement: Arc<dyn ModelPlacement>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            authority,
            placement,
            config,
        }
    }

    /// Assign a worker for `model_id` to `client`, bounded by `deadline`.
    ///
    /// If the deadline passes (or the caller drops the future) before a
    /// credential is minted, any slot reserved along the way is released.
    #[instrument(skip(self, client), fields(client = %client.key_id))]
    pub async fn assign(
        &self,
        model_id: &str,
        selector: &VersionSelector,
        client: &ClientIdentity,
        stage_filter: Option<Stage>,
        deadline: Option<Duration>,
    ) -> Result<Assignment> {
        let deadline = deadline.unwrap_or_else(|| self.config.default_deadline());
        tokio::time::timeout(
            deadline,
            self.assign_inner(model_id, selector, client, stage_filter),
        )
        .await
        .map_err(|_| DispatchError::DeadlineExceeded(deadline))?
    }

    async fn assign_inner(
        &self,
        model_id: &str,
        selector: &VersionSelector,
        client: &ClientIdentity,
        stage_filter: Option<Stage>,
    ) -> Result<Assignment> {
        let min_stage = client.effective_stage(stage_filter);
        let model = self.registry.resolve(model_id, selector, min_stage)?;
        let model_ref = model.model_ref();
        debug!(model = %model_ref, %min_stage, "Resolved model");

        let candidates = self.candidates(&model_ref, &model).await?;

        let (reservation, cold_start) = match self.reserve_warm(&candidates)? {
            Some(reservation) => (reservation, false),
            None => match self.cold_start(&candidates, &model).await? {
                Some(reservation) => (reservation, true),
                None => return Err(DispatchError::NoAvailableWorker(model_ref)),
            },
        };

        let worker = self
            .directory
            .get(reservation.worker_id())
            .map_err(|_| DispatchError::Unavailable)?
            .ok_or_else(|| DispatchError::NoAvailableWorker(model_ref.clone()))?;

        let credential = self
            .authority
            .issue(reservation, model_ref.clone(), &client.key_id, None)?;

        // A retirement that raced with us must not leave a credential for a
        // version that no longer exists.
        if !self.registry.contains(&model_ref)? {
            self.authority.close(&credential.token)?;
            return Err(RegistryError::NotFound(model_ref.to_string()).into());
        }

        info!(
            model = %model_ref,
            worker_id = %worker.worker_id,
            cold_start,
            "Worker assigned"
        );

        Ok(Assignment {
            worker_id: worker.worker_id,
            worker_address: worker.address,
            credential,
            model,
            cold_start,
        })
    }

    /// Candidate lookup, retrying while a directory writer holds the table.
    ///
    /// A poisoned directory never recovers, so it fails at once.
    async fn candidates(&self, model_ref: &ModelRef, model: &ModelVersion) -> Result<Candidates> {
        let mut attempt = 0;
        loop {
            match self.directory.list_candidates(model_ref, model.accelerator) {
                Ok(candidates) => return Ok(candidates),
                Err(DirectoryError::Busy) if attempt < self.config.directory_retries => {
                    attempt += 1;
                    debug!(attempt, "Worker directory busy, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                }
                Err(e) => {
                    warn!(error = %e, attempts = attempt + 1, "Candidate lookup failed");
                    return Err(DispatchError::Unavailable);
                }
            }
        }
    }

    fn reserve_warm(&self, candidates: &Candidates) -> Result<Option<SlotReservation>> {
        for worker in &candidates.warm {
            match self.directory.try_reserve(&worker.worker_id) {
                Ok(Some(reservation)) => return Ok(Some(reservation)),
                Ok(None) => {
                    debug!(worker_id = %worker.worker_id, "Candidate filled up, trying next");
                }
                Err(_) => return Err(DispatchError::Unavailable),
            }
        }
        Ok(None)
    }

    /// Reserve a slot on the cold candidate, then ask it to load the model.
    ///
    /// The slot is taken first so two concurrent cold starts cannot both
    /// squeeze onto a worker with one free slot.
    async fn cold_start(
        &self,
        candidates: &Candidates,
        model: &ModelVersion,
    ) -> Result<Option<SlotReservation>> {
        if !self.config.cold_start {
            return Ok(None);
        }
        let Some(worker) = &candidates.cold else {
            return Ok(None);
        };
        let Some(reservation) = self
            .directory
            .try_reserve(&worker.worker_id)
            .map_err(|_| DispatchError::Unavailable)?
        else {
            return Ok(None);
        };

        info!(worker_id = %worker.worker_id, model = %model.model_ref(), "Cold start");

        let loaded = tokio::time::timeout(
            self.config.cold_start_timeout(),
            self.placement.load_model(worker, model),
        )
        .await
        .map_err(|_| DispatchError::DeadlineExceeded(self.config.cold_start_timeout()))??;

        self.directory
            .mark_loaded(&worker.worker_id, &loaded.model, &loaded.evicted)
            .map_err(|_| DispatchError::Unavailable)?;

        Ok(Some(reservation))
    }

    /// Retire a model version unless it still has live sessions.
    pub fn retire(&self, model: &ModelRef) -> Result<Arc<ModelVersion>> {
        let authority = &self.authority;
        let mut session_check = Ok(());
        let retired = self.registry.retire_if_unused(model, |m| {
            authority.has_active_sessions(m).unwrap_or_else(|e| {
                session_check = Err(e);
                true
            })
        });
        session_check?;
        Ok(retired?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionsConfig, WorkersConfig};
    use crate::db::create_test_db;
    use crate::services::directory::WorkerRecord;
    use crate::services::test_support::{heartbeat, linear};
    use async_trait::async_trait;
    use infermesh_common::wire::LoadModelResponse;
    use infermesh_common::{AcceleratorClass, ErrorBody, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Placement that succeeds (optionally after a delay) and counts calls.
    struct FakePlacement {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakePlacement {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl ModelPlacement for FakePlacement {
        async fn load_model(
            &self,
            worker: &WorkerRecord,
            model: &ModelVersion,
        ) -> std::result::Result<LoadModelResponse, PlacementError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(PlacementError::Rejected {
                    worker_id: worker.worker_id.clone(),
                    error: ErrorBody::new(ErrorKind::Internal, "no memory"),
                });
            }
            Ok(LoadModelResponse {
                success: true,
                model: model.model_ref(),
                already_loaded: false,
                evicted: vec![],
            })
        }
    }

    struct Harness {
        registry: Arc<ModelRegistry>,
        directory: Arc<WorkerDirectory>,
        authority: Arc<SessionAuthority>,
        dispatcher: Arc<Dispatcher>,
    }

    fn harness(placement: Arc<dyn ModelPlacement>, config: DispatchConfig) -> Harness {
        let registry = Arc::new(ModelRegistry::new(create_test_db()));
        let directory = Arc::new(WorkerDirectory::new(WorkersConfig::default()));
        let authority = Arc::new(SessionAuthority::new(
            directory.clone(),
            SessionsConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            directory.clone(),
            authority.clone(),
            placement,
            config,
        ));
        Harness {
            registry,
            directory,
            authority,
            dispatcher,
        }
    }

    fn v1() -> ModelRef {
        ModelRef::new("linear", "v1")
    }

    async fn assign(h: &Harness) -> Result<Assignment> {
        h.dispatcher
            .assign(
                "linear",
                &VersionSelector::Latest,
                &ClientIdentity::anonymous(),
                None,
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_zero_workers_is_no_available_worker() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();

        assert!(matches!(
            assign(&h).await,
            Err(DispatchError::NoAvailableWorker(m)) if m == v1()
        ));
    }

    #[tokio::test]
    async fn test_busy_directory_is_retried() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 4, 0, &[v1()])).unwrap();

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let directory = h.directory.clone();
        let writer = std::thread::spawn(move || {
            let _guard = directory.lock_table();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(40));
        });
        locked_rx.recv().unwrap();

        let assignment = assign(&h).await.unwrap();
        assert_eq!(assignment.worker_id, "w1");
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_poisoned_directory_fails_without_retrying() {
        let config = DispatchConfig {
            retry_backoff_ms: 60_000,
            ..DispatchConfig::default()
        };
        let h = harness(FakePlacement::ok(), config);
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 4, 0, &[v1()])).unwrap();

        let directory = h.directory.clone();
        let _ = std::thread::spawn(move || {
            let _guard = directory.lock_table();
            panic!("writer died");
        })
        .join();

        let outcome = tokio::time::timeout(Duration::from_secs(5), assign(&h))
            .await
            .expect("poisoned directory must not back off");
        assert!(matches!(outcome, Err(DispatchError::Unavailable)));
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        assert!(matches!(
            assign(&h).await,
            Err(DispatchError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_warm_assignment_prefers_least_loaded() {
        let placement = FakePlacement::ok();
        let h = harness(placement.clone(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("busy", 4, 3, &[v1()])).unwrap();
        h.directory.register_or_update(heartbeat("idle", 4, 0, &[v1()])).unwrap();
        h.directory.register_or_update(heartbeat("empty", 4, 0, &[])).unwrap();

        let assignment = assign(&h).await.unwrap();
        assert_eq!(assignment.worker_id, "idle");
        assert!(!assignment.cold_start);
        assert_eq!(assignment.worker_address, "http://idle.local:9000");
        assert_eq!(placement.calls.load(Ordering::SeqCst), 0);

        let grant = h
            .authority
            .validate(&assignment.credential.token, "idle")
            .unwrap();
        assert_eq!(grant.model, v1());
    }

    #[tokio::test]
    async fn test_cold_start_loads_on_idle_worker() {
        let placement = FakePlacement::ok();
        let h = harness(placement.clone(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 2, 0, &[])).unwrap();

        let assignment = assign(&h).await.unwrap();
        assert!(assignment.cold_start);
        assert_eq!(placement.calls.load(Ordering::SeqCst), 1);
        assert!(h.directory.get("w1").unwrap().unwrap().hosts(&v1()));

        // Now warm: no second load.
        let again = assign(&h).await.unwrap();
        assert!(!again.cold_start);
        assert_eq!(placement.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cold_start_disabled() {
        let config = DispatchConfig {
            cold_start: false,
            ..DispatchConfig::default()
        };
        let h = harness(FakePlacement::ok(), config);
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 2, 0, &[])).unwrap();

        assert!(matches!(
            assign(&h).await,
            Err(DispatchError::NoAvailableWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_cold_start_releases_slot() {
        let placement = Arc::new(FakePlacement {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let h = harness(placement, DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 1, 0, &[])).unwrap();

        assert!(matches!(assign(&h).await, Err(DispatchError::ColdStart(_))));
        assert_eq!(h.directory.get("w1").unwrap().unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_accelerator_requirement_blocks_cpu_cold_start() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        let mut gpu_model = linear("v1", Stage::Prod);
        gpu_model.accelerator = Some(AcceleratorClass::Gpu);
        h.registry.publish(gpu_model).unwrap();
        h.directory.register_or_update(heartbeat("cpu", 2, 0, &[])).unwrap();

        assert!(matches!(
            assign(&h).await,
            Err(DispatchError::NoAvailableWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_assigns_on_single_slot() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 1, 0, &[v1()])).unwrap();

        let (a, b) = tokio::join!(assign(&h), assign(&h));
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!([a, b]
            .into_iter()
            .any(|r| matches!(r, Err(DispatchError::NoAvailableWorker(_)))));
        assert_eq!(h.directory.get("w1").unwrap().unwrap().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_assigns_across_tasks_respect_capacity() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 3, 0, &[v1()])).unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let dispatcher = h.dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .assign(
                            "linear",
                            &VersionSelector::Latest,
                            &ClientIdentity::anonymous(),
                            None,
                            None,
                        )
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let granted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(granted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_releases_reservation() {
        let placement = Arc::new(FakePlacement {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(10),
            fail: false,
        });
        let h = harness(placement, DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 1, 0, &[])).unwrap();

        let result = h
            .dispatcher
            .assign(
                "linear",
                &VersionSelector::Latest,
                &ClientIdentity::anonymous(),
                None,
                Some(Duration::from_secs(1)),
            )
            .await;

        assert!(matches!(result, Err(DispatchError::DeadlineExceeded(_))));
        assert_eq!(h.directory.get("w1").unwrap().unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_stage_filter_and_client_floor() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.registry.publish(linear("v2", Stage::Staging)).unwrap();
        h.directory
            .register_or_update(heartbeat("w1", 4, 0, &[v1(), ModelRef::new("linear", "v2")]))
            .unwrap();

        let staging = h
            .dispatcher
            .assign(
                "linear",
                &VersionSelector::Latest,
                &ClientIdentity::anonymous(),
                Some(Stage::Staging),
                None,
            )
            .await
            .unwrap();
        assert_eq!(staging.model.version, "v2");

        let prod_only = ClientIdentity {
            min_stage: Stage::Prod,
            ..ClientIdentity::anonymous()
        };
        let floored = h
            .dispatcher
            .assign(
                "linear",
                &VersionSelector::Latest,
                &prod_only,
                Some(Stage::Staging),
                None,
            )
            .await
            .unwrap();
        assert_eq!(floored.model.version, "v1");

        let exact = h
            .dispatcher
            .assign(
                "linear",
                &VersionSelector::Exact("v2".into()),
                &prod_only,
                None,
                None,
            )
            .await;
        assert!(matches!(
            exact,
            Err(DispatchError::Registry(RegistryError::StageMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_retire_blocked_by_live_session() {
        let h = harness(FakePlacement::ok(), DispatchConfig::default());
        h.registry.publish(linear("v1", Stage::Prod)).unwrap();
        h.directory.register_or_update(heartbeat("w1", 2, 0, &[v1()])).unwrap();

        let assignment = assign(&h).await.unwrap();
        assert!(matches!(
            h.dispatcher.retire(&v1()),
            Err(DispatchError::Registry(RegistryError::InUse(_)))
        ));

        h.authority.close(&assignment.credential.token).unwrap();
        h.dispatcher.retire(&v1()).unwrap();
        assert!(!h.registry.contains(&v1()).unwrap());
    }
}
