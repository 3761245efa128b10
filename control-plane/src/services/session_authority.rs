//! Issues and checks the short-lived credentials that let a client call a worker.
//!
//! Each credential owns the [`SlotReservation`] taken during assignment. The
//! reservation is dropped exactly once: when the credential is consumed,
//! closed, expires, or turns out to point at a worker that has left.
//! Reservations are always dropped after the session lock is released.

use crate::config::SessionsConfig;
use crate::services::directory::{SlotReservation, WorkerDirectory};
use infermesh_common::wire::SessionGrant;
use infermesh_common::ModelRef;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info};

const TOKEN_PREFIX: &str = "sess_";
const TOKEN_LEN: usize = 43;

/// How long a spent or expired credential is remembered, so late callers get
/// a precise error instead of "unknown".
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

/// How many times a credential may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionPolicy {
    SingleUse,
    MultiUse { max_calls: u32 },
}

impl SessionPolicy {
    fn max_calls(&self) -> u32 {
        match self {
            SessionPolicy::SingleUse => 1,
            SessionPolicy::MultiUse { max_calls } => *max_calls,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session expired")]
    Expired,

    #[error("Unknown session")]
    Unknown,

    #[error("Session already consumed")]
    AlreadyConsumed,

    #[error("Session bound to a different worker")]
    WrongWorker,

    #[error("Worker no longer registered")]
    WorkerGone,

    #[error("Session authority unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// A freshly minted credential as handed back to the client.
#[derive(Debug, Clone)]
pub struct SessionCredential {
    pub token: String,
    pub worker_id: String,
    pub model: ModelRef,
    pub client: String,
    pub ttl: Duration,
    pub expires_at: OffsetDateTime,
}

struct SessionEntry {
    worker_id: String,
    model: ModelRef,
    client: String,
    expires_at: Instant,
    policy: SessionPolicy,
    calls: u32,
    consumed: bool,
    reservation: Option<SlotReservation>,
}

impl SessionEntry {
    fn is_live(&self, now: Instant) -> bool {
        !self.consumed && now < self.expires_at
    }
}

pub struct SessionAuthority {
    directory: Arc<WorkerDirectory>,
    config: SessionsConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

fn generate_token() -> String {
    let body: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", TOKEN_PREFIX, body)
}

impl SessionAuthority {
    pub fn new(directory: Arc<WorkerDirectory>, config: SessionsConfig) -> Self {
        Self {
            directory,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.config.policy
    }

    /// Mint a credential that takes ownership of `reservation`.
    pub fn issue(
        &self,
        reservation: SlotReservation,
        model: ModelRef,
        client: &str,
        ttl: Option<Duration>,
    ) -> Result<SessionCredential> {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());
        let token = generate_token();
        let worker_id = reservation.worker_id().to_string();

        let entry = SessionEntry {
            worker_id: worker_id.clone(),
            model: model.clone(),
            client: client.to_string(),
            expires_at: Instant::now() + ttl,
            policy: self.config.policy,
            calls: 0,
            consumed: false,
            reservation: Some(reservation),
        };

        {
            let mut sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
            sessions.insert(token.clone(), entry);
        }

        debug!(worker_id = %worker_id, model = %model, client, ttl_ms = ttl.as_millis() as u64, "Session issued");

        Ok(SessionCredential {
            token,
            worker_id,
            model,
            client: client.to_string(),
            ttl,
            expires_at: OffsetDateTime::now_utc() + ttl,
        })
    }

    /// Check a credential presented to `worker_id` and count one use.
    pub fn validate(&self, token: &str, worker_id: &str) -> Result<SessionGrant> {
        let worker_present = self
            .directory
            .contains(worker_id)
            .map_err(|_| SessionError::Unavailable)?;
        let now = Instant::now();

        let mut released = None;
        let outcome = {
            let mut sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
            match sessions.get_mut(token) {
                None => Err(SessionError::Unknown),
                Some(entry) if now >= entry.expires_at => {
                    released = entry.reservation.take();
                    Err(SessionError::Expired)
                }
                Some(entry) if entry.worker_id != worker_id => Err(SessionError::WrongWorker),
                Some(entry) if entry.consumed => Err(SessionError::AlreadyConsumed),
                Some(entry) if !worker_present => {
                    entry.consumed = true;
                    released = entry.reservation.take();
                    Err(SessionError::WorkerGone)
                }
                Some(entry) => {
                    entry.calls += 1;
                    let max_calls = entry.policy.max_calls();
                    if entry.calls >= max_calls {
                        entry.consumed = true;
                        released = entry.reservation.take();
                    }
                    Ok(SessionGrant {
                        worker_id: entry.worker_id.clone(),
                        model: entry.model.clone(),
                        client: entry.client.clone(),
                        expires_in_ms: entry.expires_at.saturating_duration_since(now).as_millis()
                            as u64,
                        remaining_calls: Some(max_calls.saturating_sub(entry.calls)),
                    })
                }
            }
        };
        drop(released);

        if let Err(e) = &outcome {
            debug!(worker_id, error = %e, "Session validation failed");
        }
        outcome
    }

    /// Revoke a credential early. Returns false if it was unknown.
    pub fn close(&self, token: &str) -> Result<bool> {
        let removed = {
            let mut sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
            sessions.remove(token)
        };
        match removed {
            Some(entry) => {
                debug!(worker_id = %entry.worker_id, model = %entry.model, "Session closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// True while any unexpired, unspent credential references `model`.
    pub fn has_active_sessions(&self, model: &ModelRef) -> Result<bool> {
        let now = Instant::now();
        let sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
        Ok(sessions
            .values()
            .any(|entry| entry.is_live(now) && &entry.model == model))
    }

    pub fn active_count(&self) -> Result<usize> {
        let now = Instant::now();
        let sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
        Ok(sessions.values().filter(|entry| entry.is_live(now)).count())
    }

    /// Release slots held by expired credentials and forget old tombstones.
    ///
    /// Returns the number of slots released.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut released = Vec::new();
        {
            let mut sessions = self.sessions.lock().map_err(|_| SessionError::Unavailable)?;
            for entry in sessions.values_mut() {
                if now >= entry.expires_at {
                    if let Some(reservation) = entry.reservation.take() {
                        released.push(reservation);
                    }
                }
            }
            sessions.retain(|_, entry| now < entry.expires_at + TOMBSTONE_RETENTION);
        }

        let count = released.len();
        drop(released);
        if count > 0 {
            info!(count, "Released slots of expired sessions");
        }
        Ok(count)
    }
}
