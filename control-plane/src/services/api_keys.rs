//! Client API keys.
//!
//! Keys are shown to the caller once at creation and stored only as a SHA-256
//! hash. Authentication yields a [`ClientIdentity`] that the dispatcher uses
//! for stage floors and that sessions record as their owner.

use crate::db::models::{self as rows, format_timestamp, parse_timestamp, ApiKeyRow};
use crate::db::{Database, DbError};
use infermesh_common::Stage;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "imk_";
const KEY_LEN: usize = 40;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const ADMIN_KEY_ID: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Inference,
    ModelPublish,
    ModelRetire,
    WorkerRegister,
    Admin,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API key required")]
    MissingKey,

    #[error("Invalid API key")]
    InvalidKey,

    #[error("API key expired")]
    Expired,

    #[error("API key revoked")]
    Revoked,

    #[error("API key lacks permission {0:?}")]
    Forbidden(Permission),

    #[error("Rate limit of {0} requests per minute exceeded")]
    RateLimited(u32),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key request: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Key store unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Who is calling, as established by their API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub key_id: String,
    pub name: String,
    /// Lowest stage this client may be served.
    pub min_stage: Stage,
    pub admin: bool,
}

impl ClientIdentity {
    /// Caller without a key, accepted when keys are not required. The
    /// request's own stage filter is the only floor.
    pub fn anonymous() -> Self {
        Self {
            key_id: "anonymous".to_string(),
            name: "anonymous".to_string(),
            min_stage: Stage::Dev,
            admin: false,
        }
    }

    /// Stage floor for a request: the requested filter (prod when absent),
    /// raised to the key's own floor.
    pub fn effective_stage(&self, requested: Option<Stage>) -> Stage {
        requested.unwrap_or(Stage::Prod).max(self.min_stage)
    }
}

/// Public view of a stored key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub key_id: String,
    pub name: String,
    pub permissions: Vec<Permission>,
    pub min_stage: Stage,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApiKey {
    pub name: String,
    pub permissions: Vec<Permission>,
    #[serde(default = "default_min_stage")]
    pub min_stage: Stage,
    /// Lifetime in seconds; no expiry when absent.
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    /// Zero disables rate limiting.
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

fn default_min_stage() -> Stage {
    Stage::Prod
}

struct KeyRecord {
    info: ApiKeyInfo,
    window_start: Instant,
    window_count: u32,
}

impl KeyRecord {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            key_id: self.info.key_id.clone(),
            name: self.info.name.clone(),
            min_stage: self.info.min_stage,
            admin: self.info.permissions.contains(&Permission::Admin),
        }
    }

    fn allows(&self, permission: Permission) -> bool {
        self.info.permissions.contains(&Permission::Admin)
            || self.info.permissions.contains(&permission)
    }
}

pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn generate_key() -> String {
    let body: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", KEY_PREFIX, body)
}

pub struct ApiKeyManager {
    db: Database,
    /// key hash -> record
    keys: RwLock<HashMap<String, KeyRecord>>,
    admin_key_hash: Option<String>,
}

impl ApiKeyManager {
    pub fn new(db: Database, admin_key: Option<&str>) -> Self {
        Self {
            db,
            keys: RwLock::new(HashMap::new()),
            admin_key_hash: admin_key.map(hash_key),
        }
    }

    /// Create the manager and load stored keys.
    pub fn load_from_db(db: Database, admin_key: Option<&str>) -> Result<Self> {
        let manager = Self::new(db, admin_key);
        let stored = rows::load_api_keys(&manager.db)?;
        let now = Instant::now();

        let mut keys = manager.keys.write().map_err(|_| AuthError::Unavailable)?;
        for row in stored {
            let info = row_to_info(&row)?;
            keys.insert(
                row.key_hash,
                KeyRecord {
                    info,
                    window_start: now,
                    window_count: 0,
                },
            );
        }
        info!(count = keys.len(), "API keys loaded");
        drop(keys);

        Ok(manager)
    }

    /// Create a key and return its plaintext together with its public info.
    pub fn create(&self, request: NewApiKey) -> Result<(String, ApiKeyInfo)> {
        if request.name.trim().is_empty() {
            return Err(AuthError::Invalid("name cannot be empty".into()));
        }
        if request.permissions.is_empty() {
            return Err(AuthError::Invalid("at least one permission is required".into()));
        }

        let key = generate_key();
        let key_hash = hash_key(&key);
        let created_at = OffsetDateTime::now_utc();
        let expires_at = request
            .expires_in_secs
            .map(|secs| created_at + Duration::from_secs(secs));

        let info = ApiKeyInfo {
            key_id: Uuid::new_v4().to_string(),
            name: request.name,
            permissions: request.permissions,
            min_stage: request.min_stage,
            enabled: true,
            created_at,
            expires_at,
            rate_limit_per_minute: request.rate_limit_per_minute,
        };

        let row = ApiKeyRow {
            key_id: info.key_id.clone(),
            key_hash: key_hash.clone(),
            name: info.name.clone(),
            permissions: serde_json::to_string(&info.permissions).map_err(DbError::from)?,
            min_stage: info.min_stage.as_str().to_string(),
            enabled: true,
            created_at: format_timestamp(created_at)?,
            expires_at: expires_at.map(format_timestamp).transpose()?,
            rate_limit_per_minute: info.rate_limit_per_minute,
        };

        let mut keys = self.keys.write().map_err(|_| AuthError::Unavailable)?;
        rows::insert_api_key(&self.db, &row)?;
        keys.insert(
            key_hash,
            KeyRecord {
                info: info.clone(),
                window_start: Instant::now(),
                window_count: 0,
            },
        );

        info!(key_id = %info.key_id, name = %info.name, "API key created");
        Ok((key, info))
    }

    /// Check a presented key for `permission` and count it against the rate limit.
    pub fn authenticate(&self, key: Option<&str>, permission: Permission) -> Result<ClientIdentity> {
        let key = key.filter(|k| !k.is_empty()).ok_or(AuthError::MissingKey)?;
        let key_hash = hash_key(key);

        if self.admin_key_hash.as_deref() == Some(key_hash.as_str()) {
            return Ok(ClientIdentity {
                key_id: ADMIN_KEY_ID.to_string(),
                name: ADMIN_KEY_ID.to_string(),
                min_stage: Stage::Dev,
                admin: true,
            });
        }

        let mut keys = self.keys.write().map_err(|_| AuthError::Unavailable)?;
        let record = keys.get_mut(&key_hash).ok_or(AuthError::InvalidKey)?;

        if !record.info.enabled {
            return Err(AuthError::Revoked);
        }
        if let Some(expires_at) = record.info.expires_at {
            if OffsetDateTime::now_utc() >= expires_at {
                return Err(AuthError::Expired);
            }
        }
        if !record.allows(permission) {
            warn!(key_id = %record.info.key_id, ?permission, "Permission denied");
            return Err(AuthError::Forbidden(permission));
        }

        let limit = record.info.rate_limit_per_minute;
        if limit > 0 {
            let now = Instant::now();
            if now.saturating_duration_since(record.window_start) >= RATE_WINDOW {
                record.window_start = now;
                record.window_count = 0;
            }
            if record.window_count >= limit {
                return Err(AuthError::RateLimited(limit));
            }
            record.window_count += 1;
        }

        Ok(record.identity())
    }

    /// Disable a key. It stays listed but no longer authenticates.
    pub fn revoke(&self, key_id: &str) -> Result<()> {
        let mut keys = self.keys.write().map_err(|_| AuthError::Unavailable)?;
        let record = keys
            .values_mut()
            .find(|r| r.info.key_id == key_id)
            .ok_or_else(|| AuthError::NotFound(key_id.to_string()))?;

        rows::set_api_key_enabled(&self.db, key_id, false)?;
        record.info.enabled = false;

        info!(key_id, "API key revoked");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ApiKeyInfo>> {
        let keys = self.keys.read().map_err(|_| AuthError::Unavailable)?;
        let mut infos: Vec<ApiKeyInfo> = keys.values().map(|r| r.info.clone()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_id.cmp(&b.key_id)));
        Ok(infos)
    }
}

fn row_to_info(row: &ApiKeyRow) -> Result<ApiKeyInfo> {
    let permissions: Vec<Permission> =
        serde_json::from_str(&row.permissions).map_err(DbError::from)?;
    let min_stage = row
        .min_stage
        .parse::<Stage>()
        .map_err(|e| AuthError::Storage(DbError::Corrupt(e)))?;

    Ok(ApiKeyInfo {
        key_id: row.key_id.clone(),
        name: row.name.clone(),
        permissions,
        min_stage,
        enabled: row.enabled,
        created_at: parse_timestamp(&row.created_at)?,
        expires_at: row.expires_at.as_deref().map(parse_timestamp).transpose()?,
        rate_limit_per_minute: row.rate_limit_per_minute,
    })
}
