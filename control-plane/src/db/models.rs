//! Row types and queries for the `models` and `api_keys` tables.

use super::{Database, DbError, Result};
use infermesh_common::{ModelVersion, Stage};
use rusqlite::params;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Stored API key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRow {
    pub key_id: String,
    /// Hex-encoded SHA-256 of the key
    pub key_hash: String,
    pub name: String,
    pub permissions: String, // JSON array
    pub min_stage: String,
    pub enabled: bool,
    pub created_at: String, // RFC 3339
    pub expires_at: Option<String>,
    pub rate_limit_per_minute: u32,
}

pub(crate) fn format_timestamp(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| DbError::Corrupt(format!("Unformattable timestamp: {}", e)))
}

pub(crate) fn parse_timestamp(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| DbError::Corrupt(format!("Invalid timestamp '{}': {}", s, e)))
}

/// Insert a newly published model version.
pub fn insert_model(db: &Database, model: &ModelVersion) -> Result<()> {
    let conn = db.get_conn()?;
    let published_at = format_timestamp(model.published_at.unwrap_or_else(OffsetDateTime::now_utc))?;
    let manifest = serde_json::to_string(model)?;

    conn.execute(
        "INSERT INTO models (model_id, version, stage, publish_seq, published_at, manifest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &model.model_id,
            &model.version,
            model.stage.as_str(),
            model.publish_seq as i64,
            &published_at,
            &manifest,
        ],
    )?;

    Ok(())
}

/// Persist a stage change. Returns false if the version is not stored.
pub fn update_model_stage(db: &Database, model: &ModelVersion) -> Result<bool> {
    let conn = db.get_conn()?;
    let manifest = serde_json::to_string(model)?;

    let affected = conn.execute(
        "UPDATE models SET stage = ?1, manifest = ?2 WHERE model_id = ?3 AND version = ?4",
        params![model.stage.as_str(), &manifest, &model.model_id, &model.version],
    )?;

    Ok(affected > 0)
}

pub fn delete_model(db: &Database, model_id: &str, version: &str) -> Result<bool> {
    let conn = db.get_conn()?;
    let affected = conn.execute(
        "DELETE FROM models WHERE model_id = ?1 AND version = ?2",
        params![model_id, version],
    )?;
    Ok(affected > 0)
}

/// Load every stored model version in publication order.
pub fn load_models(db: &Database) -> Result<Vec<ModelVersion>> {
    let conn = db.get_conn()?;
    let mut stmt = conn.prepare(
        "SELECT stage, publish_seq, published_at, manifest FROM models ORDER BY publish_seq",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(stage, seq, published_at, manifest)| {
            let mut model: ModelVersion = serde_json::from_str(&manifest)?;
            // Columns win over the manifest copy.
            model.stage = stage.parse::<Stage>().map_err(DbError::Corrupt)?;
            model.publish_seq = seq as u64;
            model.published_at = Some(parse_timestamp(&published_at)?);
            Ok(model)
        })
        .collect()
}

pub fn insert_api_key(db: &Database, row: &ApiKeyRow) -> Result<()> {
    let conn = db.get_conn()?;
    conn.execute(
        "INSERT INTO api_keys (key_id, key_hash, name, permissions, min_stage, enabled,
                               created_at, expires_at, rate_limit_per_minute)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            &row.key_id,
            &row.key_hash,
            &row.name,
            &row.permissions,
            &row.min_stage,
            row.enabled,
            &row.created_at,
            &row.expires_at,
            row.rate_limit_per_minute,
        ],
    )?;
    Ok(())
}

/// Enable or disable a key. Returns false if the key does not exist.
pub fn set_api_key_enabled(db: &Database, key_id: &str, enabled: bool) -> Result<bool> {
    let conn = db.get_conn()?;
    let affected = conn.execute(
        "UPDATE api_keys SET enabled = ?1 WHERE key_id = ?2",
        params![enabled, key_id],
    )?;
    Ok(affected > 0)
}

pub fn load_api_keys(db: &Database) -> Result<Vec<ApiKeyRow>> {
    let conn = db.get_conn()?;
    let mut stmt = conn.prepare(
        "SELECT key_id, key_hash, name, permissions, min_stage, enabled, created_at,
                expires_at, rate_limit_per_minute
         FROM api_keys ORDER BY created_at",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(ApiKeyRow {
                key_id: row.get(0)?,
                key_hash: row.get(1)?,
                name: row.get(2)?,
                permissions: row.get(3)?,
                min_stage: row.get(4)?,
                enabled: row.get(5)?,
                created_at: row.get(6)?,
                expires_at: row.get(7)?,
                rate_limit_per_minute: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
