//! Catalog of published model versions.
//!
//! One `RwLock` guards the whole catalog, so `resolve` never observes a
//! half-applied publish or stage change. Entries are `Arc<ModelVersion>` and
//! are never mutated in place: a stage change swaps in a new `Arc`.

use crate::db::{self, Database, DbError};
use infermesh_common::{ModelRef, ModelSummary, ModelVersion, Stage, VersionSelector, LATEST};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model {0} not found")]
    NotFound(String),

    #[error("Model {model} is at stage {stage}, below the required {required}")]
    StageMismatch {
        model: ModelRef,
        stage: Stage,
        required: Stage,
    },

    #[error("Model {0} is already published")]
    AlreadyExists(ModelRef),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Model {0} has active sessions")]
    InUse(ModelRef),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Model registry unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Default)]
struct Catalog {
    /// model_id -> version -> entry
    models: HashMap<String, BTreeMap<String, Arc<ModelVersion>>>,
    next_seq: u64,
}

impl Catalog {
    fn get(&self, model_id: &str, version: &str) -> Option<&Arc<ModelVersion>> {
        self.models.get(model_id).and_then(|versions| versions.get(version))
    }
}

pub struct ModelRegistry {
    db: Database,
    catalog: RwLock<Catalog>,
}

impl ModelRegistry {
    /// Create an empty registry backed by `db`.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            catalog: RwLock::new(Catalog {
                models: HashMap::new(),
                next_seq: 1,
            }),
        }
    }

    /// Create a registry and load every stored version.
    pub fn load_from_db(db: Database) -> Result<Self> {
        let registry = Self::new(db);
        let stored = db::models::load_models(&registry.db)?;

        {
            let mut catalog = registry.catalog.write().map_err(|_| RegistryError::Unavailable)?;
            for model in stored {
                catalog.next_seq = catalog.next_seq.max(model.publish_seq + 1);
                catalog
                    .models
                    .entry(model.model_id.clone())
                    .or_default()
                    .insert(model.version.clone(), Arc::new(model));
            }
            info!(
                models = catalog.models.len(),
                next_seq = catalog.next_seq,
                "Model catalog loaded"
            );
        }

        Ok(registry)
    }

    /// Resolve a selector to a concrete version at or above `min_stage`.
    ///
    /// `Latest` picks the most recently published eligible version. An exact
    /// version below `min_stage` is a `StageMismatch`, never a silent fallback.
    pub fn resolve(
        &self,
        model_id: &str,
        selector: &VersionSelector,
        min_stage: Stage,
    ) -> Result<Arc<ModelVersion>> {
        let catalog = self.catalog.read().map_err(|_| RegistryError::Unavailable)?;

        let versions = catalog
            .models
            .get(model_id)
            .ok_or_else(|| RegistryError::NotFound(model_id.to_string()))?;

        match selector {
            VersionSelector::Latest => versions
                .values()
                .filter(|m| m.stage >= min_stage)
                .max_by_key(|m| m.publish_seq)
                .cloned()
                .ok_or_else(|| {
                    RegistryError::NotFound(format!("{}:{} at stage {}", model_id, LATEST, min_stage))
                }),
            VersionSelector::Exact(version) => {
                let model = versions.get(version).ok_or_else(|| {
                    RegistryError::NotFound(format!("{}:{}", model_id, version))
                })?;
                if model.stage < min_stage {
                    return Err(RegistryError::StageMismatch {
                        model: model.model_ref(),
                        stage: model.stage,
                        required: min_stage,
                    });
                }
                Ok(model.clone())
            }
        }
    }

    pub fn get(&self, model: &ModelRef) -> Result<Arc<ModelVersion>> {
        let catalog = self.catalog.read().map_err(|_| RegistryError::Unavailable)?;
        catalog
            .get(&model.model_id, &model.version)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(model.to_string()))
    }

    pub fn contains(&self, model: &ModelRef) -> Result<bool> {
        let catalog = self.catalog.read().map_err(|_| RegistryError::Unavailable)?;
        Ok(catalog.get(&model.model_id, &model.version).is_some())
    }

    /// Publish a new version. The registry assigns `publish_seq` and `published_at`.
    pub fn publish(&self, mut model: ModelVersion) -> Result<Arc<ModelVersion>> {
        if model.model_id.trim().is_empty() {
            return Err(RegistryError::InvalidVersion("model_id cannot be empty".into()));
        }
        if model.version.trim().is_empty() {
            return Err(RegistryError::InvalidVersion("version cannot be empty".into()));
        }
        if model.version.eq_ignore_ascii_case(LATEST) {
            return Err(RegistryError::InvalidVersion(format!(
                "'{}' is reserved and cannot be published",
                LATEST
            )));
        }

        let mut catalog = self.catalog.write().map_err(|_| RegistryError::Unavailable)?;

        if catalog.get(&model.model_id, &model.version).is_some() {
            return Err(RegistryError::AlreadyExists(model.model_ref()));
        }

        model.publish_seq = catalog.next_seq;
        model.published_at = Some(OffsetDateTime::now_utc());

        // Persist under the lock so the stored order matches publish_seq.
        db::models::insert_model(&self.db, &model)?;

        catalog.next_seq += 1;
        let model = Arc::new(model);
        catalog
            .models
            .entry(model.model_id.clone())
            .or_default()
            .insert(model.version.clone(), model.clone());

        info!(
            model = %model.model_ref(),
            stage = %model.stage,
            publish_seq = model.publish_seq,
            "Model published"
        );

        Ok(model)
    }

    /// Promote or demote a version by swapping in a copy with the new stage.
    pub fn set_stage(&self, model: &ModelRef, stage: Stage) -> Result<Arc<ModelVersion>> {
        let mut catalog = self.catalog.write().map_err(|_| RegistryError::Unavailable)?;

        let current = catalog
            .get(&model.model_id, &model.version)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(model.to_string()))?;

        if current.stage == stage {
            return Ok(current);
        }

        let updated = Arc::new(current.with_stage(stage));
        db::models::update_model_stage(&self.db, &updated)?;

        if let Some(versions) = catalog.models.get_mut(&model.model_id) {
            versions.insert(model.version.clone(), updated.clone());
        }

        info!(model = %model, from = %current.stage, to = %stage, "Model stage changed");
        Ok(updated)
    }

    /// Remove a version unless `in_use` reports live sessions for it.
    ///
    /// The check runs while the catalog write lock is held, so no new
    /// resolution of this version can start in between.
    pub fn retire_if_unused<F>(&self, model: &ModelRef, in_use: F) -> Result<Arc<ModelVersion>>
    where
        F: FnOnce(&ModelRef) -> bool,
    {
        let mut catalog = self.catalog.write().map_err(|_| RegistryError::Unavailable)?;

        let current = catalog
            .get(&model.model_id, &model.version)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(model.to_string()))?;

        if in_use(model) {
            return Err(RegistryError::InUse(model.clone()));
        }

        db::models::delete_model(&self.db, &model.model_id, &model.version)?;

        if let Some(versions) = catalog.models.get_mut(&model.model_id) {
            versions.remove(&model.version);
            if versions.is_empty() {
                catalog.models.remove(&model.model_id);
            }
        }

        info!(model = %model, "Model retired");
        Ok(current)
    }

    /// List versions, newest first, optionally filtered by minimum stage and tag.
    pub fn list(&self, stage: Option<Stage>, tag: Option<&str>) -> Result<Vec<ModelSummary>> {
        let catalog = self.catalog.read().map_err(|_| RegistryError::Unavailable)?;

        let mut models: Vec<ModelSummary> = catalog
            .models
            .values()
            .flat_map(|versions| versions.values())
            .filter(|m| stage.map_or(true, |s| m.stage >= s))
            .filter(|m| tag.map_or(true, |t| m.tags.iter().any(|mt| mt == t)))
            .map(|m| m.summary())
            .collect();

        models.sort_by(|a, b| b.publish_seq.cmp(&a.publish_seq));
        debug!(count = models.len(), "Listed models");
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_db;
    use crate::services::test_support::linear;

    #[test]
    fn test_latest_picks_newest_eligible() {
        let registry = ModelRegistry::new(create_test_db());
        registry.publish(linear("v1", Stage::Prod)).unwrap();
        registry.publish(linear("v2", Stage::Prod)).unwrap();
        registry.publish(linear("v3", Stage::Staging)).unwrap();

        let prod = registry
            .resolve("linear", &VersionSelector::Latest, Stage::Prod)
            .unwrap();
        assert_eq!(prod.version, "v2");

        let staging = registry
            .resolve("linear", &VersionSelector::Latest, Stage::Staging)
            .unwrap();
        assert_eq!(staging.version, "v3");
    }

    #[test]
    fn test_exact_below_stage_is_mismatch() {
        let registry = ModelRegistry::new(create_test_db());
        registry.publish(linear("v1", Stage::Dev)).unwrap();

        let err = registry
            .resolve("linear", &VersionSelector::Exact("v1".into()), Stage::Prod)
            .unwrap_err();
        assert!(matches!(err, RegistryError::StageMismatch { stage: Stage::Dev, .. }));

        let err = registry
            .resolve("linear", &VersionSelector::Exact("v9".into()), Stage::Dev)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_latest_with_nothing_eligible_is_not_found() {
        let registry = ModelRegistry::new(create_test_db());
        registry.publish(linear("v1", Stage::Dev)).unwrap();
        assert!(matches!(
            registry.resolve("linear", &VersionSelector::Latest, Stage::Prod),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.resolve("missing", &VersionSelector::Latest, Stage::Dev),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_publish_rejects_duplicates_and_sentinel() {
        let registry = ModelRegistry::new(create_test_db());
        registry.publish(linear("v1", Stage::Prod)).unwrap();

        assert!(matches!(
            registry.publish(linear("v1", Stage::Dev)),
            Err(RegistryError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.publish(linear("latest", Stage::Dev)),
            Err(RegistryError::InvalidVersion(_))
        ));
        assert!(matches!(
            registry.publish(linear("", Stage::Dev)),
            Err(RegistryError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_set_stage_replaces_entry() {
        let registry = ModelRegistry::new(create_test_db());
        let original = registry.publish(linear("v1", Stage::Staging)).unwrap();
        let model = original.model_ref();

        let promoted = registry.set_stage(&model, Stage::Prod).unwrap();
        assert_eq!(promoted.stage, Stage::Prod);
        // Holders of the old entry keep seeing the old stage.
        assert_eq!(original.stage, Stage::Staging);
        assert_eq!(promoted.publish_seq, original.publish_seq);

        let resolved = registry
            .resolve("linear", &VersionSelector::Latest, Stage::Prod)
            .unwrap();
        assert_eq!(resolved.version, "v1");
    }

    #[test]
    fn test_retire_respects_in_use() {
        let registry = ModelRegistry::new(create_test_db());
        let model = registry.publish(linear("v1", Stage::Prod)).unwrap().model_ref();

        assert!(matches!(
            registry.retire_if_unused(&model, |_| true),
            Err(RegistryError::InUse(_))
        ));
        assert!(registry.contains(&model).unwrap());

        registry.retire_if_unused(&model, |_| false).unwrap();
        assert!(!registry.contains(&model).unwrap());
        assert!(matches!(
            registry.retire_if_unused(&model, |_| false),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_catalog_survives_reload() {
        let db = create_test_db();
        {
            let registry = ModelRegistry::new(db.clone());
            registry.publish(linear("v1", Stage::Prod)).unwrap();
            registry.publish(linear("v2", Stage::Dev)).unwrap();
            registry
                .set_stage(&ModelRef::new("linear", "v2"), Stage::Prod)
                .unwrap();
        }

        let reloaded = ModelRegistry::load_from_db(db).unwrap();
        let latest = reloaded
            .resolve("linear", &VersionSelector::Latest, Stage::Prod)
            .unwrap();
        assert_eq!(latest.version, "v2");

        let v3 = reloaded.publish(linear("v3", Stage::Prod)).unwrap();
        assert!(v3.publish_seq > latest.publish_seq);
    }

    #[test]
    fn test_list_filters() {
        let registry = ModelRegistry::new(create_test_db());
        registry.publish(linear("v1", Stage::Prod)).unwrap();
        let mut tagged = linear("v2", Stage::Dev);
        tagged.tags = vec!["experimental".into()];
        registry.publish(tagged).unwrap();

        assert_eq!(registry.list(None, None).unwrap().len(), 2);
        assert_eq!(registry.list(Some(Stage::Prod), None).unwrap().len(), 1);

        let experimental = registry.list(None, Some("experimental")).unwrap();
        assert_eq!(experimental.len(), 1);
        assert_eq!(experimental[0].version, "v2");
    }

    #[test]
    fn test_latest_under_concurrent_publication() {
        let registry = Arc::new(ModelRegistry::new(create_test_db()));
        registry.publish(linear("v0", Stage::Prod)).unwrap();

        let publishers: Vec<_> = (1..=8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.publish(linear(&format!("v{}", i), Stage::Prod)).unwrap();
                })
            })
            .collect();

        // Every observed answer is a real prod version whose seq never goes backwards.
        let mut last_seq = 0;
        for _ in 0..200 {
            let resolved = registry
                .resolve("linear", &VersionSelector::Latest, Stage::Prod)
                .unwrap();
            assert_eq!(resolved.stage, Stage::Prod);
            assert!(resolved.publish_seq >= last_seq);
            last_seq = resolved.publish_seq;
        }

        for handle in publishers {
            handle.join().unwrap();
        }

        let final_latest = registry
            .resolve("linear", &VersionSelector::Latest, Stage::Prod)
            .unwrap();
        let max_seq = registry
            .list(Some(Stage::Prod), None)
            .unwrap()
            .iter()
            .map(|m| m.publish_seq)
            .max()
            .unwrap();
        assert_eq!(final_latest.publish_seq, max_seq);
    }
}
