use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{BatchItemResult, BatchReport, DataModel, Recipe, StyleProfile, TestResult};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Filesystem store for job artifacts: one directory per job, one JSON
/// document per artifact, replaced whole on every save. Listings from a
/// batch run live under `listings/` keyed by product id.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

const DATA_MODEL: &str = "data_model.json";
const STYLE_PROFILE: &str = "style_profile.json";
const RECIPE: &str = "recipe.json";
const TEST_RESULTS: &str = "test_results.json";
const REPORT: &str = "report.json";

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("JOBS_DIR").unwrap_or_else(|_| "jobs".to_string());
        Self::new(root)
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    async fn save<T: Serialize>(
        &self,
        job_id: Uuid,
        name: &str,
        value: &T,
    ) -> Result<(), ArtifactError> {
        let dir = self.job_dir(job_id);
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(target = "listwright.artifacts", job_id = %job_id, path = %path.display(), "artifact saved");
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, ArtifactError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_data_model(
        &self,
        job_id: Uuid,
        model: &DataModel,
    ) -> Result<(), ArtifactError> {
        self.save(job_id, DATA_MODEL, model).await
    }

    pub async fn load_data_model(&self, job_id: Uuid) -> Result<Option<DataModel>, ArtifactError> {
        self.load(&self.job_dir(job_id).join(DATA_MODEL)).await
    }

    pub async fn save_style_profile(
        &self,
        job_id: Uuid,
        profile: &StyleProfile,
    ) -> Result<(), ArtifactError> {
        self.save(job_id, STYLE_PROFILE, profile).await
    }

    pub async fn load_style_profile(
        &self,
        job_id: Uuid,
    ) -> Result<Option<StyleProfile>, ArtifactError> {
        self.load(&self.job_dir(job_id).join(STYLE_PROFILE)).await
    }

    pub async fn save_recipe(&self, job_id: Uuid, recipe: &Recipe) -> Result<(), ArtifactError> {
        self.save(job_id, RECIPE, recipe).await
    }

    pub async fn load_recipe(&self, job_id: Uuid) -> Result<Option<Recipe>, ArtifactError> {
        self.load(&self.job_dir(job_id).join(RECIPE)).await
    }

    pub async fn save_test_results(
        &self,
        job_id: Uuid,
        results: &[TestResult],
    ) -> Result<(), ArtifactError> {
        self.save(job_id, TEST_RESULTS, &results).await
    }

    pub async fn load_test_results(
        &self,
        job_id: Uuid,
    ) -> Result<Option<Vec<TestResult>>, ArtifactError> {
        self.load(&self.job_dir(job_id).join(TEST_RESULTS)).await
    }

    pub async fn save_report(&self, job_id: Uuid, report: &BatchReport) -> Result<(), ArtifactError> {
        self.save(job_id, REPORT, report).await
    }

    pub async fn load_report(&self, job_id: Uuid) -> Result<Option<BatchReport>, ArtifactError> {
        self.load(&self.job_dir(job_id).join(REPORT)).await
    }

    /// The winning extraction script, kept for audit next to the data model
    /// it produced.
    pub async fn save_extraction_script(
        &self,
        job_id: Uuid,
        script: &str,
    ) -> Result<(), ArtifactError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("extraction_script.rhai"), script).await?;
        Ok(())
    }

    pub async fn save_listing(
        &self,
        job_id: Uuid,
        result: &BatchItemResult,
    ) -> Result<(), ArtifactError> {
        let name = format!("listings/{}.json", sanitize_id(&result.product_id));
        self.save(job_id, &name, result).await
    }
}

/// Product ids come out of model-written scripts; keep them from escaping
/// the listings directory.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Effort;
    use crate::models::BatchItemStatus;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn missing_artifacts_load_as_none() {
        let (_dir, store) = store();
        assert!(store.load_recipe(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recipe_round_trips_and_is_replaced_whole() {
        let (_dir, store) = store();
        let job_id = Uuid::new_v4();

        let mut recipe = Recipe::fallback_draft();
        store.save_recipe(job_id, &recipe).await.unwrap();

        recipe.version = 2;
        recipe.approved = true;
        store.save_recipe(job_id, &recipe).await.unwrap();

        let loaded = store.load_recipe(job_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.approved);
    }

    #[tokio::test]
    async fn listings_are_stored_per_product() {
        let (dir, store) = store();
        let job_id = Uuid::new_v4();
        let result = BatchItemResult {
            product_id: "p1/evil".into(),
            status: BatchItemStatus::Ok,
            attempt_count: 1,
            escalation_tier: Effort::Low,
            listing: Some(json!({ "title": "Mug" })),
            score: Some(100),
            error: None,
        };
        store.save_listing(job_id, &result).await.unwrap();

        let path = dir
            .path()
            .join(job_id.to_string())
            .join("listings")
            .join("p1_evil.json");
        assert!(path.exists());
    }
}
