//! Run and artifact persistence.
//!
//! [`RunStore`] is the storage seam: the engine only depends on the trait,
//! and the in-memory implementation backs tests and embedded use. All
//! lookups are tenant-scoped; a run id from another tenant behaves exactly
//! like a missing run so existence never leaks across tenants. Artifacts are
//! append-only: one per run, never overwritten.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::run::{Artifact, Run};

/// Failures surfaced by a [`RunStore`] implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("run '{run_id}' not found")]
    #[diagnostic(
        code(gauntlet::store::run_not_found),
        help("the run does not exist in this tenant's scope")
    )]
    RunNotFound { run_id: String },

    #[error("artifact for run '{run_id}' not found")]
    #[diagnostic(
        code(gauntlet::store::artifact_not_found),
        help("artifacts are recorded when a run reaches a terminal state")
    )]
    ArtifactNotFound { run_id: String },

    #[error("artifact for run '{run_id}' already recorded")]
    #[diagnostic(
        code(gauntlet::store::artifact_exists),
        help("artifacts are immutable; a second write for the same run is a bug")
    )]
    ArtifactExists { run_id: String },

    #[error("storage backend failure: {reason}")]
    #[diagnostic(code(gauntlet::store::backend))]
    Backend { reason: String },
}

/// Tenant-scoped persistence for runs and their artifacts.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or update a run. The tenant scope comes from the run's own
    /// config.
    async fn put_run(&self, run: Run) -> Result<(), StoreError>;

    /// Fetch a run by id within a tenant's scope.
    async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Run, StoreError>;

    /// All runs for a tenant, ordered by creation time.
    async fn list_runs(&self, tenant_id: &str) -> Result<Vec<Run>, StoreError>;

    /// Record a run's artifact. Fails if one already exists.
    async fn put_artifact(&self, tenant_id: &str, artifact: Artifact) -> Result<(), StoreError>;

    /// Fetch a run's artifact within a tenant's scope.
    async fn get_artifact(&self, tenant_id: &str, run_id: &str) -> Result<Artifact, StoreError>;
}

#[derive(Default)]
struct StoreInner {
    // Keyed by (tenant_id, run_id).
    runs: FxHashMap<(String, String), Run>,
    artifacts: FxHashMap<(String, String), Artifact>,
}

/// Lock-guarded in-memory [`RunStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn put_run(&self, run: Run) -> Result<(), StoreError> {
        let key = (run.config.tenant_id.clone(), run.id.clone());
        self.inner.write().await.runs.insert(key, run);
        Ok(())
    }

    async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Run, StoreError> {
        self.inner
            .read()
            .await
            .runs
            .get(&(tenant_id.to_string(), run_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_runs(&self, tenant_id: &str) -> Result<Vec<Run>, StoreError> {
        let guard = self.inner.read().await;
        let mut runs: Vec<Run> = guard
            .runs
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, run)| run.clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn put_artifact(&self, tenant_id: &str, artifact: Artifact) -> Result<(), StoreError> {
        let key = (tenant_id.to_string(), artifact.run_id.clone());
        let mut guard = self.inner.write().await;
        if guard.artifacts.contains_key(&key) {
            return Err(StoreError::ArtifactExists {
                run_id: artifact.run_id,
            });
        }
        guard.artifacts.insert(key, artifact);
        Ok(())
    }

    async fn get_artifact(&self, tenant_id: &str, run_id: &str) -> Result<Artifact, StoreError> {
        self.inner
            .read()
            .await
            .artifacts
            .get(&(tenant_id.to_string(), run_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound {
                run_id: run_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunConfig;

    fn run_for(tenant: &str, id: &str) -> Run {
        Run::new(
            id.to_string(),
            "graph-1".into(),
            1,
            "fp".into(),
            RunConfig::for_tenant(tenant),
        )
    }

    #[tokio::test]
    async fn cross_tenant_lookup_reads_as_missing() {
        let store = InMemoryStore::new();
        store.put_run(run_for("tenant-a", "run-1")).await.unwrap();

        assert!(store.get_run("tenant-a", "run-1").await.is_ok());
        assert!(matches!(
            store.get_run("tenant-b", "run-1").await,
            Err(StoreError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn artifacts_are_append_only() {
        let store = InMemoryStore::new();
        let run = run_for("tenant-a", "run-1");
        let artifact = Artifact::from_run(&run);
        store
            .put_artifact("tenant-a", artifact.clone())
            .await
            .unwrap();
        assert!(matches!(
            store.put_artifact("tenant-a", artifact).await,
            Err(StoreError::ArtifactExists { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_scoped_and_ordered() {
        let store = InMemoryStore::new();
        store.put_run(run_for("tenant-a", "run-1")).await.unwrap();
        store.put_run(run_for("tenant-a", "run-2")).await.unwrap();
        store.put_run(run_for("tenant-b", "run-3")).await.unwrap();

        let runs = store.list_runs("tenant-a").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.config.tenant_id == "tenant-a"));
    }
}
