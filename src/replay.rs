//! Deterministic replay of recorded runs.
//!
//! Replay never mutates the original run: it derives a fresh run from the
//! original's configuration (optionally patched by [`ConfigOverrides`]) and
//! executes it against the same graph version. With no overrides and a
//! deterministic provider, the new artifact's trace is byte-identical to the
//! original's.

use miette::Diagnostic;
use thiserror::Error;
use tracing::{info, instrument};

use crate::model::ValidatedGraph;
use crate::run::{ConfigOverrides, Run, RunReport};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::StoreError;
use crate::types::ExecutionMode;

/// Failures specific to replay setup.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplayError {
    #[error("run '{run_id}' is still {state}; only finished runs can be replayed")]
    #[diagnostic(
        code(gauntlet::replay::not_terminal),
        help("wait for the run to reach completed, failed, or cancelled")
    )]
    NotTerminal { run_id: String, state: String },

    #[error(
        "run '{run_id}' was recorded against graph fingerprint {expected}, \
         but the supplied definition has {actual}"
    )]
    #[diagnostic(
        code(gauntlet::replay::graph_drift),
        help("replay requires the exact graph version the original run executed")
    )]
    GraphDrift {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Creates and executes replay runs through a [`Scheduler`].
#[derive(Clone)]
pub struct ReplayController {
    scheduler: Scheduler,
}

impl ReplayController {
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Replay a finished run, returning the new run's report.
    ///
    /// The new run pins the original's seed, provider, and model unless an
    /// override says otherwise, carries `replay_of` back to the original,
    /// and executes in replay mode (an override may force chaos mode to
    /// re-inject the original faults).
    #[instrument(skip_all, fields(original = %run_id))]
    pub async fn replay(
        &self,
        graph: &ValidatedGraph,
        tenant_id: &str,
        run_id: &str,
        overrides: &ConfigOverrides,
    ) -> Result<RunReport, ReplayError> {
        let store = self.scheduler.registry().store();
        let original = store.get_run(tenant_id, run_id).await?;
        if !original.state.is_terminal() {
            return Err(ReplayError::NotTerminal {
                run_id: run_id.to_string(),
                state: original.state.to_string(),
            });
        }
        let actual = graph.def().fingerprint();
        if original.graph_fingerprint != actual {
            return Err(ReplayError::GraphDrift {
                run_id: run_id.to_string(),
                expected: original.graph_fingerprint,
                actual,
            });
        }

        let mut config = original.config.merged_with(overrides);
        if overrides.mode.is_none() {
            config.mode = ExecutionMode::Replay;
        }

        let mut replay_run = self.scheduler.submit(graph, config, None).await?;
        replay_run.replay_of = Some(original.id.clone());
        self.scheduler.registry().checkpoint(&replay_run).await.map_err(SchedulerError::from)?;
        info!(replay = %replay_run.id, "replay run created");

        let report = self
            .scheduler
            .execute(graph, tenant_id, &replay_run.id)
            .await?;
        Ok(report)
    }

    /// Fetch the replayed run record (carrying `replay_of`) after execution.
    pub async fn fetch(&self, tenant_id: &str, run_id: &str) -> Result<Run, ReplayError> {
        Ok(self
            .scheduler
            .registry()
            .store()
            .get_run(tenant_id, run_id)
            .await?)
    }
}
