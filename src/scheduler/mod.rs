//! Run scheduling: claim, dispatch, supervise, finalize.
//!
//! The [`Scheduler`] turns a validated graph plus a [`RunConfig`] into a
//! finished [`RunReport`]. Execution is single-writer per run (guarded by a
//! registry lease), dispatches ready nodes concurrently up to the run's
//! cap, and reacts to pause/resume/cancel signals delivered through a
//! [`RunHandle`].
//!
//! The dispatch loop itself lives in [`executor`]; this module owns the
//! public surface and run lifecycle bookkeeping around it.

pub mod executor;

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::assertions::{AssertionEngine, SemanticScorer};
use crate::event_bus::{EventEmitter, NullEmitter};
use crate::model::ValidatedGraph;
use crate::provider::ProviderAdapter;
use crate::registry::{RegistryError, RunRegistry};
use crate::run::{Run, RunConfig, RunReport};
use crate::storage::StoreError;
use crate::utils::id_generator::IdGenerator;

use executor::Executor;

/// Operator signal applied to a running execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Control {
    /// Normal dispatch (also the resume signal after a pause).
    #[default]
    Run,
    /// Stop dispatching new nodes; in-flight nodes keep draining.
    Pause,
    /// Stop the run: bounded grace for in-flight work, then abort.
    Cancel,
}

/// Failures of the scheduling layer itself (node failures are recorded in
/// results, not surfaced here).
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("run '{run_id}' was recorded against graph fingerprint {expected}, got {actual}")]
    #[diagnostic(
        code(gauntlet::scheduler::graph_mismatch),
        help("a run executes only against the exact definition version it was submitted for")
    )]
    GraphMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("run '{run_id}' is not claimable in state {state}")]
    #[diagnostic(
        code(gauntlet::scheduler::not_claimable),
        help("only queued runs can be claimed for execution")
    )]
    NotClaimable { run_id: String, state: String },

    #[error("execution task for run '{run_id}' panicked")]
    #[diagnostic(code(gauntlet::scheduler::task_panic))]
    TaskPanic { run_id: String },
}

/// Handle to a spawned run: control signals plus completion.
pub struct RunHandle {
    run_id: String,
    control: watch::Sender<Control>,
    join: JoinHandle<Result<RunReport, SchedulerError>>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request a pause. In-flight nodes drain; nothing new dispatches.
    pub fn pause(&self) {
        let _ = self.control.send(Control::Pause);
    }

    /// Resume dispatch after a pause.
    pub fn resume(&self) {
        let _ = self.control.send(Control::Run);
    }

    /// Request cancellation. The executor grants in-flight nodes the run's
    /// grace period, then aborts them.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel);
    }

    /// Wait for the run to finish and take its report.
    pub async fn wait(self) -> Result<RunReport, SchedulerError> {
        let run_id = self.run_id;
        self.join
            .await
            .map_err(|_| SchedulerError::TaskPanic { run_id })?
    }
}

/// Orchestrates run execution over a registry, provider, and event bus.
#[derive(Clone)]
pub struct Scheduler {
    registry: RunRegistry,
    provider: Arc<dyn ProviderAdapter>,
    engine: AssertionEngine,
    emitter: Arc<dyn EventEmitter>,
    ids: IdGenerator,
    executor_id: String,
}

impl Scheduler {
    #[must_use]
    pub fn new(registry: RunRegistry, provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            registry,
            provider,
            engine: AssertionEngine::new(),
            emitter: Arc::new(NullEmitter),
            ids: IdGenerator::new(),
            executor_id: format!("exec-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Route lifecycle events to the given emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Swap the semantic scorer used for similarity assertions.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.engine = AssertionEngine::with_scorer(scorer);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Create and register a queued run for the graph.
    ///
    /// With an idempotency key, a duplicate submission returns the already
    /// registered run.
    #[instrument(skip_all, fields(graph_id = %graph.def().id))]
    pub async fn submit(
        &self,
        graph: &ValidatedGraph,
        config: RunConfig,
        idempotency_key: Option<String>,
    ) -> Result<Run, SchedulerError> {
        let def = graph.def();
        let mut run = Run::new(
            self.ids.generate_run_id(),
            def.id.clone(),
            def.version,
            def.fingerprint(),
            config,
        );
        run.idempotency_key = idempotency_key;
        let run = self.registry.register(run).await?;
        info!(run_id = %run.id, "run submitted");
        Ok(run)
    }

    /// Execute a queued run to completion on the current task.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn execute(
        &self,
        graph: &ValidatedGraph,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<RunReport, SchedulerError> {
        // Keep the sender alive so the control channel stays open for the
        // duration of the run, even though nothing signals through it.
        let (_control, receiver) = watch::channel(Control::Run);
        self.execute_with_control(graph.clone(), tenant_id.to_string(), run_id.to_string(), receiver)
            .await
    }

    /// Spawn a run onto the runtime, returning a control handle.
    #[must_use]
    pub fn spawn(&self, graph: ValidatedGraph, tenant_id: String, run_id: String) -> RunHandle {
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let scheduler = self.clone();
        let id_for_handle = run_id.clone();
        let join = tokio::spawn(async move {
            scheduler
                .execute_with_control(graph, tenant_id, run_id, control_rx)
                .await
        });
        RunHandle {
            run_id: id_for_handle,
            control: control_tx,
            join,
        }
    }

    /// Submit and execute in one step. Convenience for embedded use.
    pub async fn run_graph(
        &self,
        graph: &ValidatedGraph,
        config: RunConfig,
    ) -> Result<RunReport, SchedulerError> {
        let tenant = config.tenant_id.clone();
        let run = self.submit(graph, config, None).await?;
        self.execute(graph, &tenant, &run.id).await
    }

    async fn execute_with_control(
        &self,
        graph: ValidatedGraph,
        tenant_id: String,
        run_id: String,
        control: watch::Receiver<Control>,
    ) -> Result<RunReport, SchedulerError> {
        let run = self.registry.store().get_run(&tenant_id, &run_id).await?;
        let actual = graph.def().fingerprint();
        if run.graph_fingerprint != actual {
            return Err(SchedulerError::GraphMismatch {
                run_id,
                expected: run.graph_fingerprint,
                actual,
            });
        }
        if run.state != crate::types::RunState::Queued {
            return Err(SchedulerError::NotClaimable {
                run_id,
                state: run.state.to_string(),
            });
        }

        let executor = Executor::new(
            self.registry.clone(),
            Arc::clone(&self.provider),
            self.engine.clone(),
            Arc::clone(&self.emitter),
            self.executor_id.clone(),
            graph,
            tenant_id,
            run_id,
            control,
        );
        executor.run_to_completion().await
    }
}
