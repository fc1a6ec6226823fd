//! The per-run execution loop.
//!
//! One executor owns one claimed run from lease acquisition to terminal
//! state. Ready nodes (all dependencies settled) dispatch onto a
//! [`JoinSet`] up to the run's concurrency cap, in ascending node-id order;
//! results are absorbed as they land, checkpointed after every change, and
//! failures cascade to dependents according to the run's policy.
//!
//! Node attempts are idempotent: a completed attempt is recorded in the
//! registry's dispatch cache under `(run, node)` and a re-claimed run reuses
//! the cached result instead of re-invoking the provider.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, instrument, warn};

use super::{Control, SchedulerError};
use crate::assertions::{AssertionEngine, AssertionSummary};
use crate::chaos::{ChaosAction, ChaosEvent, ChaosInjector};
use crate::contracts::ContractValidator;
use crate::event_bus::{EventEmitter, RunEvent};
use crate::model::{ContractDef, NodeDef, RetryPolicy, ValidatedGraph};
use crate::provider::{NodeInvocation, ProviderAdapter};
use crate::registry::{RunRegistry, dispatch_key};
use crate::run::{Artifact, NodeResult, Run, RunMetrics};
use crate::storage::StoreError;
use crate::types::{ExecutionMode, NodeStatus, RunState};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    InFlight,
    Done,
}

pub(crate) struct Executor {
    registry: RunRegistry,
    provider: Arc<dyn ProviderAdapter>,
    engine: AssertionEngine,
    emitter: Arc<dyn EventEmitter>,
    executor_id: String,
    graph: ValidatedGraph,
    tenant_id: String,
    run_id: String,
    control: watch::Receiver<Control>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: RunRegistry,
        provider: Arc<dyn ProviderAdapter>,
        engine: AssertionEngine,
        emitter: Arc<dyn EventEmitter>,
        executor_id: String,
        graph: ValidatedGraph,
        tenant_id: String,
        run_id: String,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            registry,
            provider,
            engine,
            emitter,
            executor_id,
            graph,
            tenant_id,
            run_id,
            control,
        }
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.emitter.emit(event);
    }

    /// Claim the run and drive it to a terminal state.
    #[instrument(skip_all, fields(run_id = %self.run_id, executor = %self.executor_id))]
    pub(crate) async fn run_to_completion(mut self) -> Result<crate::run::RunReport, SchedulerError> {
        let store = self.registry.store();
        let queued = store.get_run(&self.tenant_id, &self.run_id).await?;
        let ttl = Duration::from_millis(queued.config.lease_ttl_ms);

        let mut lease = self
            .registry
            .locks()
            .acquire(&self.run_id, &self.executor_id, ttl)
            .await?;

        let mut run = self
            .registry
            .transition(&self.tenant_id, &self.run_id, RunState::Running)
            .await?;
        self.emit(RunEvent::RunStarted {
            run_id: run.id.clone(),
            graph_id: run.graph_id.clone(),
            mode: run.config.mode,
            seed: run.config.seed,
        });

        let chaos = self.chaos_injector(&run);

        let mut slots: FxHashMap<String, Slot> = self
            .graph
            .topo_order()
            .iter()
            .map(|id| (id.clone(), Slot::Pending))
            .collect();
        let mut join_set: JoinSet<NodeResult> = JoinSet::new();
        let mut paused = false;
        let mut cancelling = false;
        let mut failure: Option<String> = None;
        let mut control_open = true;

        loop {
            self.apply_control(&mut run, &mut paused, &mut cancelling)
                .await?;
            if cancelling {
                break;
            }

            if !paused && failure.is_none() {
                self.dispatch_ready(
                    &mut run,
                    &mut slots,
                    &mut join_set,
                    chaos.as_ref(),
                    &mut failure,
                )
                .await?;
            }

            let all_done = slots.values().all(|s| *s == Slot::Done);
            if all_done && join_set.is_empty() {
                break;
            }
            if failure.is_some() && join_set.is_empty() {
                break;
            }

            lease = self.registry.locks().renew(&lease, ttl).await?;

            let waited = {
                let control = &mut self.control;
                tokio::select! {
                    changed = control.changed(), if control_open => Waited::Control(changed.is_ok()),
                    joined = join_set.join_next(), if !join_set.is_empty() => Waited::Joined(joined),
                    else => Waited::Idle,
                }
            };
            match waited {
                Waited::Control(open) => {
                    control_open = open;
                    // A dropped handle can never resume or cancel this run;
                    // treat the closed channel as a cancel request so a
                    // paused run does not wait forever.
                    if !open {
                        cancelling = true;
                    }
                }
                Waited::Joined(Some(Ok(result))) => {
                    self.absorb(&mut run, &mut slots, result, &mut failure).await?;
                }
                Waited::Joined(Some(Err(e))) => {
                    warn!(error = %e, "node task aborted or panicked");
                    failure = Some("node task aborted unexpectedly".to_string());
                }
                Waited::Joined(None) => {}
                Waited::Idle => tokio::task::yield_now().await,
            }
        }

        // Bounded grace for in-flight work, then hard abort.
        let grace = Duration::from_millis(run.config.cancel_grace_ms);
        self.drain_with_grace(&mut run, &mut slots, &mut join_set, grace, &mut failure)
            .await?;

        let leftover_status = if cancelling {
            NodeStatus::Cancelled
        } else {
            NodeStatus::Skipped
        };
        self.settle_remaining(&mut run, &mut slots, leftover_status)
            .await?;

        // Re-total metrics in node-id order; float sums must not depend on
        // completion order.
        run.metrics = RunMetrics::default();
        for result in run.results.values() {
            run.metrics.absorb(result);
        }

        run.verdicts = self
            .engine
            .evaluate_all(self.graph.assertions(), &run.results)
            .await;
        let summary = AssertionSummary::from_verdicts(&run.verdicts);

        let final_state = if cancelling {
            RunState::Cancelled
        } else if failure.is_some() {
            RunState::Failed
        } else if run.config.policy.fail_run_on_assertion && !summary.all_passed() {
            failure = Some(format!(
                "{} of {} assertions failed",
                summary.failed, summary.total
            ));
            RunState::Failed
        } else {
            RunState::Completed
        };

        run.error = failure;
        self.registry.checkpoint(&run).await?;
        if paused && final_state != RunState::Cancelled {
            self.registry
                .transition(&self.tenant_id, &self.run_id, RunState::Running)
                .await?;
        }
        run = self
            .registry
            .transition(&self.tenant_id, &self.run_id, final_state)
            .await?;

        match store
            .put_artifact(&self.tenant_id, Artifact::from_run(&run))
            .await
        {
            Ok(()) | Err(StoreError::ArtifactExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.emit(RunEvent::RunFinished {
            run_id: run.id.clone(),
            state: run.state,
            assertions: summary,
        });
        self.registry.locks().release(&lease).await?;
        Ok(run.report())
    }

    /// Chaos applies whenever the run carries a chaos config, so a replay
    /// of a chaos run re-injects the exact same faults. Chaos mode without
    /// an explicit config falls back to the graph's.
    fn chaos_injector(&self, run: &Run) -> Option<ChaosInjector> {
        let config = run.config.chaos.clone().or_else(|| {
            if run.config.mode == ExecutionMode::Chaos {
                Some(
                    self.graph
                        .def()
                        .execution_config
                        .as_ref()
                        .and_then(|c| c.chaos_config.clone())
                        .unwrap_or_default(),
                )
            } else {
                None
            }
        })?;
        Some(ChaosInjector::new(run.config.seed, config))
    }

    /// React to the latest control signal, keeping run state in sync.
    async fn apply_control(
        &self,
        run: &mut Run,
        paused: &mut bool,
        cancelling: &mut bool,
    ) -> Result<(), SchedulerError> {
        let signal = *self.control.borrow();
        match signal {
            Control::Pause if !*paused && !*cancelling => {
                *run = self
                    .registry
                    .transition(&self.tenant_id, &self.run_id, RunState::Paused)
                    .await?;
                *paused = true;
                self.emit(RunEvent::RunPaused {
                    run_id: run.id.clone(),
                });
            }
            Control::Run if *paused => {
                *run = self
                    .registry
                    .transition(&self.tenant_id, &self.run_id, RunState::Running)
                    .await?;
                *paused = false;
                self.emit(RunEvent::RunResumed {
                    run_id: run.id.clone(),
                });
            }
            Control::Cancel if !*cancelling => {
                *cancelling = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// Dispatch every ready pending node, skipping nodes whose upstream
    /// failed when the policy forbids partial execution. Iterates in
    /// topological order so skip cascades settle in a single pass.
    async fn dispatch_ready(
        &self,
        run: &mut Run,
        slots: &mut FxHashMap<String, Slot>,
        join_set: &mut JoinSet<NodeResult>,
        chaos: Option<&ChaosInjector>,
        failure: &mut Option<String>,
    ) -> Result<(), SchedulerError> {
        let order: Vec<String> = self.graph.topo_order().to_vec();
        for id in order {
            if slots[&id] != Slot::Pending {
                continue;
            }
            let deps = self.graph.dependencies_of(&id);
            if !deps.iter().all(|d| slots[d] == Slot::Done) {
                continue;
            }

            let policy = &run.config.policy;
            let degraded: Vec<&String> = deps
                .iter()
                .filter(|d| !run.results[d.as_str()].status.is_ok())
                .collect();
            if !degraded.is_empty() && !policy.continue_on_error && !policy.allow_partial_inputs {
                let node = self.graph.node(&id).expect("validated node");
                let reason = format!("upstream '{}' did not complete", degraded[0]);
                let mut result =
                    NodeResult::undispatched(&id, node.node_type, NodeStatus::Skipped);
                result.error = Some(reason.clone());
                self.emit(RunEvent::NodeSkipped {
                    run_id: run.id.clone(),
                    node_id: id.clone(),
                    reason: reason.clone(),
                });
                slots.insert(id.clone(), Slot::Done);
                run.results.insert(id.clone(), result);
                // Only a critical node dooms the run; ordinary skip cascades
                // settle in node statuses and the run still completes.
                if failure.is_none() && node.critical {
                    *failure = Some(format!("critical node '{id}' skipped: {reason}"));
                }
                self.registry.checkpoint(run).await?;
                continue;
            }

            if join_set.len() >= run.config.max_concurrency {
                break;
            }

            let node = self.graph.node(&id).expect("validated node").clone();
            let base_inputs: Vec<(String, Value)> = deps
                .iter()
                .map(|d| {
                    let result = &run.results[d.as_str()];
                    let value = if result.status.is_ok() {
                        result.output.clone()
                    } else {
                        Value::Null
                    };
                    (d.clone(), value)
                })
                .collect();

            let spec = NodeTaskSpec {
                run_id: run.id.clone(),
                seed: run.config.seed,
                model: run.config.model.clone(),
                contracts: self
                    .graph
                    .contracts_for(&id)
                    .into_iter()
                    .cloned()
                    .collect(),
                base_inputs,
                chaos: chaos.cloned(),
                retry: run.config.policy.retry.clone(),
                timeout_ms: node.timeout_ms.unwrap_or(run.config.node_timeout_ms),
                node,
            };
            debug!(node_id = %id, "dispatching node");
            slots.insert(id, Slot::InFlight);
            join_set.spawn(run_node(
                spec,
                Arc::clone(&self.provider),
                self.registry.clone(),
                Arc::clone(&self.emitter),
            ));
        }
        Ok(())
    }

    /// Record a finished node and decide whether the run can still succeed.
    async fn absorb(
        &self,
        run: &mut Run,
        slots: &mut FxHashMap<String, Slot>,
        result: NodeResult,
        failure: &mut Option<String>,
    ) -> Result<(), SchedulerError> {
        let id = result.node_id.clone();
        slots.insert(id.clone(), Slot::Done);
        run.metrics.absorb(&result);

        self.emit(RunEvent::NodeFinished {
            run_id: run.id.clone(),
            node_id: id.clone(),
            status: result.status,
            attempts: result.attempts,
            latency_ms: result.latency_ms,
        });
        if let Some(contract) = &result.contract
            && !contract.is_ok()
        {
            self.emit(RunEvent::ContractViolated {
                run_id: run.id.clone(),
                node_id: id.clone(),
                contract_id: contract.contract_id.clone(),
                violations: contract.violations.len(),
            });
        }

        // Run-level failure is reserved for critical nodes and a terminal
        // node that times out; other node failures stay in the results.
        if !result.status.is_ok() && failure.is_none() {
            let node = self.graph.node(&id).expect("validated node");
            if node.critical {
                *failure = Some(format!("critical node '{id}' ended {}", result.status));
            } else if result.status == NodeStatus::Timeout && self.graph.is_terminal(&id) {
                *failure = Some(format!("terminal node '{id}' timed out"));
            }
        }

        run.results.insert(id, result);
        self.registry.checkpoint(run).await?;
        Ok(())
    }

    /// Drain in-flight nodes within the grace window, then abort stragglers.
    async fn drain_with_grace(
        &self,
        run: &mut Run,
        slots: &mut FxHashMap<String, Slot>,
        join_set: &mut JoinSet<NodeResult>,
        grace: Duration,
        failure: &mut Option<String>,
    ) -> Result<(), SchedulerError> {
        if join_set.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + grace;
        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok(result))) => {
                    self.absorb(run, slots, result, failure).await?;
                }
                Ok(Some(Err(_))) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!("grace period elapsed, aborting in-flight nodes");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }
        Ok(())
    }

    /// Record placeholder results for nodes that never got to run.
    async fn settle_remaining(
        &self,
        run: &mut Run,
        slots: &mut FxHashMap<String, Slot>,
        status: NodeStatus,
    ) -> Result<(), SchedulerError> {
        let mut touched = false;
        let order: Vec<String> = self.graph.topo_order().to_vec();
        for id in order {
            if slots[&id] == Slot::Done {
                continue;
            }
            let node = self.graph.node(&id).expect("validated node");
            let mut result = NodeResult::undispatched(&id, node.node_type, status);
            result.error = Some(match status {
                NodeStatus::Cancelled => "run cancelled before dispatch".to_string(),
                _ => "run failed before dispatch".to_string(),
            });
            if status == NodeStatus::Skipped {
                self.emit(RunEvent::NodeSkipped {
                    run_id: run.id.clone(),
                    node_id: id.clone(),
                    reason: "run failed before dispatch".to_string(),
                });
            }
            slots.insert(id.clone(), Slot::Done);
            run.results.insert(id, result);
            touched = true;
        }
        if touched {
            self.registry.checkpoint(run).await?;
        }
        Ok(())
    }
}

enum Waited {
    Control(bool),
    Joined(Option<Result<NodeResult, tokio::task::JoinError>>),
    Idle,
}

struct NodeTaskSpec {
    run_id: String,
    seed: u64,
    model: Option<String>,
    node: NodeDef,
    contracts: Vec<ContractDef>,
    base_inputs: Vec<(String, Value)>,
    chaos: Option<ChaosInjector>,
    retry: RetryPolicy,
    timeout_ms: u64,
}

/// Execute one node: chaos, provider invocation with retries and a time
/// box, then contract checking. Always returns a result; errors become
/// statuses.
async fn run_node(
    spec: NodeTaskSpec,
    provider: Arc<dyn ProviderAdapter>,
    registry: RunRegistry,
    emitter: Arc<dyn EventEmitter>,
) -> NodeResult {
    let cache_key = dispatch_key(&spec.run_id, &spec.node.id, 0);
    if let Some(cached) = registry.cached_dispatch(cache_key).await {
        debug!(node_id = %spec.node.id, "dispatch cache hit, skipping re-execution");
        return cached;
    }

    let result = attempt_loop(&spec, provider.as_ref(), &emitter).await;
    registry.record_dispatch(cache_key, result.clone()).await;
    result
}

async fn attempt_loop(
    spec: &NodeTaskSpec,
    provider: &dyn ProviderAdapter,
    emitter: &Arc<dyn EventEmitter>,
) -> NodeResult {
    let emit = |event: RunEvent| {
        let _ = emitter.emit(event);
    };
    let mut attempt: u32 = 0;
    loop {
        // Chaos decides per attempt, so retried deliveries reroll.
        let mut inputs = serde_json::Map::new();
        for (source, payload) in &spec.base_inputs {
            let mut value = payload.clone();
            if let Some(chaos) = &spec.chaos {
                let (perturbed, event) =
                    chaos.perturb_input(&spec.node.id, source, attempt, value);
                value = perturbed;
                if let Some(event) = event {
                    emit(RunEvent::ChaosInjected {
                        run_id: spec.run_id.clone(),
                        event,
                    });
                }
            }
            inputs.insert(source.clone(), value);
        }
        let resolved_inputs = Value::Object(inputs);

        if attempt == 0 {
            emit(RunEvent::NodeStarted {
                run_id: spec.run_id.clone(),
                node_id: spec.node.id.clone(),
                attempt,
            });
        }

        let invocation = NodeInvocation {
            run_id: spec.run_id.clone(),
            node_id: spec.node.id.clone(),
            node_type: spec.node.node_type,
            config: spec.node.config.clone(),
            inputs: resolved_inputs.clone(),
            attempt,
            seed: spec.seed,
            model: spec.model.clone(),
        };
        let delay = spec
            .chaos
            .as_ref()
            .and_then(|c| c.injected_delay_ms(&spec.node.id, attempt));
        if let Some(delay_ms) = delay {
            emit(RunEvent::ChaosInjected {
                run_id: spec.run_id.clone(),
                event: ChaosEvent {
                    node_id: spec.node.id.clone(),
                    source: "latency".to_string(),
                    attempt,
                    action: ChaosAction::Delayed { delay_ms },
                },
            });
        }
        let invoke = async {
            if let Some(delay_ms) = delay {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            provider.invoke(&invocation).await
        };

        match timeout(Duration::from_millis(spec.timeout_ms), invoke).await {
            Err(_) => {
                if spec.retry.retry_timeouts && attempt < spec.retry.max_retries {
                    backoff_and_emit(spec, attempt, "timed out", &emit).await;
                    attempt += 1;
                    continue;
                }
                let mut result = NodeResult::undispatched(
                    &spec.node.id,
                    spec.node.node_type,
                    NodeStatus::Timeout,
                );
                result.resolved_inputs = resolved_inputs;
                result.attempts = attempt + 1;
                result.error = Some(format!("timed out after {} ms", spec.timeout_ms));
                return result;
            }
            Ok(Err(e)) => {
                if e.is_retryable() && attempt < spec.retry.max_retries {
                    backoff_and_emit(spec, attempt, &e.to_string(), &emit).await;
                    attempt += 1;
                    continue;
                }
                let mut result = NodeResult::undispatched(
                    &spec.node.id,
                    spec.node.node_type,
                    NodeStatus::ProviderError,
                );
                result.resolved_inputs = resolved_inputs;
                result.attempts = attempt + 1;
                result.error = Some(e.to_string());
                return result;
            }
            Ok(Ok(output)) => {
                let validator = ContractValidator::new();
                let mut contract_outcome = None;
                let mut violated = false;
                for contract in &spec.contracts {
                    let outcome = validator.check(contract, &output.payload);
                    if !outcome.is_ok() {
                        violated = true;
                        contract_outcome = Some(outcome);
                        break;
                    }
                    if contract_outcome.is_none() {
                        contract_outcome = Some(outcome);
                    }
                }

                return NodeResult {
                    node_id: spec.node.id.clone(),
                    node_type: spec.node.node_type,
                    status: if violated {
                        NodeStatus::ContractViolation
                    } else {
                        NodeStatus::Ok
                    },
                    output: output.payload,
                    resolved_inputs,
                    latency_ms: output.latency_ms,
                    cost_usd: output.cost_usd,
                    tokens_in: output.tokens_in,
                    tokens_out: output.tokens_out,
                    attempts: attempt + 1,
                    contract: contract_outcome,
                    error: None,
                };
            }
        }
    }
}

async fn backoff_and_emit(
    spec: &NodeTaskSpec,
    attempt: u32,
    reason: &str,
    emit: &impl Fn(RunEvent),
) {
    let backoff_ms = spec
        .retry
        .backoff_ms
        .saturating_mul(1u64 << attempt.min(16));
    emit(RunEvent::NodeRetrying {
        run_id: spec.run_id.clone(),
        node_id: spec.node.id.clone(),
        attempt: attempt + 1,
        backoff_ms,
        reason: reason.to_string(),
    });
    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
}
