use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assertions::AssertionSummary;
use crate::chaos::ChaosEvent;
use crate::types::{ExecutionMode, NodeStatus, RunState};

/// A lifecycle event emitted during run execution.
///
/// Events are observational: consumers can log, stream, or aggregate them,
/// but nothing in the engine depends on a sink having processed one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        graph_id: String,
        mode: ExecutionMode,
        seed: u64,
    },
    NodeStarted {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeFinished {
        run_id: String,
        node_id: String,
        status: NodeStatus,
        attempts: u32,
        latency_ms: f64,
    },
    NodeRetrying {
        run_id: String,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
        reason: String,
    },
    NodeSkipped {
        run_id: String,
        node_id: String,
        reason: String,
    },
    ContractViolated {
        run_id: String,
        node_id: String,
        contract_id: String,
        violations: usize,
    },
    ChaosInjected {
        run_id: String,
        #[serde(flatten)]
        event: ChaosEvent,
    },
    RunPaused {
        run_id: String,
    },
    RunResumed {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        state: RunState,
        assertions: AssertionSummary,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeFinished { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeSkipped { run_id, .. }
            | Self::ContractViolated { run_id, .. }
            | Self::ChaosInjected { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunResumed { run_id }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Stable kind label, matching the serialized tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeFinished { .. } => "node_finished",
            Self::NodeRetrying { .. } => "node_retrying",
            Self::NodeSkipped { .. } => "node_skipped",
            Self::ContractViolated { .. } => "contract_violated",
            Self::ChaosInjected { .. } => "chaos_injected",
            Self::RunPaused { .. } => "run_paused",
            Self::RunResumed { .. } => "run_resumed",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                run_id,
                graph_id,
                mode,
                seed,
            } => write!(f, "{run_id} started graph={graph_id} mode={mode} seed={seed}"),
            Self::NodeStarted {
                run_id,
                node_id,
                attempt,
            } => write!(f, "{run_id} node={node_id} attempt={attempt} started"),
            Self::NodeFinished {
                run_id,
                node_id,
                status,
                attempts,
                latency_ms,
            } => write!(
                f,
                "{run_id} node={node_id} finished status={status} attempts={attempts} latency={latency_ms}ms"
            ),
            Self::NodeRetrying {
                run_id,
                node_id,
                attempt,
                backoff_ms,
                reason,
            } => write!(
                f,
                "{run_id} node={node_id} retrying attempt={attempt} backoff={backoff_ms}ms: {reason}"
            ),
            Self::NodeSkipped {
                run_id,
                node_id,
                reason,
            } => write!(f, "{run_id} node={node_id} skipped: {reason}"),
            Self::ContractViolated {
                run_id,
                node_id,
                contract_id,
                violations,
            } => write!(
                f,
                "{run_id} node={node_id} violated contract={contract_id} violations={violations}"
            ),
            Self::ChaosInjected { run_id, event } => write!(
                f,
                "{run_id} chaos node={} source={} attempt={}",
                event.node_id, event.source, event.attempt
            ),
            Self::RunPaused { run_id } => write!(f, "{run_id} paused"),
            Self::RunResumed { run_id } => write!(f, "{run_id} resumed"),
            Self::RunFinished {
                run_id,
                state,
                assertions,
            } => write!(
                f,
                "{run_id} finished state={state} assertions={}/{} passed",
                assertions.passed, assertions.total
            ),
        }
    }
}
