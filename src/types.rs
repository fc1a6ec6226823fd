//! Core types for the gauntlet behavioral graph engine.
//!
//! This module defines the fundamental vocabulary used throughout the system:
//! node capability tags, run and node lifecycle states, execution modes, and
//! the closed set of contract field types.
//!
//! For runtime execution types (run configuration, results, artifacts), see
//! [`crate::run`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability tag for an agent node.
///
/// Every node in a behavioral graph declares what kind of agent step it is.
/// The tag drives provider dispatch: adapters register one handler per type
/// in a lookup table rather than branching on strings throughout the engine.
///
/// # Examples
///
/// ```rust
/// use gauntlet::types::NodeType;
///
/// let t: NodeType = serde_json::from_str("\"classifier\"").unwrap();
/// assert_eq!(t, NodeType::Classifier);
/// assert_eq!(t.to_string(), "classifier");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Classifier,
    Responder,
    Retriever,
    Reranker,
    Generator,
    Planner,
    Executor,
    Synthesizer,
    Validator,
    Aggregator,
    Negotiator,
    /// Deterministic stand-in used in tests and replay baselines.
    Mock,
}

impl NodeType {
    /// Stable string form, matching the serde encoding.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Classifier => "classifier",
            NodeType::Responder => "responder",
            NodeType::Retriever => "retriever",
            NodeType::Reranker => "reranker",
            NodeType::Generator => "generator",
            NodeType::Planner => "planner",
            NodeType::Executor => "executor",
            NodeType::Synthesizer => "synthesizer",
            NodeType::Validator => "validator",
            NodeType::Aggregator => "aggregator",
            NodeType::Negotiator => "negotiator",
            NodeType::Mock => "mock",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a run.
///
/// Legal transitions form a small state machine:
/// `Queued → Running → {Completed, Failed, Cancelled}`, with
/// `Running ⇄ Paused` as a permitted detour. The [`crate::registry::RunRegistry`]
/// is the single writer of these transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Whether the state is terminal (no further transitions allowed).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Whether `self → to` is a legal transition.
    ///
    /// `Running → Queued` is the orphan-requeue path used by recovery.
    #[must_use]
    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal status of a single node's execution within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Output produced and contract check (if any) passed.
    Ok,
    /// Output produced but failed a declared contract.
    ContractViolation,
    /// Provider returned a terminal error after retries were exhausted.
    ProviderError,
    /// The node invocation exceeded its time box.
    Timeout,
    /// Never dispatched because an upstream dependency failed.
    Skipped,
    /// In flight when the run was cancelled.
    Cancelled,
}

impl NodeStatus {
    /// Whether this status satisfies strict downstream readiness.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, NodeStatus::Ok)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Ok => "ok",
            NodeStatus::ContractViolation => "contract_violation",
            NodeStatus::ProviderError => "provider_error",
            NodeStatus::Timeout => "timeout",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Execution mode selected by a run's configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    /// Re-execution of a prior run with pinned seed/provider/graph version.
    Replay,
    /// Seed-driven fault injection on edge traversals.
    Chaos,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Normal => "normal",
            ExecutionMode::Replay => "replay",
            ExecutionMode::Chaos => "chaos",
        };
        f.write_str(s)
    }
}

/// Closed set of declared contract field types.
///
/// Contracts may only declare these types; anything else is rejected at
/// graph validation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Check a JSON value against this declared type.
    #[must_use]
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_state_transitions() {
        assert!(RunState::Queued.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Paused));
        assert!(RunState::Paused.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Queued));
        assert!(!RunState::Completed.can_transition_to(RunState::Running));
        assert!(!RunState::Queued.can_transition_to(RunState::Completed));
        assert!(!RunState::Cancelled.can_transition_to(RunState::Queued));
    }

    #[test]
    fn field_type_matches() {
        assert!(FieldType::String.matches(&json!("x")));
        assert!(FieldType::Number.matches(&json!(1.5)));
        assert!(FieldType::Boolean.matches(&json!(true)));
        assert!(FieldType::Array.matches(&json!([1])));
        assert!(FieldType::Object.matches(&json!({"a": 1})));
        assert!(!FieldType::Number.matches(&json!("1")));
    }

    #[test]
    fn node_type_round_trip() {
        for t in [
            NodeType::Classifier,
            NodeType::Negotiator,
            NodeType::Mock,
            NodeType::Aggregator,
        ] {
            let s = serde_json::to_string(&t).unwrap();
            assert_eq!(s, format!("\"{t}\""));
            let back: NodeType = serde_json::from_str(&s).unwrap();
            assert_eq!(back, t);
        }
    }
}
