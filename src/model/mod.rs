//! Graph definition model: the serde-facing shapes for behavioral graphs.
//!
//! A [`GraphDef`] is the untrusted, wire-level description of a behavioral
//! test graph (YAML or JSON). It is parsed here and statically checked by
//! [`validator::validate`] into a [`validator::ValidatedGraph`] before any
//! run is created. Definitions are immutable once referenced by a run; edits
//! produce a new version.

pub mod validator;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};

use crate::assertions::AssertionCheck;
use crate::types::{ExecutionMode, FieldType, NodeType};

pub use validator::{GraphValidationError, ValidatedGraph, validate};

/// Wire-level behavioral graph definition.
///
/// # Examples
///
/// ```rust
/// use gauntlet::model::GraphDef;
///
/// let def = GraphDef::from_yaml(r#"
/// id: smoke
/// name: Smoke test
/// nodes:
///   - id: greeter
///     type: responder
/// edges: []
/// "#).unwrap();
/// assert_eq!(def.nodes.len(), 1);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GraphDef {
    pub id: String,
    pub name: String,
    /// Monotonic definition version; a run pins the version it executed.
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
    #[serde(default)]
    pub contracts: Vec<ContractDef>,
    #[serde(default)]
    pub assertions: Vec<AssertionDef>,
    #[serde(default)]
    pub execution_config: Option<ExecutionConfig>,
}

fn default_version() -> u32 {
    1
}

impl GraphDef {
    /// Parse a graph definition from YAML.
    pub fn from_yaml(text: &str) -> Result<Self, GraphDefError> {
        serde_yaml::from_str(text).map_err(GraphDefError::Yaml)
    }

    /// Parse a graph definition from JSON.
    pub fn from_json(text: &str) -> Result<Self, GraphDefError> {
        serde_json::from_str(text).map_err(GraphDefError::Json)
    }

    /// Deterministic fingerprint of the definition, used for version pinning
    /// in artifacts and replay.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{}:{}", self.id, self.version));
        let mut hasher = rustc_hash::FxHasher::default();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Parse errors for graph definition files.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum GraphDefError {
    #[error("invalid YAML graph definition: {0}")]
    #[diagnostic(
        code(gauntlet::model::yaml),
        help("Check indentation and that assertion/contract blocks match the documented shape.")
    )]
    Yaml(#[source] serde_yaml::Error),

    #[error("invalid JSON graph definition: {0}")]
    #[diagnostic(code(gauntlet::model::json))]
    Json(#[source] serde_json::Error),
}

/// One agent step in the graph.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Free-form per-node configuration handed to the provider adapter.
    #[serde(default)]
    pub config: FxHashMap<String, Value>,
    /// Ids of nodes whose outputs this node consumes.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// A critical node's failure or timeout fails the whole run.
    #[serde(default)]
    pub critical: bool,
    /// Per-node timeout override; run-level default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Directed edge used for execution ordering.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
}

/// Constraint on a single declared output field.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub field_type: Option<FieldType>,
    /// Inclusive numeric lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Minimum length for strings and arrays.
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Maximum length for strings and arrays.
    #[serde(default)]
    pub max_length: Option<usize>,
}

/// Recursive structural schema for object-valued fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaSpec {
    #[serde(rename = "type", default)]
    pub value_type: Option<FieldType>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: FxHashMap<String, SchemaSpec>,
}

/// Data contract on a node's produced output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractDef {
    pub id: String,
    /// Node whose output this contract constrains.
    pub source: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Per-field type and bound constraints.
    #[serde(default)]
    pub fields: FxHashMap<String, FieldSpec>,
    /// Optional structural schema applied to the whole output.
    #[serde(default)]
    pub schema: Option<SchemaSpec>,
}

/// Pass/fail check over node outputs or run aggregates.
///
/// The check payload is an internally tagged union keyed by `type`, so a
/// malformed shape (wrong fields for the declared kind) is rejected during
/// deserialization and the scheduler never sees it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssertionDef {
    pub id: String,
    /// Node whose output (or recorded metrics) the assertion reads.
    pub target: String,
    /// Dot-notation path into the target output; defaults to `response`.
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(flatten)]
    pub check: AssertionCheck,
}

fn default_field() -> String {
    "response".to_string()
}

/// Graph-level execution defaults, overridable per run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub chaos_config: Option<ChaosConfig>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

/// Failure-handling policy for a graph's execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPolicy {
    /// Dispatch dependents even when an upstream node failed.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Readiness accepts any terminal upstream status, and skipped upstreams
    /// resolve to null inputs instead of blocking dependents.
    #[serde(default)]
    pub allow_partial_inputs: bool,
    /// A failing assertion marks the run `failed` instead of `completed`.
    #[serde(default)]
    pub fail_run_on_assertion: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Bounded retry with exponential backoff for provider errors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Timeouts are not retried unless explicitly enabled.
    #[serde(default)]
    pub retry_timeouts: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            retry_timeouts: false,
        }
    }
}

/// Chaos-mode fault injection settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChaosConfig {
    /// Probability an edge traversal replaces the input with null.
    #[serde(default)]
    pub drop_rate: f64,
    /// Probability an edge traversal corrupts one input field.
    #[serde(default)]
    pub corrupt_rate: f64,
    #[serde(default)]
    pub latency_injection: LatencyInjection,
}

/// Artificial delay injected before node dispatch.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyInjection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_delay_ms: u64,
}
