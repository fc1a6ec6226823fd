//! Run-scoped data: configuration, per-node results, aggregate metrics,
//! artifacts, and the final report.
//!
//! A [`Run`] is one execution instance of a graph version. It exclusively
//! owns its [`NodeResult`]s and its [`Artifact`]; the graph itself is shared
//! read-only. Runs are append-only once terminal — replay never mutates the
//! original, it creates a new run referencing it via `replay_of`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::assertions::{AssertionSummary, Verdict};
use crate::contracts::ContractOutcome;
use crate::model::{ChaosConfig, ExecutionPolicy};
use crate::types::{ExecutionMode, NodeStatus, NodeType, RunState};

/// Execution configuration for one run.
///
/// Provider/model pins, the deterministic seed, tenant scope, chaos settings,
/// and scheduling limits. Defaults for the limits resolve from the
/// environment (`GAUNTLET_MAX_CONCURRENCY`, `GAUNTLET_NODE_TIMEOUT_MS`) so
/// deployments can tune them without code changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Tenant the run is scoped to; supplied by the external auth layer.
    pub tenant_id: String,
    /// Seed driving chaos decisions and deterministic providers.
    pub seed: u64,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub chaos: Option<ChaosConfig>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
    /// Per-run cap on concurrently executing nodes.
    pub max_concurrency: usize,
    /// Default per-node time box; node definitions may override.
    pub node_timeout_ms: u64,
    /// Grace period granted to in-flight nodes after a cancel request.
    pub cancel_grace_ms: u64,
    /// TTL of the executor's run lease; renewed between dispatch rounds.
    pub lease_ttl_ms: u64,
}

impl RunConfig {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
    pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_CANCEL_GRACE_MS: u64 = 500;
    pub const DEFAULT_LEASE_TTL_MS: u64 = 60_000;

    /// Config for the given tenant with environment-resolved defaults.
    #[must_use]
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        dotenvy::dotenv().ok();
        Self {
            tenant_id: tenant_id.into(),
            seed: 0,
            mode: ExecutionMode::Normal,
            provider: None,
            model: None,
            chaos: None,
            policy: ExecutionPolicy::default(),
            max_concurrency: env_parse("GAUNTLET_MAX_CONCURRENCY", Self::DEFAULT_MAX_CONCURRENCY),
            node_timeout_ms: env_parse("GAUNTLET_NODE_TIMEOUT_MS", Self::DEFAULT_NODE_TIMEOUT_MS),
            cancel_grace_ms: Self::DEFAULT_CANCEL_GRACE_MS,
            lease_ttl_ms: Self::DEFAULT_LEASE_TTL_MS,
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = Some(chaos);
        self.mode = ExecutionMode::Chaos;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = cap.max(1);
        self
    }

    #[must_use]
    pub fn with_node_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.node_timeout_ms = timeout_ms;
        self
    }

    /// Apply replay overrides, producing `self ⊕ overrides`.
    #[must_use]
    pub fn merged_with(&self, overrides: &ConfigOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(seed) = overrides.seed {
            merged.seed = seed;
        }
        if let Some(mode) = overrides.mode {
            merged.mode = mode;
        }
        if let Some(provider) = &overrides.provider {
            merged.provider = Some(provider.clone());
        }
        if let Some(model) = &overrides.model {
            merged.model = Some(model.clone());
        }
        if let Some(chaos) = &overrides.chaos {
            merged.chaos = Some(chaos.clone());
        }
        if let Some(policy) = &overrides.policy {
            merged.policy = policy.clone();
        }
        if let Some(cap) = overrides.max_concurrency {
            merged.max_concurrency = cap.max(1);
        }
        if let Some(timeout) = overrides.node_timeout_ms {
            merged.node_timeout_ms = timeout;
        }
        merged
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Partial configuration applied on top of an original run during replay.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub chaos: Option<ChaosConfig>,
    #[serde(default)]
    pub policy: Option<ExecutionPolicy>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// True when replay should reproduce the original byte-for-byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Captured result of one node's execution.
///
/// Latency and cost come from the provider adapter rather than engine
/// wall-clock, so a deterministic adapter yields byte-identical results
/// across replays.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Raw output payload (`null` when the node never produced one).
    pub output: Value,
    /// Inputs as resolved at dispatch time, after any chaos perturbation.
    pub resolved_inputs: Value,
    pub latency_ms: f64,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Number of provider invocations, including retries.
    pub attempts: u32,
    #[serde(default)]
    pub contract: Option<ContractOutcome>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NodeResult {
    /// Placeholder result for a node that was never dispatched.
    #[must_use]
    pub fn undispatched(node_id: &str, node_type: NodeType, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type,
            status,
            output: Value::Null,
            resolved_inputs: Value::Null,
            latency_ms: 0.0,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            attempts: 0,
            contract: None,
            error: None,
        }
    }
}

/// Aggregate metrics accumulated over a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub total_latency_ms: f64,
    pub total_cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl RunMetrics {
    pub fn absorb(&mut self, result: &NodeResult) {
        self.total_latency_ms += result.latency_ms;
        self.total_cost_usd += result.cost_usd;
        self.tokens_in += result.tokens_in;
        self.tokens_out += result.tokens_out;
    }
}

/// One execution instance of a graph version.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub graph_id: String,
    pub graph_version: u32,
    pub graph_fingerprint: String,
    pub config: RunConfig,
    pub state: RunState,
    /// Original run id when this run was created by replay.
    #[serde(default)]
    pub replay_of: Option<String>,
    /// Submission idempotency key; a resubmission with the same key returns
    /// the existing run instead of creating a duplicate.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Per-node results, ordered by node id for stable serialization.
    #[serde(default)]
    pub results: BTreeMap<String, NodeResult>,
    #[serde(default)]
    pub verdicts: Vec<Verdict>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    #[must_use]
    pub fn new(
        id: String,
        graph_id: String,
        graph_version: u32,
        graph_fingerprint: String,
        config: RunConfig,
    ) -> Self {
        Self {
            id,
            graph_id,
            graph_version,
            graph_fingerprint,
            config,
            state: RunState::Queued,
            replay_of: None,
            idempotency_key: None,
            results: BTreeMap::new(),
            verdicts: Vec::new(),
            metrics: RunMetrics::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Final report, separating execution outcome from test verdict.
    #[must_use]
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.id.clone(),
            state: self.state,
            execution_failed: matches!(self.state, RunState::Failed),
            assertion_summary: AssertionSummary::from_verdicts(&self.verdicts),
            verdicts: self.verdicts.clone(),
            metrics: self.metrics.clone(),
            error: self.error.clone(),
        }
    }
}

/// User-facing outcome of a run.
///
/// "Execution failed" (the engine could not produce results) and
/// "assertions failed" (results did not meet test criteria) are distinct and
/// both preserved here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub execution_failed: bool,
    pub assertion_summary: AssertionSummary,
    pub verdicts: Vec<Verdict>,
    pub metrics: RunMetrics,
    #[serde(default)]
    pub error: Option<String>,
}

/// Immutable persisted trace of a run, keyed by run id.
///
/// The `trace` payload deliberately excludes wall-clock timestamps so that
/// deterministic replays of the same seed produce byte-identical artifacts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub run_id: String,
    pub graph_id: String,
    pub graph_version: u32,
    pub graph_fingerprint: String,
    pub seed: u64,
    pub mode: ExecutionMode,
    pub recorded_at: DateTime<Utc>,
    pub trace: Value,
}

impl Artifact {
    /// Snapshot a run's full trace (inputs, outputs, verdicts, metrics).
    #[must_use]
    pub fn from_run(run: &Run) -> Self {
        let trace = serde_json::json!({
            "results": run.results,
            "verdicts": run.verdicts,
            "metrics": run.metrics,
            "state": run.state,
        });
        Self {
            run_id: run.id.clone(),
            graph_id: run.graph_id.clone(),
            graph_version: run.graph_version,
            graph_fingerprint: run.graph_fingerprint.clone(),
            seed: run.config.seed,
            mode: run.config.mode,
            recorded_at: Utc::now(),
            trace,
        }
    }
}
