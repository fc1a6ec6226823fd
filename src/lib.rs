//! # Gauntlet: Behavioral Graph Execution Engine
//!
//! Gauntlet executes behavioral test graphs: DAGs whose nodes are AI-agent
//! steps (classifiers, retrievers, negotiators, ...) wired together by data
//! dependencies. A run dispatches ready nodes concurrently, checks every
//! output against its declared contracts, evaluates assertions over the
//! results, and records an immutable artifact that can be replayed
//! deterministically.
//!
//! ## Core Concepts
//!
//! - **Graph definitions**: YAML/JSON descriptions of nodes, edges,
//!   contracts, and assertions, statically checked before any run
//! - **Runs**: one execution instance of a graph version, moving through
//!   `queued -> running -> completed/failed/cancelled` with pause in between
//! - **Contracts**: structural constraints on node outputs, enforced before
//!   a result becomes visible to dependents
//! - **Assertions**: the test layer, evaluated after execution; a run can
//!   complete while its assertions fail
//! - **Chaos**: seed-deterministic fault injection (drops, corruption,
//!   latency) on node inputs
//! - **Replay**: re-execute a recorded run with its pinned seed and config,
//!   optionally patched by overrides
//!
//! ## Quick Start
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use gauntlet::model::{GraphDef, validate};
//! use gauntlet::provider::MockProvider;
//! use gauntlet::registry::{InMemoryLockManager, RunRegistry};
//! use gauntlet::run::RunConfig;
//! use gauntlet::scheduler::Scheduler;
//! use gauntlet::storage::InMemoryStore;
//!
//! let graph = validate(GraphDef::from_yaml(r#"
//! id: smoke
//! name: Smoke test
//! nodes:
//!   - {id: classify, type: classifier}
//!   - {id: respond, type: responder, inputs: [classify]}
//! edges:
//!   - {from: classify, to: respond}
//! assertions:
//!   - {id: fast, target: respond, type: latency_under, max_ms: 60000}
//! "#).unwrap()).unwrap();
//!
//! let registry = RunRegistry::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryLockManager::new()),
//! );
//! let scheduler = Scheduler::new(registry, Arc::new(MockProvider::new()));
//! let config = RunConfig::for_tenant("docs").with_seed(7);
//!
//! let report = scheduler.run_graph(&graph, config).await.unwrap();
//! assert!(!report.execution_failed);
//! assert!(report.assertion_summary.all_passed());
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`model`] - Graph definition parsing and static validation
//! - [`contracts`] - Output contract checking
//! - [`assertions`] - Assertion checks, verdicts, and semantic scoring
//! - [`chaos`] - Deterministic fault injection
//! - [`provider`] - Provider adapter seam and the deterministic mock
//! - [`run`] - Run configuration, results, metrics, and artifacts
//! - [`registry`] - Run lifecycle authority, leases, and idempotency
//! - [`scheduler`] - Concurrent dispatch, supervision, and control
//! - [`replay`] - Deterministic re-execution of recorded runs
//! - [`storage`] - Tenant-scoped run and artifact persistence
//! - [`event_bus`] - Lifecycle event fan-out to pluggable sinks
//! - [`telemetry`] - Event/verdict rendering and tracing setup

pub mod assertions;
pub mod chaos;
pub mod contracts;
pub mod event_bus;
pub mod model;
pub mod provider;
pub mod registry;
pub mod replay;
pub mod run;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use assertions::{AssertionCheck, AssertionEngine, AssertionSummary, Verdict};
pub use model::{GraphDef, ValidatedGraph, validate};
pub use run::{Artifact, NodeResult, Run, RunConfig, RunReport};
pub use scheduler::{RunHandle, Scheduler};
pub use types::{ExecutionMode, NodeStatus, NodeType, RunState};
