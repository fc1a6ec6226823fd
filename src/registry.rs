//! Run lifecycle authority: state transitions, leases, idempotency.
//!
//! [`RunRegistry`] is the only writer of [`RunState`]. Every transition goes
//! through one serialized path that checks the legal state machine before
//! persisting, so concurrent submit/cancel/complete races collapse into a
//! well-defined order. The registry also owns:
//!
//! - submission idempotency (same key within a tenant returns the existing
//!   run instead of creating a duplicate),
//! - the per-attempt dispatch cache backing at-least-once node delivery,
//! - TTL leases that make run execution single-writer across processes,
//! - the orphan sweep that recovers runs whose executor died mid-flight.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::run::{NodeResult, Run};
use crate::storage::{RunStore, StoreError};
use crate::types::RunState;

/// Failures from lifecycle or lease operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("illegal run state transition {from} -> {to} for '{run_id}'")]
    #[diagnostic(
        code(gauntlet::registry::invalid_transition),
        help("terminal states never transition; see RunState::can_transition_to")
    )]
    InvalidTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },

    #[error("run '{run_id}' is leased by '{holder}'")]
    #[diagnostic(
        code(gauntlet::registry::lock_contention),
        help("exactly one executor may hold a run's lease; retry after its TTL lapses")
    )]
    LockContention { run_id: String, holder: String },

    #[error("lease on run '{run_id}' expired or was taken over")]
    #[diagnostic(
        code(gauntlet::registry::lease_lost),
        help("renew the lease between dispatch rounds, within its TTL")
    )]
    LeaseLost { run_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// A held TTL lease on a run. The token fences stale holders: renew and
/// release only succeed for the token that currently owns the lock.
#[derive(Clone, Debug)]
pub struct Lease {
    pub run_id: String,
    pub holder: String,
    pub token: u64,
    pub expires_at: Instant,
}

/// Distributed-lock seam guarding single-writer run execution.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        run_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, RegistryError>;

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, RegistryError>;

    async fn release(&self, lease: &Lease) -> Result<(), RegistryError>;

    /// Whether an unexpired lease currently exists for the run.
    async fn is_held(&self, run_id: &str) -> bool;
}

#[derive(Default)]
struct LockTable {
    entries: FxHashMap<String, Lease>,
}

/// Process-local [`LockManager`] with the same TTL and fencing semantics a
/// distributed backend would provide.
#[derive(Default)]
pub struct InMemoryLockManager {
    table: Mutex<LockTable>,
    next_token: AtomicU64,
}

impl InMemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        run_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, RegistryError> {
        let mut table = self.table.lock().await;
        if let Some(existing) = table.entries.get(run_id)
            && existing.expires_at > Instant::now()
        {
            return Err(RegistryError::LockContention {
                run_id: run_id.to_string(),
                holder: existing.holder.clone(),
            });
        }
        let lease = Lease {
            run_id: run_id.to_string(),
            holder: holder.to_string(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            expires_at: Instant::now() + ttl,
        };
        table.entries.insert(run_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, RegistryError> {
        let mut table = self.table.lock().await;
        match table.entries.get_mut(&lease.run_id) {
            Some(current) if current.token == lease.token && current.expires_at > Instant::now() => {
                current.expires_at = Instant::now() + ttl;
                Ok(current.clone())
            }
            _ => Err(RegistryError::LeaseLost {
                run_id: lease.run_id.clone(),
            }),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), RegistryError> {
        let mut table = self.table.lock().await;
        if let Some(current) = table.entries.get(&lease.run_id)
            && current.token == lease.token
        {
            table.entries.remove(&lease.run_id);
        }
        Ok(())
    }

    async fn is_held(&self, run_id: &str) -> bool {
        let table = self.table.lock().await;
        table
            .entries
            .get(run_id)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

/// What the orphan sweep does with a run whose lease lapsed mid-execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Put the run back in the queue for a fresh executor to claim.
    Requeue,
    /// Mark the run failed; an operator decides what happens next.
    Fail,
}

/// Stable idempotency key for one node attempt within a run.
#[must_use]
pub fn dispatch_key(run_id: &str, node_id: &str, attempt: u32) -> u64 {
    let mut hasher = FxHasher::default();
    run_id.hash(&mut hasher);
    node_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
struct RegistryState {
    // (tenant_id, idempotency_key) -> run_id
    submissions: FxHashMap<(String, String), String>,
    // dispatch_key -> completed result, backing at-least-once delivery
    dispatches: FxHashMap<u64, NodeResult>,
}

/// Sole authority over run state, backed by a [`RunStore`] and a
/// [`LockManager`].
#[derive(Clone)]
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
    locks: Arc<dyn LockManager>,
    // One mutex serializes every state transition.
    state: Arc<Mutex<RegistryState>>,
}

impl RunRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            store,
            locks,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn locks(&self) -> Arc<dyn LockManager> {
        Arc::clone(&self.locks)
    }

    /// Register a submitted run.
    ///
    /// When the run carries an idempotency key already seen for its tenant,
    /// the previously registered run is returned untouched and the new one
    /// is discarded.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub async fn register(&self, run: Run) -> Result<Run, RegistryError> {
        let mut state = self.state.lock().await;
        if let Some(key) = &run.idempotency_key {
            let slot = (run.config.tenant_id.clone(), key.clone());
            if let Some(existing_id) = state.submissions.get(&slot) {
                info!(existing = %existing_id, "idempotent resubmission short-circuited");
                return Ok(self.store.get_run(&run.config.tenant_id, existing_id).await?);
            }
            state.submissions.insert(slot, run.id.clone());
        }
        self.store.put_run(run.clone()).await?;
        Ok(run)
    }

    /// Apply one state transition, enforcing the legal state machine.
    ///
    /// Timestamps are maintained here: `started_at` on first entry to
    /// `Running`, `finished_at` on reaching a terminal state.
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        tenant_id: &str,
        run_id: &str,
        to: RunState,
    ) -> Result<Run, RegistryError> {
        let _guard = self.state.lock().await;
        let mut run = self.store.get_run(tenant_id, run_id).await?;
        if !run.state.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.state,
                to,
            });
        }
        run.state = to;
        if to == RunState::Running && run.started_at.is_none() {
            run.started_at = Some(chrono::Utc::now());
        }
        if to.is_terminal() {
            run.finished_at = Some(chrono::Utc::now());
        }
        self.store.put_run(run.clone()).await?;
        Ok(run)
    }

    /// Persist a run's current body without a state change.
    pub async fn checkpoint(&self, run: &Run) -> Result<(), RegistryError> {
        let _guard = self.state.lock().await;
        self.store.put_run(run.clone()).await?;
        Ok(())
    }

    /// Previously completed result for a dispatch key, if any. A hit means
    /// this exact attempt already ran to completion and must not re-execute.
    pub async fn cached_dispatch(&self, key: u64) -> Option<NodeResult> {
        self.state.lock().await.dispatches.get(&key).cloned()
    }

    /// Record a completed dispatch under its idempotency key.
    pub async fn record_dispatch(&self, key: u64, result: NodeResult) {
        self.state.lock().await.dispatches.insert(key, result);
    }

    /// Find `Running` runs whose lease has lapsed and recover them.
    ///
    /// Returns the ids of every run the sweep touched.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(
        &self,
        tenant_id: &str,
        policy: OrphanPolicy,
    ) -> Result<Vec<String>, RegistryError> {
        let runs = self.store.list_runs(tenant_id).await?;
        let mut swept = Vec::new();
        for run in runs {
            if run.state != RunState::Running || self.locks.is_held(&run.id).await {
                continue;
            }
            warn!(run_id = %run.id, "orphaned run detected");
            let target = match policy {
                OrphanPolicy::Requeue => RunState::Queued,
                OrphanPolicy::Fail => RunState::Failed,
            };
            let mut recovered = self.transition(tenant_id, &run.id, target).await?;
            if policy == OrphanPolicy::Fail {
                recovered.error = Some("executor lease expired mid-run".to_string());
                self.checkpoint(&recovered).await?;
            }
            swept.push(run.id);
        }
        Ok(swept)
    }
}
