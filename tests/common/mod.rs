pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::*;

use std::sync::Arc;

use gauntlet::provider::MockProvider;
use gauntlet::registry::{InMemoryLockManager, RunRegistry};
use gauntlet::run::RunConfig;
use gauntlet::scheduler::Scheduler;
use gauntlet::storage::InMemoryStore;

pub fn test_registry() -> RunRegistry {
    RunRegistry::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryLockManager::new()),
    )
}

pub fn test_scheduler() -> Scheduler {
    Scheduler::new(test_registry(), Arc::new(MockProvider::new()))
}

/// Baseline config: fixed seed, generous time box, small concurrency.
pub fn test_config() -> RunConfig {
    RunConfig::for_tenant("tests")
        .with_seed(42)
        .with_node_timeout_ms(5_000)
        .with_max_concurrency(4)
}
