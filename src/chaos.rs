//! Deterministic chaos injection on node inputs.
//!
//! Every chaos decision is a pure function of `(run seed, target node,
//! source node, attempt)`: the tuple is hashed into a seed for a private
//! [`StdRng`], so the same run config always produces the same drops,
//! corruptions, and delays regardless of scheduling order or wall-clock.
//! Chaos perturbs inputs only; node outputs are recorded as produced.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::model::ChaosConfig;

/// What chaos did to one delivered input edge.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChaosAction {
    /// Input replaced with `null`, simulating a lost message.
    Dropped,
    /// One field of the input mutated to a wrong-typed value.
    Corrupted { field: String },
    /// Artificial delay applied before dispatch.
    Delayed { delay_ms: u64 },
}

/// A recorded chaos perturbation, kept in the run trace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChaosEvent {
    pub node_id: String,
    pub source: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub action: ChaosAction,
}

/// Seed-keyed injector applying a [`ChaosConfig`] to inputs.
#[derive(Clone, Debug)]
pub struct ChaosInjector {
    seed: u64,
    config: ChaosConfig,
}

impl ChaosInjector {
    #[must_use]
    pub fn new(seed: u64, config: ChaosConfig) -> Self {
        Self { seed, config }
    }

    fn rng_for(&self, node_id: &str, source: &str, attempt: u32) -> StdRng {
        let mut hasher = FxHasher::default();
        self.seed.hash(&mut hasher);
        node_id.hash(&mut hasher);
        source.hash(&mut hasher);
        attempt.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    /// Perturb one input edge's payload.
    ///
    /// Returns the (possibly rewritten) payload plus the action taken, if
    /// any. Drop takes precedence over corruption when both trigger.
    #[must_use]
    pub fn perturb_input(
        &self,
        node_id: &str,
        source: &str,
        attempt: u32,
        payload: Value,
    ) -> (Value, Option<ChaosEvent>) {
        let mut rng = self.rng_for(node_id, source, attempt);

        if rng.random::<f64>() < self.config.drop_rate {
            debug!(node_id, source, attempt, "chaos dropped input");
            return (
                Value::Null,
                Some(ChaosEvent {
                    node_id: node_id.to_string(),
                    source: source.to_string(),
                    attempt,
                    action: ChaosAction::Dropped,
                }),
            );
        }

        if rng.random::<f64>() < self.config.corrupt_rate {
            let (corrupted, field) = corrupt_one_field(payload, &mut rng);
            debug!(node_id, source, attempt, field, "chaos corrupted input");
            return (
                corrupted,
                Some(ChaosEvent {
                    node_id: node_id.to_string(),
                    source: source.to_string(),
                    attempt,
                    action: ChaosAction::Corrupted { field },
                }),
            );
        }

        (payload, None)
    }

    /// Artificial pre-dispatch delay for a node attempt, if latency
    /// injection is enabled.
    #[must_use]
    pub fn injected_delay_ms(&self, node_id: &str, attempt: u32) -> Option<u64> {
        if !self.config.latency_injection.enabled {
            return None;
        }
        let max = self.config.latency_injection.max_delay_ms;
        if max == 0 {
            return None;
        }
        let mut rng = self.rng_for(node_id, "latency", attempt);
        Some(rng.random_range(0..=max))
    }
}

/// Replace one field of an object with a wrong-typed value. Keys are sorted
/// before picking so the choice is independent of map iteration order. A
/// non-object payload is replaced wholesale.
fn corrupt_one_field(payload: Value, rng: &mut StdRng) -> (Value, String) {
    match payload {
        Value::Object(mut map) if !map.is_empty() => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            let key = keys[rng.random_range(0..keys.len())].clone();
            let corrupted = match &map[&key] {
                Value::String(_) => Value::from(-1),
                Value::Number(_) => Value::from("corrupted"),
                Value::Bool(_) => Value::Null,
                _ => Value::from("corrupted"),
            };
            map.insert(key.clone(), corrupted);
            (Value::Object(map), key)
        }
        _ => (Value::from("corrupted"), "*".to_string()),
    }
}
