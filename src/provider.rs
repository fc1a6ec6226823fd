//! Provider adapters: the boundary between the engine and model backends.
//!
//! The scheduler only ever talks to [`ProviderAdapter`]; swapping a real
//! model API for the deterministic [`MockProvider`] changes nothing about
//! scheduling, contracts, or assertions. Adapters report their own latency,
//! cost, and token counts in [`ProviderOutput`] so that a deterministic
//! adapter yields byte-identical run artifacts.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::NodeType;

/// Everything an adapter needs to execute one node attempt.
#[derive(Clone, Debug)]
pub struct NodeInvocation {
    pub run_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    /// Static node configuration from the graph definition.
    pub config: FxHashMap<String, Value>,
    /// Resolved inputs keyed by upstream node id, post-chaos.
    pub inputs: Value,
    /// Zero-based attempt counter, incremented per retry.
    pub attempt: u32,
    pub seed: u64,
    pub model: Option<String>,
}

/// Adapter-reported result of one successful invocation.
///
/// Latency and cost originate here, never from engine wall-clock, so the
/// recorded metrics are as deterministic as the adapter itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderOutput {
    pub payload: Value,
    pub latency_ms: f64,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Failure surfaced by a provider adapter.
#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    /// Transport-level failure worth retrying (connection reset, 5xx).
    #[error("transient provider failure: {reason}")]
    #[diagnostic(
        code(gauntlet::provider::transient),
        help("transient failures are retried up to the run's retry budget")
    )]
    Transient { reason: String },

    /// Provider rejected the request; retrying cannot help.
    #[error("provider rejected request: {reason}")]
    #[diagnostic(
        code(gauntlet::provider::rejected),
        help("check the node's config and model pin; rejections are not retried")
    )]
    Rejected { reason: String },

    /// Provider rate limit; retryable after backoff.
    #[error("provider rate limited: {reason}")]
    #[diagnostic(
        code(gauntlet::provider::rate_limited),
        help("the scheduler backs off exponentially before the next attempt")
    )]
    RateLimited { reason: String },
}

impl ProviderError {
    /// Whether the scheduler should spend a retry on this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}

/// Executes node attempts against some model backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable adapter name, recorded in events.
    fn name(&self) -> &'static str;

    /// Execute one attempt. Implementations must be cancel-safe: the
    /// scheduler may drop the future on timeout or cancellation.
    async fn invoke(&self, invocation: &NodeInvocation) -> Result<ProviderOutput, ProviderError>;
}

/// Rough token count from serialized payload size (4 bytes per token).
#[must_use]
pub fn estimate_tokens(value: &Value) -> u64 {
    (value.to_string().len() as u64).div_ceil(4)
}

/// Cost in USD from token counts and per-1k rates for the pinned model.
#[must_use]
pub fn estimate_cost(tokens_in: u64, tokens_out: u64, model: Option<&str>) -> f64 {
    // Per-1k-token USD rates; unknown models fall back to the default row.
    let (rate_in, rate_out) = match model {
        Some("gauntlet-large") => (0.003, 0.015),
        Some("gauntlet-small") => (0.000_25, 0.001_25),
        _ => (0.001, 0.002),
    };
    (tokens_in as f64 / 1000.0) * rate_in + (tokens_out as f64 / 1000.0) * rate_out
}

/// Synthesizes the payload for one node type from the invocation and its
/// derived hash.
type PayloadFn = fn(&NodeInvocation, u64) -> Value;

/// Deterministic in-process provider for tests, replays, and chaos drills.
///
/// Output is a pure function of the invocation's node id, type, inputs,
/// seed, and attempt. One payload handler per [`NodeType`] is registered at
/// construction and looked up at invoke time. Behavior hooks read from node
/// config:
///
/// - `output`: return this payload verbatim instead of the synthesized one
/// - `fail_attempts`: fail with a transient error for the first N attempts
/// - `latency_ms`: report this fixed latency instead of the derived one
/// - `sleep_ms`: actually sleep before responding, to exercise time boxes
#[derive(Clone, Debug)]
pub struct MockProvider {
    handlers: FxHashMap<NodeType, PayloadFn>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        let mut handlers: FxHashMap<NodeType, PayloadFn> = FxHashMap::default();
        handlers.insert(NodeType::Classifier, payloads::classifier);
        handlers.insert(NodeType::Retriever, payloads::retriever);
        handlers.insert(NodeType::Reranker, payloads::reranker);
        handlers.insert(NodeType::Planner, payloads::planner);
        handlers.insert(NodeType::Validator, payloads::validator);
        handlers.insert(NodeType::Negotiator, payloads::negotiator);
        handlers.insert(NodeType::Aggregator, payloads::aggregate);
        handlers.insert(NodeType::Synthesizer, payloads::aggregate);
        handlers.insert(NodeType::Mock, payloads::echo);
        handlers.insert(NodeType::Responder, payloads::respond);
        handlers.insert(NodeType::Generator, payloads::respond);
        handlers.insert(NodeType::Executor, payloads::respond);
        Self { handlers }
    }

    fn derived_u64(invocation: &NodeInvocation, salt: &str) -> u64 {
        let mut hasher = FxHasher::default();
        invocation.seed.hash(&mut hasher);
        invocation.node_id.hash(&mut hasher);
        salt.hash(&mut hasher);
        hasher.finish()
    }

    fn synthesize_payload(&self, invocation: &NodeInvocation) -> Value {
        let h = Self::derived_u64(invocation, "payload");
        let handler = self
            .handlers
            .get(&invocation.node_type)
            .copied()
            .unwrap_or(payloads::respond);
        handler(invocation, h)
    }
}

/// Per-node-type payload handlers for [`MockProvider`].
mod payloads {
    use super::*;

    fn confidence(h: u64) -> f64 {
        0.5 + (h % 500) as f64 / 1000.0
    }

    fn response(invocation: &NodeInvocation) -> String {
        format!("{} output for {}", invocation.node_type, invocation.node_id)
    }

    pub(super) fn classifier(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "label": if h % 2 == 0 { "positive" } else { "negative" },
            "confidence": confidence(h),
        })
    }

    pub(super) fn retriever(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "documents": [
                {"id": format!("doc-{}", h % 97), "score": confidence(h)},
                {"id": format!("doc-{}", h % 89), "score": confidence(h) - 0.1},
            ],
        })
    }

    pub(super) fn reranker(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "ranking": [format!("doc-{}", h % 97), format!("doc-{}", h % 89)],
        })
    }

    pub(super) fn planner(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "plan": [
                format!("step-{}", h % 7 + 1),
                format!("step-{}", h % 5 + 1),
            ],
        })
    }

    pub(super) fn validator(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "valid": h % 10 != 0,
            "confidence": confidence(h),
        })
    }

    pub(super) fn negotiator(invocation: &NodeInvocation, h: u64) -> Value {
        // Geometrically shrinking deltas so the offer series settles.
        let mut offer = 10.0 + (h % 100) as f64 / 10.0;
        let mut delta = offer / 2.0;
        let mut offers = Vec::with_capacity(6);
        for _ in 0..6 {
            offers.push((offer * 1000.0).round() / 1000.0);
            offer -= delta;
            delta /= 4.0;
        }
        json!({"response": response(invocation), "offers": offers})
    }

    pub(super) fn aggregate(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "sources": invocation
                .inputs
                .as_object()
                .map(|m| m.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default(),
            "confidence": confidence(h),
        })
    }

    pub(super) fn echo(invocation: &NodeInvocation, _h: u64) -> Value {
        json!({
            "response": response(invocation),
            "echo": invocation.inputs,
        })
    }

    pub(super) fn respond(invocation: &NodeInvocation, h: u64) -> Value {
        json!({
            "response": response(invocation),
            "confidence": confidence(h),
        })
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    #[instrument(skip_all, fields(node_id = %invocation.node_id, attempt = invocation.attempt))]
    async fn invoke(&self, invocation: &NodeInvocation) -> Result<ProviderOutput, ProviderError> {
        if let Some(sleep_ms) = invocation.config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        }

        if let Some(fail_attempts) = invocation
            .config
            .get("fail_attempts")
            .and_then(Value::as_u64)
            && u64::from(invocation.attempt) < fail_attempts
        {
            debug!(attempt = invocation.attempt, "mock provider injected failure");
            return Err(ProviderError::Transient {
                reason: format!("scripted failure on attempt {}", invocation.attempt),
            });
        }

        let payload = invocation
            .config
            .get("output")
            .cloned()
            .unwrap_or_else(|| self.synthesize_payload(invocation));

        let tokens_in = estimate_tokens(&invocation.inputs);
        let tokens_out = estimate_tokens(&payload);
        let latency_ms = invocation
            .config
            .get("latency_ms")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| 20.0 + (Self::derived_u64(invocation, "latency") % 180) as f64);

        Ok(ProviderOutput {
            payload,
            latency_ms,
            cost_usd: estimate_cost(tokens_in, tokens_out, invocation.model.as_deref()),
            tokens_in,
            tokens_out,
        })
    }
}
