//! Assertion evaluation against completed node results.
//!
//! Assertions are the test layer: they run after execution finishes and
//! never affect node scheduling. Each configured [`AssertionCheck`] yields a
//! [`Verdict`]; a run can complete successfully while assertions fail, and
//! the report keeps the two outcomes separate.
//!
//! Every check kind is a variant of the internally tagged [`AssertionCheck`]
//! enum, so an unknown kind or a missing parameter is rejected when the
//! graph definition is parsed rather than surfacing mid-evaluation.

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::contracts::check_value_against_schema;
use crate::model::{AssertionDef, SchemaSpec};
use crate::run::NodeResult;
use crate::utils::json_path;

fn default_similarity_threshold() -> f64 {
    0.8
}

/// One configured check, tagged by `type` in graph definitions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssertionCheck {
    /// Field value equals the expected JSON value exactly.
    Equals { expected: Value },
    /// String field contains the substring (or any element of a string
    /// array does).
    Contains { expected: String },
    /// Negation of [`AssertionCheck::Contains`].
    NotContains { expected: String },
    /// Numeric field strictly exceeds the threshold.
    GreaterThan { threshold: f64 },
    /// Numeric field lies within `[min, max]` inclusive.
    Range { min: f64, max: f64 },
    /// Node's provider-reported latency stays under the bound.
    LatencyUnder { max_ms: f64 },
    /// Node's estimated cost stays under the bound.
    CostUnder { max_usd: f64 },
    /// Field is semantically close to the expected text, as judged by the
    /// engine's [`SemanticScorer`].
    SemanticSimilarity {
        expected: String,
        #[serde(default = "default_similarity_threshold")]
        threshold: f64,
    },
    /// Field conforms to a structural schema.
    SchemaValid { schema: SchemaSpec },
    /// Numeric series has settled: over its final `rounds` entries, each
    /// consecutive pair differs by at most `threshold`.
    Convergence { rounds: usize, threshold: f64 },
}

impl AssertionCheck {
    /// Stable kind name, matching the serialized `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Equals { .. } => "equals",
            Self::Contains { .. } => "contains",
            Self::NotContains { .. } => "not_contains",
            Self::GreaterThan { .. } => "greater_than",
            Self::Range { .. } => "range",
            Self::LatencyUnder { .. } => "latency_under",
            Self::CostUnder { .. } => "cost_under",
            Self::SemanticSimilarity { .. } => "semantic_similarity",
            Self::SchemaValid { .. } => "schema_valid",
            Self::Convergence { .. } => "convergence",
        }
    }

    /// True for checks reading run metrics instead of an output field.
    #[must_use]
    pub fn is_metric_check(&self) -> bool {
        matches!(self, Self::LatencyUnder { .. } | Self::CostUnder { .. })
    }
}

/// Outcome of evaluating one assertion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub assertion_id: String,
    pub target: String,
    pub kind: String,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    pub detail: String,
}

/// Rollup over all verdicts of a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AssertionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl AssertionSummary {
    #[must_use]
    pub fn from_verdicts(verdicts: &[Verdict]) -> Self {
        let passed = verdicts.iter().filter(|v| v.passed).count();
        Self {
            total: verdicts.len(),
            passed,
            failed: verdicts.len() - passed,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Scores semantic closeness of two texts in `[0.0, 1.0]`.
///
/// The engine ships with the embedding-free [`LexicalScorer`]; deployments
/// can plug in an embedding-backed implementation without touching the
/// evaluation loop.
#[async_trait]
pub trait SemanticScorer: Send + Sync {
    async fn score(&self, expected: &str, actual: &str) -> f64;
}

/// Word-overlap (Jaccard) similarity over lowercased alphanumeric tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct LexicalScorer;

impl LexicalScorer {
    fn tokens(text: &str) -> FxHashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    }
}

#[async_trait]
impl SemanticScorer for LexicalScorer {
    async fn score(&self, expected: &str, actual: &str) -> f64 {
        let a = Self::tokens(expected);
        let b = Self::tokens(actual);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let intersection = a.intersection(&b).count();
        let union = a.union(&b).count();
        if union == 0 {
            0.0
        } else {
            intersection as f64 / union as f64
        }
    }
}

/// Evaluates a run's assertions once execution has finished.
#[derive(Clone)]
pub struct AssertionEngine {
    scorer: Arc<dyn SemanticScorer>,
}

impl Default for AssertionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AssertionEngine {
    /// Engine backed by the built-in [`LexicalScorer`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            scorer: Arc::new(LexicalScorer),
        }
    }

    /// Engine with a custom similarity scorer.
    #[must_use]
    pub fn with_scorer(scorer: Arc<dyn SemanticScorer>) -> Self {
        Self { scorer }
    }

    /// Evaluate every assertion in definition order.
    ///
    /// Evaluation is total: a missing target result, an absent field, or a
    /// type mismatch produces a failing verdict with a diagnostic rather
    /// than an error.
    #[instrument(skip_all, fields(assertions = assertions.len()))]
    pub async fn evaluate_all(
        &self,
        assertions: &[AssertionDef],
        results: &BTreeMap<String, NodeResult>,
    ) -> Vec<Verdict> {
        let mut verdicts = Vec::with_capacity(assertions.len());
        for def in assertions {
            verdicts.push(self.evaluate(def, results).await);
        }
        verdicts
    }

    async fn evaluate(
        &self,
        def: &AssertionDef,
        results: &BTreeMap<String, NodeResult>,
    ) -> Verdict {
        let mut verdict = Verdict {
            assertion_id: def.id.clone(),
            target: def.target.clone(),
            kind: def.check.kind().to_string(),
            passed: false,
            expected: String::new(),
            actual: String::new(),
            detail: String::new(),
        };

        let Some(result) = results.get(&def.target) else {
            verdict.detail = format!("target node '{}' produced no result", def.target);
            verdict.actual = "absent".into();
            return verdict;
        };

        if def.check.is_metric_check() {
            self.evaluate_metric(&def.check, result, &mut verdict);
            return verdict;
        }

        let Some(value) = json_path::lookup(&result.output, &def.field) else {
            verdict.expected = format!("field '{}' present", def.field);
            verdict.actual = "absent".into();
            verdict.detail = format!(
                "field '{}' absent from output of '{}'",
                def.field, def.target
            );
            return verdict;
        };

        self.evaluate_value(&def.check, value, &mut verdict).await;
        verdict
    }

    fn evaluate_metric(&self, check: &AssertionCheck, result: &NodeResult, verdict: &mut Verdict) {
        match check {
            AssertionCheck::LatencyUnder { max_ms } => {
                verdict.expected = format!("< {max_ms} ms");
                verdict.actual = format!("{} ms", result.latency_ms);
                verdict.passed = result.latency_ms < *max_ms;
                if !verdict.passed {
                    verdict.detail =
                        format!("latency {} ms not under {max_ms} ms", result.latency_ms);
                }
            }
            AssertionCheck::CostUnder { max_usd } => {
                verdict.expected = format!("< ${max_usd}");
                verdict.actual = format!("${}", result.cost_usd);
                verdict.passed = result.cost_usd < *max_usd;
                if !verdict.passed {
                    verdict.detail = format!("cost ${} not under ${max_usd}", result.cost_usd);
                }
            }
            _ => unreachable!("non-metric check routed to metric evaluation"),
        }
    }

    async fn evaluate_value(&self, check: &AssertionCheck, value: &Value, verdict: &mut Verdict) {
        match check {
            AssertionCheck::Equals { expected } => {
                verdict.expected = expected.to_string();
                verdict.actual = value.to_string();
                verdict.passed = value == expected;
                if !verdict.passed {
                    verdict.detail = "value does not equal expected".into();
                }
            }
            AssertionCheck::Contains { expected } => {
                verdict.expected = format!("contains {expected:?}");
                verdict.actual = value.to_string();
                verdict.passed = value_contains(value, expected);
                if !verdict.passed {
                    verdict.detail = format!("value does not contain {expected:?}");
                }
            }
            AssertionCheck::NotContains { expected } => {
                verdict.expected = format!("does not contain {expected:?}");
                verdict.actual = value.to_string();
                verdict.passed = !value_contains(value, expected);
                if !verdict.passed {
                    verdict.detail = format!("value unexpectedly contains {expected:?}");
                }
            }
            AssertionCheck::GreaterThan { threshold } => {
                verdict.expected = format!("> {threshold}");
                verdict.actual = value.to_string();
                match value.as_f64() {
                    Some(n) => {
                        verdict.passed = n > *threshold;
                        if !verdict.passed {
                            verdict.detail = format!("{n} is not greater than {threshold}");
                        }
                    }
                    None => verdict.detail = "value is not numeric".into(),
                }
            }
            AssertionCheck::Range { min, max } => {
                verdict.expected = format!("[{min}, {max}]");
                verdict.actual = value.to_string();
                match value.as_f64() {
                    Some(n) => {
                        verdict.passed = n >= *min && n <= *max;
                        if !verdict.passed {
                            verdict.detail = format!("{n} outside [{min}, {max}]");
                        }
                    }
                    None => verdict.detail = "value is not numeric".into(),
                }
            }
            AssertionCheck::SemanticSimilarity {
                expected,
                threshold,
            } => {
                verdict.expected = format!("similarity >= {threshold} to {expected:?}");
                match value.as_str() {
                    Some(actual) => {
                        let score = self.scorer.score(expected, actual).await;
                        verdict.actual = format!("{score:.3}");
                        verdict.passed = score >= *threshold;
                        if !verdict.passed {
                            verdict.detail =
                                format!("similarity {score:.3} below threshold {threshold}");
                        }
                    }
                    None => {
                        verdict.actual = value.to_string();
                        verdict.detail = "value is not a string".into();
                    }
                }
            }
            AssertionCheck::SchemaValid { schema } => {
                verdict.expected = "conforms to schema".into();
                let violations = check_value_against_schema(schema, value);
                verdict.passed = violations.is_empty();
                if verdict.passed {
                    verdict.actual = "valid".into();
                } else {
                    verdict.actual = format!("{} violation(s)", violations.len());
                    verdict.detail = violations
                        .iter()
                        .map(|v| v.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                }
            }
            AssertionCheck::Convergence { rounds, threshold } => {
                evaluate_convergence(*rounds, *threshold, value, verdict);
            }
            AssertionCheck::LatencyUnder { .. } | AssertionCheck::CostUnder { .. } => {
                unreachable!("metric check routed to value evaluation")
            }
        }
    }
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| s.contains(needle))),
        _ => false,
    }
}

/// A series converges when its final `rounds` entries form a window where
/// each consecutive pair differs by at most `threshold`.
fn evaluate_convergence(rounds: usize, threshold: f64, value: &Value, verdict: &mut Verdict) {
    verdict.expected = format!("last {rounds} entries within +/-{threshold}");

    let Some(items) = value.as_array() else {
        verdict.actual = value.to_string();
        verdict.detail = "value is not a numeric series".into();
        return;
    };
    let series: Vec<f64> = match items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>() {
        Some(series) => series,
        None => {
            verdict.actual = value.to_string();
            verdict.detail = "series contains non-numeric entries".into();
            return;
        }
    };
    if series.len() < rounds {
        verdict.actual = format!("{} entries", series.len());
        verdict.detail = format!("series has {} entries, fewer than {rounds}", series.len());
        return;
    }

    let window = &series[series.len() - rounds..];
    let max_delta = window
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .fold(0.0_f64, f64::max);
    verdict.actual = format!("max delta {max_delta}");
    verdict.passed = max_delta <= threshold;
    if !verdict.passed {
        verdict.detail = format!("window delta {max_delta} exceeds threshold {threshold}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeStatus, NodeType};
    use serde_json::json;

    fn result_with_output(node_id: &str, output: Value) -> NodeResult {
        let mut result = NodeResult::undispatched(node_id, NodeType::Mock, NodeStatus::Ok);
        result.output = output;
        result
    }

    fn results(entries: Vec<NodeResult>) -> BTreeMap<String, NodeResult> {
        entries.into_iter().map(|r| (r.node_id.clone(), r)).collect()
    }

    fn assertion(target: &str, field: &str, check: AssertionCheck) -> AssertionDef {
        AssertionDef {
            id: "a1".into(),
            target: target.into(),
            field: field.into(),
            check,
        }
    }

    #[tokio::test]
    async fn equals_and_contains_pass_and_fail() {
        let engine = AssertionEngine::new();
        let results = results(vec![result_with_output(
            "n1",
            json!({"response": "refund approved", "confidence": 0.9}),
        )]);

        let verdicts = engine
            .evaluate_all(
                &[
                    assertion(
                        "n1",
                        "confidence",
                        AssertionCheck::Equals {
                            expected: json!(0.9),
                        },
                    ),
                    assertion(
                        "n1",
                        "response",
                        AssertionCheck::Contains {
                            expected: "denied".into(),
                        },
                    ),
                ],
                &results,
            )
            .await;
        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
        let summary = AssertionSummary::from_verdicts(&verdicts);
        assert_eq!((summary.passed, summary.failed), (1, 1));
    }

    #[tokio::test]
    async fn missing_field_fails_rather_than_errors() {
        let engine = AssertionEngine::new();
        let results = results(vec![result_with_output("n1", json!({"other": 1}))]);
        let verdicts = engine
            .evaluate_all(
                &[assertion(
                    "n1",
                    "response",
                    AssertionCheck::GreaterThan { threshold: 0.5 },
                )],
                &results,
            )
            .await;
        assert!(!verdicts[0].passed);
        assert!(verdicts[0].detail.contains("absent"));
    }

    #[tokio::test]
    async fn latency_check_reads_recorded_metrics() {
        let engine = AssertionEngine::new();
        let mut result = result_with_output("n1", json!({"response": "ok"}));
        result.latency_ms = 120.0;
        let results = results(vec![result]);

        let verdicts = engine
            .evaluate_all(
                &[
                    assertion("n1", "response", AssertionCheck::LatencyUnder { max_ms: 200.0 }),
                    assertion("n1", "response", AssertionCheck::LatencyUnder { max_ms: 100.0 }),
                ],
                &results,
            )
            .await;
        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
    }

    #[tokio::test]
    async fn convergence_checks_final_window() {
        let engine = AssertionEngine::new();
        let results = results(vec![result_with_output(
            "neg",
            json!({"offers": [10.0, 6.0, 5.2, 5.1, 5.05]}),
        )]);

        let converged = assertion(
            "neg",
            "offers",
            AssertionCheck::Convergence {
                rounds: 3,
                threshold: 0.2,
            },
        );
        let diverged = assertion(
            "neg",
            "offers",
            AssertionCheck::Convergence {
                rounds: 5,
                threshold: 0.2,
            },
        );
        let verdicts = engine.evaluate_all(&[converged, diverged], &results).await;
        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
    }

    #[tokio::test]
    async fn convergence_short_series_fails() {
        let engine = AssertionEngine::new();
        let results = results(vec![result_with_output("neg", json!({"offers": [1.0]}))]);
        let verdicts = engine
            .evaluate_all(
                &[assertion(
                    "neg",
                    "offers",
                    AssertionCheck::Convergence {
                        rounds: 3,
                        threshold: 0.1,
                    },
                )],
                &results,
            )
            .await;
        assert!(!verdicts[0].passed);
        assert!(verdicts[0].detail.contains("fewer than 3"));
    }

    #[tokio::test]
    async fn lexical_scorer_orders_overlap() {
        let scorer = LexicalScorer;
        let high = scorer
            .score("the refund was approved", "refund approved for the user")
            .await;
        let low = scorer.score("the refund was approved", "unrelated text").await;
        assert!(high > low);
        assert!((scorer.score("same", "same").await - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn schema_valid_reports_violation_details() {
        let engine = AssertionEngine::new();
        let schema = SchemaSpec {
            required: vec!["score".into()],
            ..Default::default()
        };
        let results = results(vec![result_with_output("n1", json!({"data": {}}))]);
        let verdicts = engine
            .evaluate_all(
                &[assertion("n1", "data", AssertionCheck::SchemaValid { schema })],
                &results,
            )
            .await;
        assert!(!verdicts[0].passed);
        assert!(verdicts[0].detail.contains("score"));
    }
}
