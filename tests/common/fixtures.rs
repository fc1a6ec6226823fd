//! Graph fixtures shared across integration tests.

use gauntlet::model::{GraphDef, ValidatedGraph, validate};

pub fn graph(yaml: &str) -> ValidatedGraph {
    validate(GraphDef::from_yaml(yaml).expect("fixture parses")).expect("fixture validates")
}

/// Two-step pipeline with a contract on the classifier and assertions on
/// both steps.
pub fn linear_graph() -> ValidatedGraph {
    graph(
        r#"
id: support-triage
name: Support ticket triage
nodes:
  - {id: classify, type: classifier}
  - {id: respond, type: responder, inputs: [classify]}
edges:
  - {from: classify, to: respond}
contracts:
  - id: classification-shape
    source: classify
    required_fields: [response, confidence]
    fields:
      confidence: {type: number, min: 0.0, max: 1.0}
assertions:
  - {id: respond-mentions-node, target: respond, field: response, type: contains, expected: respond}
  - {id: respond-fast, target: respond, type: latency_under, max_ms: 60000}
"#,
    )
}

/// Fan-out/fan-in: one classifier feeding two retrievers, merged by an
/// aggregator.
pub fn diamond_graph() -> ValidatedGraph {
    graph(
        r#"
id: fanout-merge
name: Parallel retrieval
nodes:
  - {id: classify, type: classifier}
  - {id: fetch-a, type: retriever, inputs: [classify]}
  - {id: fetch-b, type: retriever, inputs: [classify]}
  - {id: merge, type: aggregator, inputs: [fetch-a, fetch-b]}
edges:
  - {from: classify, to: fetch-a}
  - {from: classify, to: fetch-b}
  - {from: fetch-a, to: merge}
  - {from: fetch-b, to: merge}
assertions:
  - {id: merged-has-sources, target: merge, field: sources, type: contains, expected: fetch-a}
"#,
    )
}

/// The middle node emits a payload violating its contract; the sink depends
/// on it.
pub fn contract_breaker_graph() -> ValidatedGraph {
    graph(
        r#"
id: broken-middle
name: Contract violation propagation
nodes:
  - {id: source, type: mock}
  - id: middle
    type: generator
    inputs: [source]
    config:
      output: {wrong_field: true}
  - {id: sink, type: synthesizer, inputs: [middle]}
edges:
  - {from: source, to: middle}
  - {from: middle, to: sink}
contracts:
  - id: middle-shape
    source: middle
    required_fields: [response]
"#,
    )
}

/// One node that fails transiently twice before succeeding.
pub fn flaky_graph() -> ValidatedGraph {
    graph(
        r#"
id: flaky
name: Transient provider failures
nodes:
  - id: wobbly
    type: responder
    config:
      fail_attempts: 2
"#,
    )
}

/// One slow node; `sleep_ms` makes the provider genuinely wait.
pub fn slow_graph(sleep_ms: u64, critical: bool) -> ValidatedGraph {
    graph(&format!(
        r#"
id: slow
name: Slow node
nodes:
  - id: sluggish
    type: executor
    critical: {critical}
    config:
      sleep_ms: {sleep_ms}
"#,
    ))
}

/// Negotiation graph whose offer series settles, plus convergence checks.
pub fn negotiation_graph() -> ValidatedGraph {
    graph(
        r#"
id: haggling
name: Price negotiation
nodes:
  - {id: haggle, type: negotiator}
assertions:
  - {id: settles, target: haggle, field: offers, type: convergence, rounds: 3, threshold: 0.5}
"#,
    )
}
