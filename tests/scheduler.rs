mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use gauntlet::event_bus::{BusEmitter, EventBus, MemorySink, RunEvent};
use gauntlet::model::validate;
use gauntlet::run::Artifact;
use gauntlet::types::{NodeStatus, RunState};

#[tokio::test]
async fn linear_run_completes_with_passing_assertions() {
    let scheduler = test_scheduler();
    let graph = linear_graph();

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .expect("run executes");

    assert_eq!(report.state, RunState::Completed);
    assert!(!report.execution_failed);
    assert!(report.assertion_summary.all_passed());
    assert_eq!(report.assertion_summary.total, 2);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(run.results.len(), 2);
    assert!(run.results["classify"].status.is_ok());
    assert!(run.results["respond"].status.is_ok());
    // Downstream saw the upstream output under its node id.
    assert!(run.results["respond"].resolved_inputs["classify"].is_object());
    assert!(run.metrics.total_cost_usd > 0.0);
    assert!(run.started_at.is_some() && run.finished_at.is_some());
}

#[tokio::test]
async fn diamond_run_feeds_aggregator_both_branches() {
    let scheduler = test_scheduler();
    let graph = diamond_graph();

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(report.assertion_summary.all_passed());

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    let merge_inputs = run.results["merge"].resolved_inputs.as_object().unwrap();
    assert!(merge_inputs.contains_key("fetch-a"));
    assert!(merge_inputs.contains_key("fetch-b"));
}

#[tokio::test]
async fn same_seed_produces_byte_identical_artifacts() {
    let graph = linear_graph();

    let mut traces = Vec::new();
    for _ in 0..2 {
        // Fresh store each time: nothing carries over but the seed.
        let scheduler = test_scheduler();
        let report = scheduler
            .run_graph(&graph, test_config().with_seed(1234))
            .await
            .unwrap();
        let artifact = scheduler
            .registry()
            .store()
            .get_artifact("tests", &report.run_id)
            .await
            .unwrap();
        traces.push(serde_json::to_vec(&artifact.trace).unwrap());
    }
    assert_eq!(traces[0], traces[1]);
}

#[tokio::test]
async fn contract_violation_blocks_dependents() {
    let scheduler = test_scheduler();
    let graph = contract_breaker_graph();

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .unwrap();
    // The violation and skip live in the node statuses; execution itself
    // still completes.
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.execution_failed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert!(run.error.is_none());
    assert_eq!(run.results["middle"].status, NodeStatus::ContractViolation);
    let contract = run.results["middle"].contract.as_ref().unwrap();
    assert!(!contract.is_ok());
    assert_eq!(contract.violations[0].field, "response");
    assert_eq!(run.results["sink"].status, NodeStatus::Skipped);
    assert_eq!(run.results["sink"].output, serde_json::Value::Null);
}

#[tokio::test]
async fn contract_violation_completes_run_with_failing_verdict() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: triage-misshapen
name: Classifier omits a contracted field
nodes:
  - id: intent-classifier
    type: classifier
    config:
      output: {response: "intent: refund"}
  - {id: response-generator, type: generator, inputs: [intent-classifier]}
edges:
  - {from: intent-classifier, to: response-generator}
contracts:
  - id: intent-shape
    source: intent-classifier
    required_fields: [confidence]
assertions:
  - {id: reply-mentions-refund, target: response-generator, field: response, type: contains, expected: refund}
"#,
    );

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .unwrap();
    // Execution succeeded; the failure shows up as a test verdict, not a
    // run failure.
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.execution_failed);
    assert_eq!(report.assertion_summary.failed, 1);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(
        run.results["intent-classifier"].status,
        NodeStatus::ContractViolation
    );
    assert_eq!(
        run.results["response-generator"].status,
        NodeStatus::Skipped
    );
}

#[tokio::test]
async fn continue_on_error_feeds_null_inputs_downstream() {
    let scheduler = test_scheduler();
    let graph = contract_breaker_graph();

    let mut config = test_config();
    config.policy.continue_on_error = true;
    let report = scheduler.run_graph(&graph, config).await.unwrap();
    // Terminal sink ran (degraded), so execution completes.
    assert_eq!(report.state, RunState::Completed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert!(run.results["sink"].status.is_ok());
    assert_eq!(
        run.results["sink"].resolved_inputs["middle"],
        serde_json::Value::Null
    );
}

#[tokio::test]
async fn transient_failures_are_retried_within_budget() {
    let scheduler = test_scheduler();
    let graph = flaky_graph();

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    // Two scripted failures plus the success.
    assert_eq!(run.results["wobbly"].attempts, 3);
    assert!(run.results["wobbly"].status.is_ok());
}

#[tokio::test]
async fn exhausted_retries_surface_as_provider_error() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: hopeless
name: Permanently failing node
nodes:
  - id: wobbly
    type: responder
    config:
      fail_attempts: 99
"#,
    );

    let mut config = test_config();
    config.policy.retry.max_retries = 1;
    let report = scheduler.run_graph(&graph, config).await.unwrap();
    // The node is not critical, so the run completes around the failure.
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.execution_failed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert!(run.error.is_none());
    assert_eq!(run.results["wobbly"].status, NodeStatus::ProviderError);
    assert_eq!(run.results["wobbly"].attempts, 2);
}

#[tokio::test]
async fn critical_node_provider_error_fails_the_run() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: hopeless-critical
name: Permanently failing critical node
nodes:
  - id: wobbly
    type: responder
    critical: true
    config:
      fail_attempts: 99
"#,
    );

    let mut config = test_config();
    config.policy.retry.max_retries = 1;
    let report = scheduler.run_graph(&graph, config).await.unwrap();
    assert_eq!(report.state, RunState::Failed);
    assert!(report.execution_failed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(run.results["wobbly"].status, NodeStatus::ProviderError);
    assert!(run.error.as_deref().unwrap().contains("wobbly"));
}

#[tokio::test]
async fn slow_critical_node_times_out_and_fails_the_run() {
    let scheduler = test_scheduler();
    let graph = slow_graph(60_000, true);

    let report = scheduler
        .run_graph(&graph, test_config().with_node_timeout_ms(100))
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Failed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(run.results["sluggish"].status, NodeStatus::Timeout);
    assert!(
        run.results["sluggish"]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out")
    );
}

#[tokio::test]
async fn terminal_node_timeout_fails_the_run_even_when_not_critical() {
    let scheduler = test_scheduler();
    let graph = slow_graph(60_000, false);

    let report = scheduler
        .run_graph(&graph, test_config().with_node_timeout_ms(100))
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Failed);

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(run.results["sluggish"].status, NodeStatus::Timeout);
    assert!(run.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancel_stops_the_run_and_marks_undispatched_nodes() {
    let scheduler = test_scheduler();
    let graph = slow_graph(60_000, false);
    let config = test_config();
    let run = scheduler.submit(&graph, config, None).await.unwrap();

    let handle = scheduler.spawn(graph, "tests".into(), run.id.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &run.id)
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.results["sluggish"].status, NodeStatus::Cancelled);
}

#[tokio::test]
async fn pause_holds_dispatch_until_resume() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: pausable
name: Pause target
nodes:
  - id: first
    type: executor
    config: {sleep_ms: 150}
  - id: second
    type: responder
    inputs: [first]
"#,
    );
    let run = scheduler
        .submit(&graph, test_config(), None)
        .await
        .unwrap();

    let handle = scheduler.spawn(graph, "tests".into(), run.id.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.pause();

    // The run settles into paused once the signal is observed.
    let mut observed_paused = false;
    for _ in 0..100 {
        let current = scheduler
            .registry()
            .store()
            .get_run("tests", &run.id)
            .await
            .unwrap();
        if current.state == RunState::Paused {
            observed_paused = true;
            break;
        }
        if current.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.resume();
    let report = handle.wait().await.unwrap();
    assert!(observed_paused, "run never reached paused");
    assert_eq!(report.state, RunState::Completed);
}

#[tokio::test]
async fn dropped_handle_cancels_a_paused_run() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: abandoned
name: Paused then abandoned
nodes:
  - id: first
    type: executor
    config: {sleep_ms: 150}
  - id: second
    type: responder
    inputs: [first]
"#,
    );
    let run = scheduler
        .submit(&graph, test_config(), None)
        .await
        .unwrap();

    let handle = scheduler.spawn(graph, "tests".into(), run.id.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.pause();

    let mut observed_paused = false;
    for _ in 0..100 {
        let current = scheduler
            .registry()
            .store()
            .get_run("tests", &run.id)
            .await
            .unwrap();
        if current.state == RunState::Paused {
            observed_paused = true;
            break;
        }
        if current.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(observed_paused, "run never reached paused");

    // Nothing can resume or cancel through a dropped handle; the run must
    // still reach a terminal state instead of waiting forever.
    drop(handle);
    let mut state = RunState::Paused;
    for _ in 0..200 {
        state = scheduler
            .registry()
            .store()
            .get_run("tests", &run.id)
            .await
            .unwrap()
            .state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, RunState::Cancelled);
    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &run.id)
        .await
        .unwrap();
    assert_eq!(run.results["second"].status, NodeStatus::Cancelled);
}

#[tokio::test]
async fn failing_assertion_leaves_run_completed_by_default() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: wrong-expectation
name: Assertion failure without policy
nodes:
  - id: only
    type: responder
    config:
      output: {response: "actual text"}
assertions:
  - {id: wants-other, target: only, field: response, type: equals, expected: "other text"}
"#,
    );

    let report = scheduler
        .run_graph(&graph, test_config())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(!report.execution_failed);
    assert_eq!(report.assertion_summary.failed, 1);
    assert!(!report.verdicts[0].passed);
}

#[tokio::test]
async fn fail_run_on_assertion_policy_marks_run_failed() {
    let scheduler = test_scheduler();
    let graph = graph(
        r#"
id: strict-expectation
name: Assertion failure with policy
nodes:
  - id: only
    type: responder
    config:
      output: {response: "actual text"}
assertions:
  - {id: wants-other, target: only, field: response, type: equals, expected: "other text"}
"#,
    );

    let mut config = test_config();
    config.policy.fail_run_on_assertion = true;
    let report = scheduler.run_graph(&graph, config).await.unwrap();
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.assertion_summary.failed, 1);
}

#[tokio::test]
async fn convergence_assertion_passes_on_settling_series() {
    let scheduler = test_scheduler();
    let report = scheduler
        .run_graph(&negotiation_graph(), test_config())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(report.assertion_summary.all_passed());
}

#[tokio::test]
async fn lifecycle_events_are_emitted_in_order() {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen_for_events();

    let scheduler = test_scheduler().with_emitter(Arc::new(BusEmitter::new(bus.get_sender())));
    let report = scheduler
        .run_graph(&linear_graph(), test_config())
        .await
        .unwrap();

    // Let the listener drain.
    for _ in 0..100 {
        if sink
            .snapshot()
            .iter()
            .any(|e| matches!(e, RunEvent::RunFinished { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bus.stop_listener().await;

    let events = sink.snapshot();
    let kinds: Vec<&str> = events.iter().map(RunEvent::kind).collect();
    assert_eq!(kinds.first(), Some(&"run_started"));
    assert_eq!(kinds.last(), Some(&"run_finished"));
    assert!(kinds.contains(&"node_started"));
    assert!(kinds.contains(&"node_finished"));
    assert!(events.iter().all(|e| e.run_id() == report.run_id));
}

#[tokio::test]
async fn submission_idempotency_key_reuses_the_run() {
    let scheduler = test_scheduler();
    let graph = linear_graph();

    let first = scheduler
        .submit(&graph, test_config(), Some("ticket-42".into()))
        .await
        .unwrap();
    let second = scheduler
        .submit(&graph, test_config(), Some("ticket-42".into()))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let report = scheduler.execute(&graph, "tests", &first.id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    // The run is no longer claimable once finished.
    assert!(scheduler.execute(&graph, "tests", &first.id).await.is_err());
}

#[tokio::test]
async fn artifact_records_pinned_seed_and_fingerprint() {
    let scheduler = test_scheduler();
    let graph = linear_graph();
    let report = scheduler
        .run_graph(&graph, test_config().with_seed(777))
        .await
        .unwrap();

    let artifact: Artifact = scheduler
        .registry()
        .store()
        .get_artifact("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(artifact.seed, 777);
    assert_eq!(artifact.graph_fingerprint, graph.def().fingerprint());
    assert!(artifact.trace["results"]["classify"]["output"].is_object());
}

#[tokio::test]
async fn graph_mismatch_is_rejected_before_execution() {
    let scheduler = test_scheduler();
    let graph = linear_graph();
    let run = scheduler
        .submit(&graph, test_config(), None)
        .await
        .unwrap();

    let mut drifted = graph.def().clone();
    drifted.version = 2;
    let drifted = validate(drifted).unwrap();
    assert!(scheduler.execute(&drifted, "tests", &run.id).await.is_err());
}
