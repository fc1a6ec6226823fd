mod common;
use common::*;

use gauntlet::model::ChaosConfig;
use gauntlet::run::ConfigOverrides;
use gauntlet::replay::{ReplayController, ReplayError};
use gauntlet::types::{ExecutionMode, RunState};

fn full_drop() -> ChaosConfig {
    ChaosConfig {
        drop_rate: 1.0,
        corrupt_rate: 0.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn full_drop_rate_nulls_every_delivered_input() {
    let scheduler = test_scheduler();
    let graph = linear_graph();

    let report = scheduler
        .run_graph(&graph, test_config().with_chaos(full_drop()))
        .await
        .unwrap();

    let run = scheduler
        .registry()
        .store()
        .get_run("tests", &report.run_id)
        .await
        .unwrap();
    assert_eq!(
        run.results["respond"].resolved_inputs["classify"],
        serde_json::Value::Null
    );
    // The source node has no incoming edges, so chaos had nothing to drop.
    assert!(run.results["classify"].status.is_ok());
}

#[tokio::test]
async fn chaos_runs_with_same_seed_are_reproducible() {
    let graph = diamond_graph();
    let chaos = ChaosConfig {
        drop_rate: 0.4,
        corrupt_rate: 0.4,
        ..Default::default()
    };

    let mut traces = Vec::new();
    for _ in 0..2 {
        let scheduler = test_scheduler();
        let mut config = test_config().with_seed(99).with_chaos(chaos.clone());
        config.policy.continue_on_error = true;
        let report = scheduler.run_graph(&graph, config).await.unwrap();
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
async fn replay_without_overrides_reproduces_the_trace() {
    let scheduler = test_scheduler();
    let graph = linear_graph();
    let store = scheduler.registry().store();

    let original = scheduler
        .run_graph(&graph, test_config().with_seed(2024))
        .await
        .unwrap();

    let controller = ReplayController::new(scheduler.clone());
    let replayed = controller
        .replay(&graph, "tests", &original.run_id, &ConfigOverrides::default())
        .await
        .unwrap();

    let original_artifact = store.get_artifact("tests", &original.run_id).await.unwrap();
    let replay_artifact = store.get_artifact("tests", &replayed.run_id).await.unwrap();
    assert_eq!(original_artifact.trace, replay_artifact.trace);
    assert_eq!(replay_artifact.seed, 2024);
    assert_eq!(replay_artifact.mode, ExecutionMode::Replay);

    let replay_run = controller.fetch("tests", &replayed.run_id).await.unwrap();
    assert_eq!(replay_run.replay_of.as_deref(), Some(original.run_id.as_str()));
    // The original run record is untouched.
    let original_run = store.get_run("tests", &original.run_id).await.unwrap();
    assert!(original_run.replay_of.is_none());
    assert_eq!(original_run.state, RunState::Completed);
}

#[tokio::test]
async fn replay_of_a_chaos_run_reinjects_the_same_faults() {
    let scheduler = test_scheduler();
    let graph = linear_graph();
    let store = scheduler.registry().store();

    let mut config = test_config().with_seed(5).with_chaos(ChaosConfig {
        drop_rate: 0.5,
        corrupt_rate: 0.5,
        ..Default::default()
    });
    config.policy.continue_on_error = true;
    let original = scheduler.run_graph(&graph, config).await.unwrap();

    let controller = ReplayController::new(scheduler.clone());
    let replayed = controller
        .replay(&graph, "tests", &original.run_id, &ConfigOverrides::default())
        .await
        .unwrap();

    let original_artifact = store.get_artifact("tests", &original.run_id).await.unwrap();
    let replay_artifact = store.get_artifact("tests", &replayed.run_id).await.unwrap();
    assert_eq!(original_artifact.trace, replay_artifact.trace);
}

#[tokio::test]
async fn replay_overrides_patch_only_named_fields() {
    let scheduler = test_scheduler();
    let graph = linear_graph();

    let original = scheduler
        .run_graph(&graph, test_config().with_seed(1))
        .await
        .unwrap();

    let controller = ReplayController::new(scheduler.clone());
    let replayed = controller
        .replay(
            &graph,
            "tests",
            &original.run_id,
            &ConfigOverrides {
                seed: Some(2),
                model: Some("gauntlet-large".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let replay_run = controller.fetch("tests", &replayed.run_id).await.unwrap();
    assert_eq!(replay_run.config.seed, 2);
    assert_eq!(replay_run.config.model.as_deref(), Some("gauntlet-large"));
    assert_eq!(replay_run.config.tenant_id, "tests");
    assert_eq!(replay_run.config.max_concurrency, 4);
}

#[tokio::test]
async fn unfinished_runs_cannot_be_replayed() {
    let scheduler = test_scheduler();
    let graph = linear_graph();
    let queued = scheduler
        .submit(&graph, test_config(), None)
        .await
        .unwrap();

    let controller = ReplayController::new(scheduler.clone());
    let err = controller
        .replay(&graph, "tests", &queued.id, &ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::NotTerminal { .. }));
}
