//! Integration tests exercising the facade the `planrunner` CLI commands
//! are thin wrappers around, using a real throwaway git repository.

use runner_core::facade::PlanRunner;
use runner_core::model::{NodeStatus, PlanSpec, PlanStatus, ProducerId};
use runner_test_utils::TestRepo;

fn two_node_plan() -> PlanSpec {
    serde_json::from_value(serde_json::json!({
        "name": "two-step",
        "baseBranch": "main",
        "startPaused": true,
        "nodes": [
            {
                "producerId": "step-one",
                "name": "step one",
                "task": "do the first thing",
                "work": {"kind": "process", "executable": "true", "args": []}
            },
            {
                "producerId": "step-two",
                "name": "step two",
                "task": "do the second thing",
                "dependencies": ["step-one"],
                "work": {"kind": "process", "executable": "true", "args": []}
            }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn enqueue_then_list_shows_the_plan() {
    let repo = TestRepo::new();
    let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();

    let plan_id = runner.enqueue(two_node_plan()).await.unwrap();

    let plans = runner.list().await;
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].id, plan_id);
    assert_eq!(plans[0].spec.nodes.len(), 2);
}

#[tokio::test]
async fn paused_plan_leaves_every_node_pending() {
    let repo = TestRepo::new();
    let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();

    let plan_id = runner.enqueue(two_node_plan()).await.unwrap();

    let step_one = ProducerId::parse("step-one").unwrap();
    let step_two = ProducerId::parse("step-two").unwrap();
    assert_eq!(runner.get_node(plan_id, &step_one).await.unwrap().state.status, NodeStatus::Pending);
    assert_eq!(runner.get_node(plan_id, &step_two).await.unwrap().state.status, NodeStatus::Pending);

    let plan = runner.get(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Pending);
    assert!(plan.paused);
}

#[tokio::test]
async fn resume_then_cancel_roundtrip() {
    let repo = TestRepo::new();
    let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();

    let plan_id = runner.enqueue(two_node_plan()).await.unwrap();
    runner.resume(plan_id).await.unwrap();
    runner.cancel(plan_id).await.unwrap();

    let plan = runner.get(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Canceled);
}

#[tokio::test]
async fn delete_removes_a_canceled_plan() {
    let repo = TestRepo::new();
    let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();

    let plan_id = runner.enqueue(two_node_plan()).await.unwrap();
    runner.cancel(plan_id).await.unwrap();
    runner.delete(plan_id).await.unwrap();

    assert!(runner.get(plan_id).await.is_err());
}

#[tokio::test]
async fn rehydrating_a_fresh_runner_over_the_same_repo_sees_the_persisted_plan() {
    let repo = TestRepo::new();
    let plan_id = {
        let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();
        runner.enqueue(two_node_plan()).await.unwrap()
    };

    let runner = PlanRunner::bootstrap(repo.config()).await.unwrap();
    let plan = runner.get(plan_id).await.unwrap();
    assert_eq!(plan.spec.name, "two-step");
}
