//! Integration tests for stack deploy, actions and removal.

mod common;

use common::{reporter, step_sequence, Harness, Op};
use stardeck_core::engine::ComposeAction;
use stardeck_core::types::StackStatus;
use stardeck_core::workflows::StackDeployRequest;
use stardeck_core::{Actor, MetadataStore, Operation, StackDriver};

const COMPOSE: &str = "services:\n  web:\n    image: nginx:1.27\n  db:\n    image: postgres:16\n";

async fn run(harness: &Harness, operation: Operation) -> (bool, Vec<stardeck_core::ProgressEvent>) {
    let (progress, stream) = reporter();
    let ok = harness.workflows.run(operation, &Actor::new("alice", None), &progress).await.is_ok();
    drop(progress);
    (ok, stream.collect().await)
}

fn deploy(name: &str, compose: &str, env: &str) -> Operation {
    Operation::DeployStack(StackDeployRequest {
        name: name.to_string(),
        compose_content: compose.to_string(),
        env_content: env.to_string(),
    })
}

#[tokio::test]
async fn deploy_renders_files_and_persists_active_status() {
    let harness = Harness::new().await;

    let (ok, events) = run(&harness, deploy("blog", COMPOSE, "TZ=UTC\n")).await;
    assert!(ok);
    assert_eq!(
        step_sequence(&events),
        vec!["validate", "render", "pull", "compose", "status", "complete"]
    );

    let record = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();
    assert_eq!(record.status, StackStatus::Active);
    assert_eq!(record.created_by.as_deref(), Some("alice"));

    let dir = harness.workflows.stacks().stack_dir("blog");
    assert_eq!(record.path, dir.to_string_lossy());
    assert_eq!(std::fs::read_to_string(dir.join("compose.yaml")).unwrap(), COMPOSE);
    assert_eq!(std::fs::read_to_string(dir.join(".env")).unwrap(), "TZ=UTC\n");

    let wire = events.last().unwrap().to_wire();
    assert_eq!(wire["success"], true);
    assert_eq!(wire["stackStatus"], "active");
    assert_eq!(wire["stackId"], record.id);
}

#[tokio::test]
async fn invalid_compose_is_rejected_before_anything_is_written() {
    let harness = Harness::new().await;

    let (ok, events) = run(&harness, deploy("blog", "version: '3'\n", "")).await;
    assert!(!ok);
    assert_eq!(events.last().unwrap().to_wire()["failedStep"], "validate");
    assert!(harness.state.get_stack_by_name("blog").await.unwrap().is_none());
    assert!(!harness.workflows.stacks().stack_dir("blog").exists());
}

#[tokio::test]
async fn compose_failure_persists_error_status() {
    let harness = Harness::new().await;
    harness.engine.fail(Op::Compose, "service \"web\" refers to undefined network");

    let (ok, events) = run(&harness, deploy("blog", COMPOSE, "")).await;
    assert!(!ok);

    let wire = events.last().unwrap().to_wire();
    assert_eq!(wire["failedStep"], "compose");
    assert!(wire["error"].as_str().unwrap().contains("undefined network"));

    let record = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();
    assert_eq!(record.status, StackStatus::Error);
}

#[tokio::test]
async fn redeploy_updates_content_of_existing_record() {
    let harness = Harness::new().await;
    assert!(run(&harness, deploy("blog", COMPOSE, "TZ=UTC\n")).await.0);
    let first = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();

    let single = "services:\n  web:\n    image: nginx:1.27\n";
    assert!(run(&harness, deploy("blog", single, "")).await.0);

    let second = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.compose_content, single);
    assert!(!harness.workflows.stacks().stack_dir("blog").join(".env").exists());
}

#[tokio::test]
async fn stop_and_start_refresh_status() {
    let harness = Harness::new().await;
    assert!(run(&harness, deploy("blog", COMPOSE, "")).await.0);

    let stop = Operation::StackAction { stack: "blog".into(), command: ComposeAction::Stop };
    assert!(run(&harness, stop).await.0);
    let record = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();
    assert_eq!(record.status, StackStatus::Stopped);

    let start = Operation::StackAction { stack: record.id.clone(), command: ComposeAction::Up };
    assert!(run(&harness, start).await.0);
    let record = harness.state.get_stack_by_name("blog").await.unwrap().unwrap();
    assert_eq!(record.status, StackStatus::Active);
}

#[tokio::test]
async fn partial_stack_status() {
    let harness = Harness::new().await;
    assert!(run(&harness, deploy("blog", COMPOSE, "")).await.0);

    let db = harness.engine.named("blog-db-1")[0].engine_id.clone();
    use stardeck_core::ContainerEngine;
    harness.engine.stop_container(&db, std::time::Duration::from_secs(1)).await.unwrap();

    let state = harness.workflows.stacks().status("blog").await.unwrap();
    assert_eq!((state.total, state.running), (2, 1));
    assert_eq!(state.status, StackStatus::Partial);

    let (record, _) = harness.workflows.refresh_stack("blog").await.unwrap();
    assert_eq!(record.status, StackStatus::Partial);
}

#[tokio::test]
async fn remove_takes_stack_down_and_deletes_everything() {
    let harness = Harness::new().await;
    assert!(run(&harness, deploy("blog", COMPOSE, "")).await.0);
    assert_eq!(harness.engine.containers().len(), 2);

    let (ok, events) = run(&harness, Operation::RemoveStack { stack: "blog".into() }).await;
    assert!(ok);
    assert!(step_sequence(&events).contains(&"cleanup".to_string()));
    assert!(harness.engine.containers().is_empty());
    assert!(harness.state.get_stack_by_name("blog").await.unwrap().is_none());
    assert!(!harness.workflows.stacks().stack_dir("blog").exists());
}

#[tokio::test]
async fn concurrent_action_on_same_stack_is_rejected() {
    let harness = Harness::new().await;
    assert!(run(&harness, deploy("blog", COMPOSE, "")).await.0);

    let _held = harness.workflows.locks().stack("blog").unwrap();
    let restart = Operation::StackAction { stack: "blog".into(), command: ComposeAction::Restart };
    let (ok, events) = run(&harness, restart).await;
    assert!(!ok);
    assert!(events.last().unwrap().to_wire()["error"].as_str().unwrap().contains("in progress"));
}

#[tokio::test]
async fn driver_refuses_to_remove_outside_its_root() {
    let harness = Harness::new().await;
    let driver = harness.workflows.stacks();
    let outside = harness.dir.path().join("elsewhere");
    std::fs::create_dir_all(&outside).unwrap();

    assert!(driver.remove_files(&outside).await.is_err());
    assert!(driver.remove_files(driver.stacks_root()).await.is_err());
    assert!(outside.exists());
}

#[tokio::test]
async fn run_requires_rendered_compose_file() {
    let harness = Harness::new().await;
    let driver: &StackDriver = harness.workflows.stacks();
    let dir = driver.stack_dir("ghost");
    let err = driver.run("ghost", &dir, ComposeAction::Up).await.unwrap_err();
    assert!(err.is_not_found());
}
