//! Integration tests for container deploy, lifecycle, adoption and backups.

mod common;

use common::{reporter, step_sequence, Harness, Op};
use stardeck_core::progress::ProgressReporter;
use stardeck_core::store::ContainerMetadataUpdate;
use stardeck_core::types::{ContainerStatus, WebUi};
use stardeck_core::workflows::{AdoptRequest, ContainerDeployRequest};
use stardeck_core::{Actor, ContainerSpec, MetadataStore, Operation};

fn deploy_request(name: &str, image: &str) -> ContainerDeployRequest {
    ContainerDeployRequest {
        spec: ContainerSpec::new(name, image),
        web_ui: Some(WebUi { enabled: true, port: Some(8080), ..Default::default() }),
        auto_start: true,
        ..Default::default()
    }
}

async fn deploy(
    harness: &Harness,
    request: ContainerDeployRequest,
) -> (bool, Vec<stardeck_core::ProgressEvent>) {
    let (progress, stream) = reporter();
    let ok = harness
        .workflows
        .run(Operation::DeployContainer(request), &Actor::new("alice", None), &progress)
        .await
        .is_ok();
    drop(progress);
    (ok, stream.collect().await)
}

#[tokio::test]
async fn deploy_pulls_creates_starts_and_records() {
    let harness = Harness::new().await;

    let (ok, events) = deploy(&harness, deploy_request("web", "nginx:1.27")).await;
    assert!(ok);
    assert_eq!(
        step_sequence(&events),
        vec!["validate", "pull", "create", "start", "metadata", "complete"]
    );

    let container = &harness.engine.named("web")[0];
    assert!(container.running);

    let record = harness.state.find_container_by_name("web").await.unwrap().unwrap();
    assert_eq!(record.engine_id, container.engine_id);
    assert_eq!(record.status, ContainerStatus::Running);
    assert!(record.auto_start);
    assert_eq!(record.web_ui.port, Some(8080));
    assert_eq!(record.created_by.as_deref(), Some("alice"));

    let wire = events.last().unwrap().to_wire();
    assert_eq!(wire["containerId"], record.id);
    assert_eq!(wire["engineId"], container.engine_id);
}

#[tokio::test]
async fn deploy_rejects_taken_name() {
    let harness = Harness::new().await;
    harness.managed("web", "nginx:1.27", &[]).await;

    let (ok, events) = deploy(&harness, deploy_request("web", "nginx:1.27")).await;
    assert!(!ok);
    let wire = events.last().unwrap().to_wire();
    assert_eq!(wire["failedStep"], "validate");
    assert!(wire["error"].as_str().unwrap().contains("already exists"));
    assert_eq!(harness.engine.named("web").len(), 1);
}

#[tokio::test]
async fn deploy_start_failure_removes_the_new_container() {
    let harness = Harness::new().await;
    harness.engine.fail_start_of_new_containers();

    let (ok, events) = deploy(&harness, deploy_request("web", "nginx:1.27")).await;
    assert!(!ok);
    assert_eq!(events.last().unwrap().to_wire()["failedStep"], "start");
    assert!(harness.engine.containers().is_empty());
    assert!(harness.state.list_containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn deploy_partial_create_is_removed() {
    let harness = Harness::new().await;
    harness.engine.fail(Op::CreatePartial, "timeout while creating");

    let (ok, events) = deploy(&harness, deploy_request("web", "nginx:1.27")).await;
    assert!(!ok);
    assert_eq!(events.last().unwrap().to_wire()["failedStep"], "create");
    assert!(harness.engine.containers().is_empty());
}

#[tokio::test]
async fn lifecycle_updates_record_status() {
    let harness = Harness::new().await;
    let record = harness.managed("web", "nginx:1.27", &[]).await;
    let actor = Actor::system();

    harness.workflows.stop_container("web", Some(1), &actor).await.unwrap();
    assert!(!harness.engine.named("web")[0].running);
    let stored = harness.state.get_container(&record.id).await.unwrap();
    assert_eq!(stored.status, ContainerStatus::Exited);

    harness.workflows.start_container(&record.id, &actor).await.unwrap();
    let stored = harness.state.get_container(&record.id).await.unwrap();
    assert_eq!(stored.status, ContainerStatus::Running);

    harness.workflows.restart_container(&record.engine_id, None, &actor).await.unwrap();
    assert!(harness.engine.named("web")[0].running);

    harness.workflows.remove_container("web", true, &actor).await.unwrap();
    assert!(harness.engine.containers().is_empty());
    assert!(harness.state.get_container(&record.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn lifecycle_works_on_unmanaged_containers() {
    let harness = Harness::new().await;
    harness.engine.add_image("redis:7");
    harness.engine.add_running(ContainerSpec::new("cache", "redis:7"));

    harness.workflows.stop_container("cache", None, &Actor::system()).await.unwrap();
    assert!(!harness.engine.named("cache")[0].running);
    assert!(harness.state.list_containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn adopt_and_release() {
    let harness = Harness::new().await;
    harness.engine.add_image("redis:7");
    let engine_id = harness.engine.add_running(ContainerSpec::new("cache", "redis:7"));
    let actor = Actor::new("bob", Some("10.0.0.2".to_string()));

    let request = AdoptRequest { container: "cache".to_string(), ..Default::default() };
    let record = harness.workflows.adopt_container(request.clone(), &actor).await.unwrap();
    assert_eq!(record.engine_id, engine_id);
    assert_eq!(record.image, "redis:7");
    assert_eq!(record.status, ContainerStatus::Running);

    let again = harness.workflows.adopt_container(request, &actor).await.unwrap_err();
    assert!(again.is_conflict());

    harness.workflows.release_container("cache", &actor).await.unwrap();
    assert!(harness.state.list_containers().await.unwrap().is_empty());
    assert_eq!(harness.engine.named("cache").len(), 1, "release keeps the container");
}

#[tokio::test]
async fn adopt_is_rejected_while_the_name_is_locked() {
    let harness = Harness::new().await;
    harness.engine.add_image("redis:7");
    harness.engine.add_running(ContainerSpec::new("cache", "redis:7"));

    let guard = harness.workflows.locks().container("cache").unwrap();
    let request = AdoptRequest { container: "cache".to_string(), ..Default::default() };
    let err = harness.workflows.adopt_container(request.clone(), &Actor::system()).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(harness.state.list_containers().await.unwrap().is_empty());

    drop(guard);
    harness.workflows.adopt_container(request, &Actor::system()).await.unwrap();
    assert_eq!(harness.state.list_containers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn retained_backups_cannot_be_adopted() {
    let harness = Harness::new().await;
    harness.engine.add_image("app:1.0");
    harness.engine.add_running(ContainerSpec::new("web_backup_20240501120000", "app:1.0"));

    let request =
        AdoptRequest { container: "web_backup_20240501120000".to_string(), ..Default::default() };
    let err = harness.workflows.adopt_container(request, &Actor::system()).await.unwrap_err();
    assert!(matches!(err, stardeck_core::StardeckError::ValidationFailed { .. }));
}

#[tokio::test]
async fn metadata_update_is_partial() {
    let harness = Harness::new().await;
    let record = harness.managed("web", "nginx:1.27", &[]).await;

    let update = ContainerMetadataUpdate { auto_start: Some(true), ..Default::default() };
    let updated =
        harness.workflows.update_container_metadata("web", &update, &Actor::system()).await.unwrap();
    assert!(updated.auto_start);
    assert_eq!(updated.web_ui, record.web_ui);
}

#[tokio::test]
async fn manual_backup_and_delete() {
    let harness = Harness::new().await;
    let data = harness.host_dir("data");
    let record = harness.managed("web", "nginx:1.27", &[(data.as_str(), "/data")]).await;
    let actor = Actor::system();

    let backup = harness
        .workflows
        .backup_container("web", false, &actor, &ProgressReporter::noop())
        .await
        .unwrap();
    assert_eq!(backup.container_id, record.id);
    assert!(std::path::Path::new(&backup.backup_path).join("manifest.json").exists());

    // Same container, same mounts, same day: collides unless overwriting.
    let collision = harness
        .workflows
        .backup_container("web", false, &actor, &ProgressReporter::noop())
        .await
        .unwrap_err();
    assert!(collision.is_conflict());

    let replaced = harness
        .workflows
        .backup_container("web", true, &actor, &ProgressReporter::noop())
        .await
        .unwrap();
    assert_eq!(replaced.backup_path, backup.backup_path);
    assert_eq!(harness.workflows.backups().list(None).await.unwrap().len(), 1);

    harness.workflows.delete_backup(&replaced.id, &actor).await.unwrap();
    assert!(harness.workflows.backups().list(None).await.unwrap().is_empty());
    assert!(!std::path::Path::new(&replaced.backup_path).exists());
}
