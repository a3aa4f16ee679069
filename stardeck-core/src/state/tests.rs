#[cfg(test)]
mod tests {
    use crate::audit::{Actor, AuditEvent, AuditSink};
    use crate::state::StateManager;
    use crate::store::{resolve_container, ContainerMetadataUpdate, MetadataStore};
    use crate::types::{
        BackupRecord, ContainerRecord, ContainerStatus, StackRecord, StackStatus, WebUi,
    };
    use chrono::Utc;

    fn stack(name: &str) -> StackRecord {
        let now = Utc::now();
        StackRecord {
            id: format!("stack-{}", name),
            name: name.to_string(),
            compose_content: "services:\n  web:\n    image: nginx\n".to_string(),
            env_content: String::new(),
            path: format!("/srv/stardeck/stacks/{}", name),
            status: StackStatus::Deploying,
            created_by: Some("alice".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_state_manager_init() {
        let manager = StateManager::new_in_memory().await.unwrap();
        manager.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get_container() {
        let manager = StateManager::new_in_memory().await.unwrap();

        let mut record = ContainerRecord::new("4f2a9c1b7e3d", "web", "nginx:1.25");
        record.status = ContainerStatus::Running;
        record.labels.insert("tier".to_string(), "front".to_string());
        record.web_ui = WebUi { enabled: true, port: Some(8080), ..Default::default() };
        manager.insert_container(&record).await.unwrap();

        let retrieved = manager.get_container(&record.id).await.unwrap();
        assert_eq!(retrieved.name, "web");
        assert_eq!(retrieved.status, ContainerStatus::Running);
        assert_eq!(retrieved.labels.get("tier").map(String::as_str), Some("front"));
        assert_eq!(retrieved.web_ui.port, Some(8080));
    }

    #[tokio::test]
    async fn test_duplicate_engine_id_is_conflict() {
        let manager = StateManager::new_in_memory().await.unwrap();

        manager.insert_container(&ContainerRecord::new("abc", "one", "alpine")).await.unwrap();
        let err = manager
            .insert_container(&ContainerRecord::new("abc", "two", "alpine"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_resolve_container_by_any_key() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let record = ContainerRecord::new("4f2a9c1b7e3d5566", "web", "nginx");
        manager.insert_container(&record).await.unwrap();

        for key in [record.id.as_str(), "4f2a9c1b7e3d5566", "4f2a9c", "web"] {
            let found = resolve_container(&manager, key).await.unwrap();
            assert_eq!(found.id, record.id, "key {}", key);
        }

        assert!(resolve_container(&manager, "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_engine_state() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let record = ContainerRecord::new("old", "web", "app:1.0");
        manager.insert_container(&record).await.unwrap();

        manager
            .update_container_engine_state(&record.id, "new", "app:2.0", ContainerStatus::Running)
            .await
            .unwrap();

        let updated = manager.get_container(&record.id).await.unwrap();
        assert_eq!(updated.engine_id, "new");
        assert_eq!(updated.image, "app:2.0");
        assert!(manager.find_container_by_engine_id("old").await.unwrap().is_none());

        let err = manager
            .update_container_status("nope", ContainerStatus::Exited)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_metadata_is_partial() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let mut record = ContainerRecord::new("e1", "web", "nginx");
        record.labels.insert("keep".to_string(), "me".to_string());
        manager.insert_container(&record).await.unwrap();

        let updated = manager
            .update_container_metadata(
                &record.id,
                &ContainerMetadataUpdate { auto_start: Some(true), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(updated.auto_start);
        assert_eq!(updated.labels.len(), 1);
    }

    #[tokio::test]
    async fn test_stack_lifecycle() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let record = stack("blog");
        manager.insert_stack(&record).await.unwrap();

        assert!(manager.insert_stack(&stack("blog")).await.unwrap_err().is_conflict());

        manager.update_stack_status(&record.id, StackStatus::Active).await.unwrap();
        let found = manager.get_stack_by_name("blog").await.unwrap().unwrap();
        assert_eq!(found.status, StackStatus::Active);

        manager
            .update_stack_content(&record.id, "services: {}", "A=1", &record.path)
            .await
            .unwrap();
        assert_eq!(manager.get_stack(&record.id).await.unwrap().env_content, "A=1");

        manager.delete_stack(&record.id).await.unwrap();
        assert!(manager.list_stacks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backups_by_container() {
        let manager = StateManager::new_in_memory().await.unwrap();
        for (id, container) in [("b1", "c1"), ("b2", "c1"), ("b3", "c2")] {
            manager
                .insert_backup(&BackupRecord {
                    id: id.to_string(),
                    container_id: container.to_string(),
                    backup_path: format!("/backups/{}", id),
                    size_bytes: 1024,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(manager.list_backups(None).await.unwrap().len(), 3);
        assert_eq!(manager.list_backups(Some("c1")).await.unwrap().len(), 2);
        let found = manager.find_backup_by_path("/backups/b3").await.unwrap().unwrap();
        assert_eq!(found.container_id, "c2");

        manager.delete_backup("b3").await.unwrap();
        assert!(manager.get_backup("b3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_audit_events_are_persisted() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let actor = Actor::new("alice", Some("192.168.1.4".to_string()));
        manager
            .record(
                AuditEvent::new("container.update", "web", &actor)
                    .with_details(serde_json::json!({"image": "app:2.0"})),
            )
            .await
            .unwrap();

        let events = manager.list_audit_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_id.as_deref(), Some("alice"));
        assert_eq!(events[0].details["image"], "app:2.0");
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("stardeck.db");
        {
            let manager = StateManager::new(&path).await.unwrap();
            manager.insert_stack(&stack("persisted")).await.unwrap();
        }
        let reopened = StateManager::new(&path).await.unwrap();
        assert!(reopened.get_stack_by_name("persisted").await.unwrap().is_some());
    }
}
