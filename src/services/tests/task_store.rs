//! Tests for the in-memory task store

use crate::core::aggregate::placeholder_outcome;
use crate::services::task_store::MemoryTaskStore;
use crate::traits::TaskStore;
use crate::types::{ItemStatus, LineItem, MaterialId, TaskId, TaskStatus};

fn item(code: &str) -> LineItem {
    LineItem {
        ordinal: 0,
        code: code.to_string(),
        category: "steel".to_string(),
        name: format!("material {code}"),
        spec: "spec".to_string(),
        unit: "t".to_string(),
        quantity: 1.0,
        market_price: 10.0,
        tax_rate: 13.0,
        total_price: 10.0,
    }
}

#[tokio::test]
async fn create_assigns_dense_zero_padded_identities() {
    let store = MemoryTaskStore::new();
    let task_id = store
        .create_task(vec![item("A"), item("B"), item("C")], "demo.xlsx")
        .await
        .unwrap();

    let record = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(record.task.status, TaskStatus::Pending);
    assert_eq!(record.task.total_materials, 3);
    let ids: Vec<&str> = record.materials.keys().map(MaterialId::as_str).collect();
    assert_eq!(ids, vec!["0001", "0002", "0003"]);
    assert_eq!(record.materials[&MaterialId::from("0002")].code, "B");
}

#[tokio::test]
async fn upsert_is_idempotent_per_identity() {
    let store = MemoryTaskStore::new();
    let task_id = store.create_task(vec![item("A")], "demo").await.unwrap();
    let id = MaterialId::from("0001");

    let outcome = placeholder_outcome(id.clone(), item("A"), ItemStatus::Complete);
    let count = store
        .upsert_results(&task_id, vec![outcome.clone()])
        .await
        .unwrap();
    assert_eq!(count, 1);

    // same identity again: overwrite, not append
    let replacement = placeholder_outcome(id.clone(), item("A"), ItemStatus::Failed);
    let count = store
        .upsert_results(&task_id, vec![replacement])
        .await
        .unwrap();
    assert_eq!(count, 1);

    let results = store.get_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ItemStatus::Failed);
}

#[tokio::test]
async fn progress_is_clamped() {
    let store = MemoryTaskStore::new();
    let task_id = store.create_task(vec![item("A")], "demo").await.unwrap();

    store.update_progress(&task_id, 250).await.unwrap();
    let progress = store.get_progress(&task_id).await.unwrap().unwrap();
    assert_eq!(progress.progress, 100);
}

#[tokio::test]
async fn delete_cascades_to_materials_and_results() {
    let store = MemoryTaskStore::new();
    let task_id = store.create_task(vec![item("A")], "demo").await.unwrap();
    store
        .upsert_results(
            &task_id,
            vec![placeholder_outcome(
                MaterialId::from("0001"),
                item("A"),
                ItemStatus::Complete,
            )],
        )
        .await
        .unwrap();

    store.delete_task(&task_id).await.unwrap();
    assert!(store.get_task(&task_id).await.unwrap().is_none());
    assert!(store.get_results(&task_id).await.unwrap().is_empty());
    assert!(store.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn list_returns_newest_first() {
    let store = MemoryTaskStore::new();
    let first = store.create_task(vec![item("A")], "first").await.unwrap();
    let second = store.create_task(vec![item("B")], "second").await.unwrap();

    let tasks = store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, second);
    assert_eq!(tasks[1].id, first);
}

#[tokio::test]
async fn metadata_updates_on_missing_task_fail() {
    let store = MemoryTaskStore::new();
    let ghost = TaskId::from_string("task_missing");
    assert!(store.update_status(&ghost, TaskStatus::Failed).await.is_err());
    assert!(store.update_progress(&ghost, 10).await.is_err());
    assert!(store.update_total_materials(&ghost, 5).await.is_err());
    assert!(store
        .upsert_results(
            &ghost,
            vec![placeholder_outcome(
                MaterialId::from("0001"),
                item("A"),
                ItemStatus::Complete
            )]
        )
        .await
        .is_err());
    // deleting an absent task is a no-op, matching cascade-delete semantics
    assert!(store.delete_task(&ghost).await.is_ok());
}
