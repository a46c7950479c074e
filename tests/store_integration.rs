//! Task-store invariants against a real (file-backed) database.

use tempfile::TempDir;
use uploader_core::{Assigned, Database, NewTask, Ref, TaskStore};

async fn file_backed_store() -> (TaskStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("tasks.db")).await.unwrap();
    (TaskStore::new(db), dir)
}

#[tokio::test]
async fn test_completion_is_atomic_with_rewrite_and_unblock() {
    let (store, _dir) = file_backed_store().await;

    let mkdir = store.insert_task(&NewTask::mkdir(Ref::ROOT, "A")).await.unwrap();
    let child = store
        .insert_task_with_dependencies(&NewTask::mkdir(Ref::Pending(mkdir), "B"), &[mkdir])
        .await
        .unwrap();
    let file = store
        .insert_task_with_dependencies(
            &NewTask::create_file(Ref::Pending(mkdir), "f.bin"),
            &[mkdir],
        )
        .await
        .unwrap();

    let mut tx = store.database().pool().begin().await.unwrap();
    let unblocked = TaskStore::complete_in(&mut tx, mkdir, Some(Assigned::Folder(500)))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // One committed transaction: row gone, both dependents rewritten, both
    // edges gone.
    assert_eq!(unblocked, 2);
    assert!(store.get(mkdir).await.unwrap().is_none());
    assert_eq!(
        store.get(child).await.unwrap().unwrap().folder_ref(),
        Ref::Remote(500)
    );
    assert_eq!(
        store.get(file).await.unwrap().unwrap().folder_ref(),
        Ref::Remote(500)
    );

    let batch = store.next_ready_batch(10).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, child);
    assert_eq!(batch[1].id, file);
}

#[tokio::test]
async fn test_uncommitted_completion_leaves_no_trace() {
    // Crash-before-commit: dropping the transaction rolls everything back.
    let (store, _dir) = file_backed_store().await;

    let mkdir = store.insert_task(&NewTask::mkdir(Ref::ROOT, "A")).await.unwrap();
    let child = store
        .insert_task_with_dependencies(&NewTask::mkdir(Ref::Pending(mkdir), "B"), &[mkdir])
        .await
        .unwrap();

    {
        let mut tx = store.database().pool().begin().await.unwrap();
        TaskStore::complete_in(&mut tx, mkdir, Some(Assigned::Folder(500)))
            .await
            .unwrap();
        // No commit: the transaction is dropped here.
    }

    assert!(store.get(mkdir).await.unwrap().is_some());
    assert_eq!(
        store.get(child).await.unwrap().unwrap().folder_ref(),
        Ref::Pending(mkdir)
    );
    let batch = store.next_ready_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1, "dependent must still be blocked");
    assert_eq!(batch[0].id, mkdir);
}

#[tokio::test]
async fn test_upload_handles_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");

    let task_id = {
        let db = Database::new(&path).await.unwrap();
        let store = TaskStore::new(db.clone());
        let id = store
            .insert_task(&NewTask::create_file(Ref::ROOT, "big.bin"))
            .await
            .unwrap();
        store.mark_pending_large(id).await.unwrap();
        store.record_upload_id(id, 42).await.unwrap();
        store.record_upload_id(id, 57).await.unwrap();
        db.close().await;
        id
    };

    let db = Database::new(&path).await.unwrap();
    let store = TaskStore::new(db);
    assert_eq!(store.latest_upload_id(task_id).await.unwrap(), Some(57));
    assert_eq!(store.upload_ids(task_id).await.unwrap(), vec![42, 57]);

    let pending = store.next_pending_large().await.unwrap().unwrap();
    assert_eq!(pending.id, task_id);
}

#[tokio::test]
async fn test_eligibility_excludes_blocked_and_deferred_tasks() {
    let (store, _dir) = file_backed_store().await;

    let ready = store.insert_task(&NewTask::mkdir(Ref::ROOT, "a")).await.unwrap();
    let blocked = store
        .insert_task_with_dependencies(&NewTask::mkdir(Ref::Pending(ready), "b"), &[ready])
        .await
        .unwrap();
    let deferred = store
        .insert_task(&NewTask::create_file(Ref::ROOT, "big.bin"))
        .await
        .unwrap();
    store.mark_pending_large(deferred).await.unwrap();

    let batch = store.next_ready_batch(10).await.unwrap();
    assert_eq!(batch.iter().map(|t| t.id).collect::<Vec<_>>(), vec![ready]);

    // The deferred task belongs to the worker's queue instead.
    assert_eq!(store.next_pending_large().await.unwrap().unwrap().id, deferred);
    let _ = blocked;
}

#[tokio::test]
async fn test_add_dependency_after_insert_blocks_task() {
    let (store, _dir) = file_backed_store().await;

    let first = store.insert_task(&NewTask::mkdir(Ref::ROOT, "a")).await.unwrap();
    let second = store.insert_task(&NewTask::mkdir(Ref::ROOT, "b")).await.unwrap();

    store.add_dependency(second, first).await.unwrap();
    // Duplicate edges are ignored.
    store.add_dependency(second, first).await.unwrap();

    let batch = store.next_ready_batch(10).await.unwrap();
    assert_eq!(batch.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first]);
}

#[tokio::test]
async fn test_completion_without_assignment_only_unblocks() {
    let (store, _dir) = file_backed_store().await;

    let unlink = store
        .insert_task(&NewTask::unlink(Ref::Remote(5), Ref::Remote(31), "f"))
        .await
        .unwrap();
    let after = store
        .insert_task_with_dependencies(&NewTask::mkdir(Ref::Remote(5), "x"), &[unlink])
        .await
        .unwrap();

    let mut tx = store.database().pool().begin().await.unwrap();
    let unblocked = TaskStore::complete_in(&mut tx, unlink, None).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(unblocked, 1);
    assert!(store.get(unlink).await.unwrap().is_none());
    let batch = store.next_ready_batch(10).await.unwrap();
    assert_eq!(batch.iter().map(|t| t.id).collect::<Vec<_>>(), vec![after]);
}
