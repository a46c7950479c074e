//! Per-operation send/process pairs.
//!
//! Each task kind defines how its request is written onto a pipelined
//! connection (`send`) and how the eventual response mutates local state
//! (`process`). Sends never read responses; processing runs later, inside
//! the batch transaction, in send order.

use std::time::Duration;

use sqlx::sqlite::SqliteConnection;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::api::{ApiConn, ApiError, ApiResponse, Command, ErrorClass};
use crate::cache::cache_file_path;
use crate::fileops;
use crate::store::{Assigned, FsTask, Ref, TaskKind, TaskStore};

use super::large;
use super::{EngineError, EngineShared, SharedRef};

/// Name written into a task whose requested name the server rejected.
pub(crate) const INVALID_NAME_PLACEHOLDER: &str = "Invalid Name Requested";

/// Result of writing a task's request onto the pipelined channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// Request issued; a response will arrive in send order.
    Sent,
    /// Nothing sent; the task was consumed locally (unrecoverable or
    /// malformed) and no response must be expected.
    Skipped,
    /// The task must not run on the pipelined channel (large file create).
    Defer,
}

/// Result of interpreting a task's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    /// Success; complete the task (rewriting placeholders when an id was
    /// assigned).
    Completed(Option<Assigned>),
    /// The task stays for a later attempt. Any fixup has already been
    /// applied to its row.
    Retry,
    /// As `Retry`, but the caller should back off after committing.
    RetryAfter(Duration),
}

/// Row fixup derived from an upload error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadFixup {
    /// Point the task at the root folder.
    ResetParent,
    /// Replace the rejected name.
    Rename,
    /// Account over quota; back off before the next attempt.
    SleepDiskFull,
    /// No fixup; plain retry.
    None,
}

/// Maps a non-zero upload result code onto its row fixup.
pub(crate) fn upload_fixup(result: u64) -> UploadFixup {
    match ErrorClass::classify(result) {
        ErrorClass::ParentMissing | ErrorClass::FolderMissing | ErrorClass::AccessDenied => {
            UploadFixup::ResetParent
        }
        ErrorClass::InvalidName => UploadFixup::Rename,
        ErrorClass::OverQuota => UploadFixup::SleepDiskFull,
        _ => UploadFixup::None,
    }
}

/// Writes the request for `task` onto `conn`.
pub(crate) async fn send(
    shared: &SharedRef,
    conn: &mut ApiConn,
    task: &FsTask,
) -> Result<SendOutcome, EngineError> {
    match task.kind() {
        Some(TaskKind::MkDir) => send_mkdir(shared, conn, task).await,
        Some(TaskKind::RmDir) => send_rmdir(conn, task),
        Some(TaskKind::CreateFile) => send_create_file(shared, conn, task).await,
        Some(TaskKind::Unlink) => send_unlink(shared, conn, task).await,
        None => {
            warn!(task_id = task.id, kind = task.kind_raw, "bad task type, dropping task");
            shared.store.delete(task.id).await?;
            Ok(SendOutcome::Skipped)
        }
    }
}

/// Interprets the response for `task` inside the batch transaction.
pub(crate) async fn process(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    task: &FsTask,
    resp: &ApiResponse,
) -> Result<ProcessOutcome, EngineError> {
    match task.kind() {
        Some(TaskKind::MkDir) => process_mkdir(shared, conn, task, resp).await,
        Some(TaskKind::RmDir) => process_rmdir(shared, conn, task, resp).await,
        Some(TaskKind::CreateFile) => process_create_file(shared, conn, task, resp).await,
        Some(TaskKind::Unlink) => process_unlink(shared, conn, task, resp).await,
        None => Ok(ProcessOutcome::Retry),
    }
}

/// Re-issues a deferred file create with no connection: the task leaves the
/// pipelined path and the large upload worker takes over.
pub(crate) async fn defer_to_large(shared: &SharedRef, task: &FsTask) -> Result<(), EngineError> {
    debug!(
        task_id = task.id,
        name = task.name(),
        "uploading file separately due to size"
    );
    shared.store.mark_pending_large(task.id).await?;
    large::ensure_running(shared);
    Ok(())
}

/// Resolves a reference that dispatch eligibility promises is real.
///
/// A still-pending reference here means the producer forgot the dependency
/// edge; the task can never succeed and is dropped.
async fn resolved(shared: &EngineShared, task: &FsTask, reference: Ref) -> Result<Option<u64>, EngineError> {
    match reference.remote() {
        Some(id) => Ok(Some(id)),
        None => {
            warn!(
                task_id = task.id,
                reference = reference.to_column(),
                "task references an unresolved placeholder without an edge, dropping task"
            );
            shared.store.delete(task.id).await?;
            Ok(None)
        }
    }
}

async fn send_mkdir(
    shared: &EngineShared,
    conn: &mut ApiConn,
    task: &FsTask,
) -> Result<SendOutcome, EngineError> {
    let Some(folderid) = resolved(shared, task, task.folder_ref()).await? else {
        return Ok(SendOutcome::Skipped);
    };
    conn.send(
        Command::new("createfolderifnotexists")
            .num("folderid", folderid)
            .text("name", task.name()),
    )?;
    Ok(SendOutcome::Sent)
}

fn send_rmdir(conn: &mut ApiConn, task: &FsTask) -> Result<SendOutcome, EngineError> {
    #[allow(clippy::cast_sign_loss)]
    let folderid = task.int1.max(0) as u64;
    conn.send(Command::new("deletefolder").num("folderid", folderid))?;
    Ok(SendOutcome::Sent)
}

async fn send_unlink(
    shared: &EngineShared,
    conn: &mut ApiConn,
    task: &FsTask,
) -> Result<SendOutcome, EngineError> {
    let Some(fileid) = resolved(shared, task, task.file_ref()).await? else {
        return Ok(SendOutcome::Skipped);
    };
    conn.send(Command::new("deletefile").num("fileid", fileid))?;
    Ok(SendOutcome::Sent)
}

async fn send_create_file(
    shared: &EngineShared,
    conn: &mut ApiConn,
    task: &FsTask,
) -> Result<SendOutcome, EngineError> {
    let Some(folderid) = resolved(shared, task, task.folder_ref()).await? else {
        return Ok(SendOutcome::Skipped);
    };

    let path = cache_file_path(&shared.config.cache_dir, task.id);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) => {
            warn!(task_id = task.id, path = %path.display(), %error, "cannot open cache file, dropping task");
            shared.store.delete(task.id).await?;
            return Ok(SendOutcome::Skipped);
        }
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(error) => {
            warn!(task_id = task.id, path = %path.display(), %error, "cannot stat cache file, dropping task");
            shared.store.delete(task.id).await?;
            return Ok(SendOutcome::Skipped);
        }
    };

    if size > shared.config.direct_upload_limit {
        debug!(task_id = task.id, name = task.name(), size, "defering upload due to size");
        return Ok(SendOutcome::Defer);
    }

    debug!(task_id = task.id, name = task.name(), size, "uploading file pipelined");
    let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    if let Err(error) = file.read_to_end(&mut bytes).await {
        warn!(task_id = task.id, path = %path.display(), %error, "cannot read cache file, dropping task");
        shared.store.delete(task.id).await?;
        return Ok(SendOutcome::Skipped);
    }

    conn.send(
        Command::new("uploadfile")
            .num("folderid", folderid)
            .text("filename", task.name())
            .flag("nopartial", true)
            .text("ifhash", "new")
            .body_bytes(bytes),
    )?;
    Ok(SendOutcome::Sent)
}

async fn process_mkdir(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    task: &FsTask,
    resp: &ApiResponse,
) -> Result<ProcessOutcome, EngineError> {
    let parent = task.folder_ref().remote().unwrap_or(0);
    let result = resp.result()?;
    if result != 0 {
        warn!(task_id = task.id, code = result, "createfolderifnotexists returned error");
        match ErrorClass::classify(result) {
            ErrorClass::ParentMissing | ErrorClass::AccessDenied => {
                TaskStore::reset_parent_in(conn, task.id).await?;
            }
            ErrorClass::InvalidName => {
                TaskStore::rename_in(conn, task.id, INVALID_NAME_PLACEHOLDER).await?;
            }
            _ => {}
        }
        return Ok(ProcessOutcome::Retry);
    }

    let meta = resp.metadata()?;
    let folderid = meta.folderid.ok_or(ApiError::MissingField {
        call: resp.call(),
        field: "folderid",
    })?;
    fileops::create_folder(
        conn,
        folderid,
        meta.parentfolderid.unwrap_or(parent),
        meta.name.as_deref().unwrap_or(task.name()),
    )
    .await?;
    shared
        .overlay
        .folder_created(parent, task.id, folderid, task.name());
    debug!(parent, name = task.name(), folderid, "folder created");
    Ok(ProcessOutcome::Completed(Some(Assigned::Folder(folderid))))
}

async fn process_rmdir(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    task: &FsTask,
    resp: &ApiResponse,
) -> Result<ProcessOutcome, EngineError> {
    let parent = task.folder_ref().remote().unwrap_or(0);
    #[allow(clippy::cast_sign_loss)]
    let folderid = task.int1.max(0) as u64;
    let result = resp.result()?;
    if result == 0 {
        fileops::delete_folder(conn, folderid).await?;
        shared.overlay.folder_deleted(parent, task.id, task.name());
        debug!(parent, name = task.name(), "folder deleted");
        return Ok(ProcessOutcome::Completed(None));
    }

    warn!(task_id = task.id, code = result, "deletefolder returned error");
    match ErrorClass::classify(result) {
        // Already gone remotely: success as far as the overlay cares.
        ErrorClass::FolderMissing => {
            fileops::delete_folder(conn, folderid).await?;
            shared.overlay.folder_deleted(parent, task.id, task.name());
            Ok(ProcessOutcome::Completed(None))
        }
        ErrorClass::AccessDenied | ErrorClass::FolderNotEmpty | ErrorClass::FolderShared => {
            shared.overlay.folder_deleted(parent, task.id, task.name());
            Ok(ProcessOutcome::Completed(None))
        }
        _ => Ok(ProcessOutcome::Retry),
    }
}

async fn process_create_file(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    task: &FsTask,
    resp: &ApiResponse,
) -> Result<ProcessOutcome, EngineError> {
    let parent = task.folder_ref().remote().unwrap_or(0);
    let result = resp.result()?;
    if result != 0 {
        warn!(task_id = task.id, code = result, "uploadfile returned error");
        return apply_upload_fixup_in(shared, conn, result, task.id).await;
    }

    let meta = resp.metadata()?;
    let fileid = meta.fileid.ok_or(ApiError::MissingField {
        call: resp.call(),
        field: "fileid",
    })?;
    let hash = meta.hash.ok_or(ApiError::MissingField {
        call: resp.call(),
        field: "hash",
    })?;
    fileops::create_file(
        conn,
        fileid,
        meta.parentfolderid.unwrap_or(parent),
        meta.name.as_deref().unwrap_or(task.name()),
        meta.size.unwrap_or(0),
        hash,
    )
    .await?;
    shared.page_cache.file_uploaded(task.id, hash);
    shared.overlay.file_created(parent, task.id, task.name());
    debug!(parent, name = task.name(), fileid, "file uploaded");
    Ok(ProcessOutcome::Completed(Some(Assigned::File(fileid))))
}

async fn process_unlink(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    task: &FsTask,
    resp: &ApiResponse,
) -> Result<ProcessOutcome, EngineError> {
    let parent = task.folder_ref().remote().unwrap_or(0);
    let fileid = task.file_ref().remote().unwrap_or(0);
    let result = resp.result()?;
    if result == 0 {
        fileops::delete_file(conn, fileid).await?;
        shared.overlay.file_deleted(parent, task.id, task.name());
        debug!(parent, name = task.name(), "file deleted");
        return Ok(ProcessOutcome::Completed(None));
    }

    warn!(task_id = task.id, code = result, "deletefile returned error");
    match ErrorClass::classify(result) {
        // Already gone remotely: success as far as the overlay cares.
        ErrorClass::FileMissing => {
            fileops::delete_file(conn, fileid).await?;
            shared.overlay.file_deleted(parent, task.id, task.name());
            Ok(ProcessOutcome::Completed(None))
        }
        ErrorClass::AccessDenied => {
            shared.overlay.file_deleted(parent, task.id, task.name());
            Ok(ProcessOutcome::Completed(None))
        }
        _ => Ok(ProcessOutcome::Retry),
    }
}

/// Applies the row fixup for a non-zero upload result inside the batch
/// transaction.
async fn apply_upload_fixup_in(
    shared: &EngineShared,
    conn: &mut SqliteConnection,
    result: u64,
    task_id: i64,
) -> Result<ProcessOutcome, EngineError> {
    match upload_fixup(result) {
        UploadFixup::ResetParent => {
            TaskStore::reset_parent_in(conn, task_id).await?;
            Ok(ProcessOutcome::Retry)
        }
        UploadFixup::Rename => {
            TaskStore::rename_in(conn, task_id, INVALID_NAME_PLACEHOLDER).await?;
            Ok(ProcessOutcome::Retry)
        }
        UploadFixup::SleepDiskFull => {
            Ok(ProcessOutcome::RetryAfter(shared.config.sleep_on_disk_full))
        }
        UploadFixup::None => Ok(ProcessOutcome::Retry),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use crate::engine::test_support::test_shared;
    use crate::overlay::OverlayEvent;
    use crate::store::NewTask;
    use serde_json::json;

    #[test]
    fn test_upload_fixup_mapping() {
        assert_eq!(upload_fixup(2002), UploadFixup::ResetParent);
        assert_eq!(upload_fixup(2003), UploadFixup::ResetParent);
        assert_eq!(upload_fixup(2005), UploadFixup::ResetParent);
        assert_eq!(upload_fixup(2001), UploadFixup::Rename);
        assert_eq!(upload_fixup(2008), UploadFixup::SleepDiskFull);
        assert_eq!(upload_fixup(2999), UploadFixup::None);
    }

    #[tokio::test]
    async fn test_process_mkdir_success_completes_with_folder_id() {
        let (shared, overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::mkdir(Ref::ROOT, "docs"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new(
            "createfolderifnotexists",
            json!({"result": 0, "metadata": {"folderid": 100, "name": "docs", "parentfolderid": 0}}),
        );

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed(Some(Assigned::Folder(100)))
        );
        assert_eq!(
            overlay.events(),
            vec![OverlayEvent::FolderCreated {
                parent: 0,
                task_id: id,
                folderid: 100,
                name: "docs".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_process_mkdir_invalid_name_renames_task() {
        let (shared, _overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::mkdir(Ref::ROOT, "bad*name"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("createfolderifnotexists", json!({"result": 2001}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Retry);
        drop(conn);

        let fixed = shared.store.get(id).await.unwrap().unwrap();
        assert_eq!(fixed.name(), INVALID_NAME_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_process_mkdir_parent_missing_resets_parent() {
        let (shared, _overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::mkdir(Ref::Remote(55), "docs"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("createfolderifnotexists", json!({"result": 2002}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Retry);
        drop(conn);

        let fixed = shared.store.get(id).await.unwrap().unwrap();
        assert_eq!(fixed.folder_ref(), Ref::Remote(0));
    }

    #[tokio::test]
    async fn test_process_rmdir_folder_gone_counts_as_success() {
        let (shared, overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::rmdir(Ref::Remote(9), 77, "old"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("deletefolder", json!({"result": 2005}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed(None));
        assert_eq!(
            overlay.events(),
            vec![OverlayEvent::FolderDeleted {
                parent: 9,
                task_id: id,
                name: "old".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_process_rmdir_unknown_error_retries() {
        let (shared, overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::rmdir(Ref::Remote(9), 77, "old"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("deletefolder", json!({"result": 5000}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Retry);
        assert!(overlay.events().is_empty());
    }

    #[tokio::test]
    async fn test_process_create_file_over_quota_backs_off() {
        let (shared, _overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::create_file(Ref::ROOT, "f.bin"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("uploadfile", json!({"result": 2008}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::RetryAfter(shared.config.sleep_on_disk_full)
        );
    }

    #[tokio::test]
    async fn test_process_unlink_access_denied_counts_as_success() {
        let (shared, overlay, _cache, _dirs) = test_shared().await;
        let id = shared
            .store
            .insert_task(&NewTask::unlink(Ref::Remote(9), Ref::Remote(31), "f"))
            .await
            .unwrap();
        let task = shared.store.get(id).await.unwrap().unwrap();
        let resp = ApiResponse::new("deletefile", json!({"result": 2003}));

        let mut conn = shared.store.database().pool().acquire().await.unwrap();
        let outcome = process(&shared, &mut conn, &task, &resp).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed(None));
        assert_eq!(
            overlay.events(),
            vec![OverlayEvent::FileDeleted {
                parent: 9,
                task_id: id,
                name: "f".to_string()
            }]
        );
    }
}
