//! Large upload worker.
//!
//! A singleton worker drains tasks the pipelined path deferred by size,
//! one at a time, with resumable semantics: a partial upload recorded in
//! `fstaskupload` is continued if its server-side prefix still matches the
//! local file, discarded otherwise, and the finished upload is verified
//! against the local digest before finalization.

use std::io;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::api::{ApiConn, ApiError, Command, ErrorClass};
use crate::cache::cache_file_path;
use crate::checksum::{checksum_file, FileChecksums};
use crate::fileops;
use crate::status::StatusGate;
use crate::store::{Assigned, FsTask, TaskKind, TaskStore};

use super::handlers::{upload_fixup, UploadFixup, INVALID_NAME_PLACEHOLDER};
use super::{EngineError, SharedRef};

/// Guards the one-worker-per-process invariant.
///
/// The claim is released while holding no task; callers that just deferred
/// a task re-check after claiming fails, and the worker re-checks after
/// releasing, so a task marked pending-large during worker exit is never
/// stranded.
#[derive(Debug, Default)]
pub(crate) struct LargeWorkerFlag {
    running: Mutex<bool>,
}

impl LargeWorkerFlag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims the worker slot; false when a worker already runs.
    pub(crate) fn try_claim(&self) -> bool {
        let mut running = self.lock();
        if *running {
            false
        } else {
            *running = true;
            true
        }
    }

    pub(crate) fn release(&self) {
        *self.lock() = false;
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Outcome of one worker attempt at a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRun {
    /// Uploaded and finalized.
    Done,
    /// Task consumed locally (unreadable payload, malformed row).
    Skip,
    /// Transient failure; back off and try again.
    Retry,
}

/// Spawns the worker unless one is already running.
pub(crate) fn ensure_running(shared: &SharedRef) {
    if shared.large_worker.try_claim() {
        let shared = Arc::clone(shared);
        tokio::spawn(run_worker(shared));
    }
}

async fn run_worker(shared: SharedRef) {
    debug!("large upload worker started");
    loop {
        if !shared.is_running() {
            shared.large_worker.release();
            break;
        }
        shared.gate.wait_ready().await;

        let task = match shared.store.next_pending_large().await {
            Ok(task) => task,
            Err(error) => {
                warn!(%error, "could not select deferred task");
                tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
                continue;
            }
        };
        let Some(task) = task else {
            shared.large_worker.release();
            // A task may have been deferred between the query and the
            // release; reclaim it, otherwise exit for good.
            match shared.store.has_pending_large().await {
                Ok(true) if shared.large_worker.try_claim() => continue,
                _ => break,
            }
        };

        if task.kind() != Some(TaskKind::CreateFile) {
            warn!(
                task_id = task.id,
                kind = task.kind_raw,
                "wrong task type deferred to large upload worker, dropping task"
            );
            if let Err(error) = shared.store.delete(task.id).await {
                warn!(task_id = task.id, %error, "could not drop malformed task");
                tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
            }
            continue;
        }

        match upload_task(&shared, &task).await {
            Ok(TaskRun::Done | TaskRun::Skip) => {}
            Ok(TaskRun::Retry) => {
                tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
            }
            Err(error) => {
                warn!(task_id = task.id, %error, "large upload failed");
                tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
            }
        }
    }
    debug!("large upload worker exited");
}

/// Uploads one deferred file create with resume.
async fn upload_task(shared: &SharedRef, task: &FsTask) -> Result<TaskRun, EngineError> {
    let name = task.name().to_string();
    let folderid = task.folder_ref().remote().unwrap_or(0);
    let path = cache_file_path(&shared.config.cache_dir, task.id);
    debug!(task_id = task.id, folderid, name = %name, "uploading deferred file");

    let mut conn = shared.api.acquire();

    // Resume candidate: the latest recorded handle, validated remotely.
    let mut resume: Option<(u64, u64, String)> = None;
    if let Some(uploadid) = shared.store.latest_upload_id(task.id).await? {
        match conn
            .call(Command::new("upload_info").num("uploadid", uploadid))
            .await
        {
            Ok(resp) => {
                let usable = resp.result().map(|r| r == 0).unwrap_or(false);
                if usable {
                    if let (Ok(size), Ok(checksum)) = (resp.uint("size"), resp.str_field("checksum")) {
                        resume = Some((uploadid, size, checksum.to_string()));
                    }
                }
                if resume.is_none() {
                    debug!(uploadid, "stored upload handle not usable, starting fresh");
                }
            }
            Err(error) => {
                warn!(uploadid, %error, "upload_info failed");
                conn.release_bad();
                return Ok(TaskRun::Retry);
            }
        }
    }

    // Digest the local file; on resume also digest the already-uploaded
    // prefix so a file that changed underneath is detected.
    let prefix = resume.as_ref().map(|(_, size, _)| *size);
    let sums = match checksum_file(&path, prefix).await {
        Ok(sums) => sums,
        Err(error) => {
            warn!(task_id = task.id, path = %path.display(), %error, "cannot read cache file, dropping task");
            shared.store.delete(task.id).await?;
            return Ok(TaskRun::Skip);
        }
    };

    let (uploadid, offset) = match validate_resume(resume, &sums) {
        Some((uploadid, offset)) => {
            if offset > 0 {
                debug!(task_id = task.id, offset, "resuming upload");
            }
            (uploadid, offset)
        }
        None => {
            let resp = match conn
                .call(Command::new("upload_create").num("filesize", sums.size))
                .await
            {
                Ok(resp) => resp,
                Err(error) => {
                    warn!(%error, "upload_create failed");
                    conn.release_bad();
                    return Ok(TaskRun::Retry);
                }
            };
            let result = resp.result()?;
            if result != 0 {
                warn!(code = result, "upload_create returned error");
                conn.release();
                return apply_upload_fixup(shared, result, task.id).await;
            }
            let uploadid = resp.uint("uploadid")?;
            shared.store.record_upload_id(task.id, uploadid).await?;
            (uploadid, 0)
        }
    };

    // Stream the remaining bytes in one request.
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) => {
            warn!(task_id = task.id, path = %path.display(), %error, "cannot open cache file, dropping task");
            shared.store.delete(task.id).await?;
            return Ok(TaskRun::Skip);
        }
    };
    if let Err(error) = file.seek(io::SeekFrom::Start(offset)).await {
        warn!(task_id = task.id, %error, "cannot seek cache file");
        return Ok(TaskRun::Retry);
    }

    let length = sums.size - offset;
    let stream = upload_stream(
        file,
        length,
        shared.config.copy_buffer_size,
        Arc::clone(&shared.gate),
    );
    let resp = match conn
        .call(
            Command::new("upload_write")
                .num("uploadid", uploadid)
                .num("uploadoffset", offset)
                .body_stream(length, stream),
        )
        .await
    {
        Ok(resp) => resp,
        Err(error) => {
            warn!(uploadid, %error, "upload_write failed");
            conn.release_bad();
            return Ok(TaskRun::Retry);
        }
    };
    let result = resp.result()?;
    if result != 0 {
        warn!(code = result, "upload_write returned error");
        if ErrorClass::classify(result) == ErrorClass::UploadSuperseded {
            return discard_uploads(shared, conn, task.id).await;
        }
        conn.release();
        return apply_upload_fixup(shared, result, task.id).await;
    }

    // Verify the stored bytes against the local digest before finalizing.
    let resp = match conn
        .call(Command::new("upload_info").num("uploadid", uploadid))
        .await
    {
        Ok(resp) => resp,
        Err(error) => {
            warn!(uploadid, %error, "upload_info failed");
            conn.release_bad();
            return Ok(TaskRun::Retry);
        }
    };
    if resp.result().map(|r| r != 0).unwrap_or(true) {
        warn!(uploadid, "upload_info returned error");
        conn.release();
        return Ok(TaskRun::Retry);
    }
    match resp.str_field("checksum") {
        Ok(checksum) if checksum == sums.sha256 => {}
        _ => {
            warn!(uploadid, "uploaded data does not match local checksum");
            conn.release();
            return Ok(TaskRun::Retry);
        }
    }

    finalize(shared, conn, task, uploadid, folderid, &name, &sums).await
}

/// Accepts the resume candidate only when the remote prefix still matches
/// the local file (and is not longer than it).
fn validate_resume(
    resume: Option<(u64, u64, String)>,
    sums: &FileChecksums,
) -> Option<(u64, u64)> {
    let (uploadid, bytes, remote_sum) = resume?;
    if bytes <= sums.size && sums.prefix_sha256.as_deref() == Some(remote_sum.as_str()) {
        Some((uploadid, bytes))
    } else {
        debug!("partial upload diverged from local file, starting fresh");
        None
    }
}

/// Calls `upload_save` and retires the task in one transaction.
async fn finalize(
    shared: &SharedRef,
    mut conn: ApiConn,
    task: &FsTask,
    uploadid: u64,
    folderid: u64,
    name: &str,
    sums: &FileChecksums,
) -> Result<TaskRun, EngineError> {
    let resp = match conn
        .call(
            Command::new("upload_save")
                .num("folderid", folderid)
                .text("name", name)
                .num("uploadid", uploadid)
                .text("ifhash", "new"),
        )
        .await
    {
        Ok(resp) => resp,
        Err(error) => {
            warn!(uploadid, %error, "upload_save failed");
            conn.release_bad();
            return Ok(TaskRun::Retry);
        }
    };
    conn.release();

    let result = resp.result()?;
    if result != 0 {
        warn!(code = result, "upload_save returned error");
        return apply_upload_fixup(shared, result, task.id).await;
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

    let mut tx = shared.store.database().pool().begin().await?;
    fileops::create_file(
        &mut tx,
        fileid,
        meta.parentfolderid.unwrap_or(folderid),
        meta.name.as_deref().unwrap_or(name),
        meta.size.unwrap_or(sums.size),
        hash,
    )
    .await?;
    let unblocked = TaskStore::complete_in(&mut tx, task.id, Some(Assigned::File(fileid))).await?;
    tx.commit().await?;

    shared.page_cache.file_uploaded(task.id, hash);
    shared.overlay.file_created(folderid, task.id, name);
    if unblocked > 0 {
        shared.wake.wake();
    }
    info!(folderid, name, fileid, "file uploaded");
    Ok(TaskRun::Done)
}

/// Handles "upload superseded": every recorded handle is deleted remotely
/// and forgotten locally, so the next attempt starts clean.
async fn discard_uploads(
    shared: &SharedRef,
    mut conn: ApiConn,
    task_id: i64,
) -> Result<TaskRun, EngineError> {
    for uploadid in shared.store.upload_ids(task_id).await? {
        match conn
            .call(Command::new("upload_delete").num("uploadid", uploadid))
            .await
        {
            Ok(_) => {}
            Err(error) => {
                warn!(uploadid, %error, "upload_delete failed");
                conn.release_bad();
                return Ok(TaskRun::Retry);
            }
        }
    }
    shared.store.clear_uploads(task_id).await?;
    conn.release();
    Ok(TaskRun::Retry)
}

/// Applies the row fixup for a non-zero upload result outside a batch
/// transaction.
async fn apply_upload_fixup(
    shared: &SharedRef,
    result: u64,
    task_id: i64,
) -> Result<TaskRun, EngineError> {
    match upload_fixup(result) {
        UploadFixup::ResetParent => shared.store.reset_parent(task_id).await?,
        UploadFixup::Rename => {
            shared
                .store
                .rename(task_id, INVALID_NAME_PLACEHOLDER)
                .await?;
        }
        UploadFixup::SleepDiskFull => {
            tokio::time::sleep(shared.config.sleep_on_disk_full).await;
        }
        UploadFixup::None => {}
    }
    Ok(TaskRun::Retry)
}

/// Body stream for `upload_write`: fixed-size chunks read from the cache
/// file, re-checking the status gate between chunks so a session
/// interruption pauses the transfer instead of failing it.
fn upload_stream(
    file: tokio::fs::File,
    length: u64,
    chunk_size: usize,
    gate: Arc<StatusGate>,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
    futures_util::stream::try_unfold((file, length), move |(mut file, remaining)| {
        let gate = Arc::clone(&gate);
        async move {
            if remaining == 0 {
                return Ok(None);
            }
            gate.wait_ready().await;
            let want = usize::try_from(remaining.min(chunk_size as u64)).unwrap_or(chunk_size);
            let mut buf = vec![0u8; want];
            let mut read = 0;
            while read < want {
                let n = file.read(&mut buf[read..]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "local file truncated during upload",
                    ));
                }
                read += n;
            }
            Ok(Some((buf, (file, remaining - want as u64))))
        }
    })
}
