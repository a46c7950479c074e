//! Pipelined batch runner.
//!
//! Small tasks are issued back-to-back on one connection, overlapping sends
//! with response reads, then processed under a single transaction. The
//! two-cursor scheme relies on the connection handing responses back in
//! send order.

use std::time::Duration;

use tracing::{debug, warn};

use crate::api::ApiResponse;
use crate::store::{FsTask, TaskStore};

use super::handlers::{self, ProcessOutcome, SendOutcome};
use super::{EngineError, SharedRef};

/// What the processing pass learned about the batch.
struct BatchReport {
    /// A completed task unblocked at least one dependent.
    unblocked: bool,
    /// A handler asked for a back-off after commit (over-quota).
    backoff: Option<Duration>,
}

/// Runs one batch of ready tasks end to end.
///
/// A lost connection mid-batch still commits every task whose response was
/// read; unsent tasks simply stay ready for the next iteration.
pub(crate) async fn run_batch(shared: &SharedRef, tasks: &[FsTask]) -> Result<(), EngineError> {
    let mut conn = shared.api.acquire();
    let mut responses: Vec<Option<ApiResponse>> = (0..tasks.len()).map(|_| None).collect();
    // Indices of tasks actually written to the wire; responses come back in
    // this order.
    let mut sent: Vec<usize> = Vec::new();
    let mut recv_pos = 0usize;
    let mut deferred: Option<usize> = None;
    let mut broken = false;

    'send: for (idx, task) in tasks.iter().enumerate() {
        match handlers::send(shared, &mut conn, task).await {
            Ok(SendOutcome::Sent) => sent.push(idx),
            Ok(SendOutcome::Skipped) => continue,
            Ok(SendOutcome::Defer) => {
                deferred = Some(idx);
                break 'send;
            }
            Err(error) => {
                warn!(task_id = task.id, %error, "sending task failed");
                broken = true;
                break 'send;
            }
        }
        // Overlap: drain one response if one is already waiting.
        if recv_pos < sent.len() {
            match conn.try_take_response().await {
                Some(Ok(resp)) => {
                    responses[sent[recv_pos]] = Some(resp);
                    recv_pos += 1;
                }
                Some(Err(error)) => {
                    warn!(%error, "receiving pipelined response failed");
                    broken = true;
                    break 'send;
                }
                None => {}
            }
        }
    }

    if !broken {
        while recv_pos < sent.len() {
            match conn.recv().await {
                Ok(resp) => {
                    responses[sent[recv_pos]] = Some(resp);
                    recv_pos += 1;
                }
                Err(error) => {
                    warn!(%error, "receiving pipelined response failed");
                    broken = true;
                    break;
                }
            }
        }
    }

    if broken {
        conn.release_bad();
    } else {
        conn.release();
    }

    // Commit whatever completed; partial progress survives a lost
    // connection.
    let report = process_batch(shared, tasks, &responses).await?;
    if report.unblocked {
        shared.wake.wake();
    }

    if let Some(idx) = deferred {
        handlers::defer_to_large(shared, &tasks[idx]).await?;
    }

    if broken {
        shared.wake.wake();
        tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
    } else if let Some(delay) = report.backoff {
        tokio::time::sleep(delay).await;
    }

    Ok(())
}

/// Processes every task that has a response, under one transaction.
async fn process_batch(
    shared: &SharedRef,
    tasks: &[FsTask],
    responses: &[Option<ApiResponse>],
) -> Result<BatchReport, EngineError> {
    let mut report = BatchReport {
        unblocked: false,
        backoff: None,
    };
    let mut tx = shared.store.database().pool().begin().await?;

    for (task, resp) in tasks.iter().zip(responses) {
        let Some(resp) = resp else { continue };
        match handlers::process(shared, &mut tx, task, resp).await {
            Ok(ProcessOutcome::Completed(assigned)) => {
                if TaskStore::complete_in(&mut tx, task.id, assigned).await? > 0 {
                    report.unblocked = true;
                }
            }
            Ok(ProcessOutcome::Retry) => {}
            Ok(ProcessOutcome::RetryAfter(delay)) => {
                report.backoff = Some(report.backoff.map_or(delay, |d| d.max(delay)));
            }
            // A malformed envelope leaves the task for a later attempt;
            // anything else aborts the transaction.
            Err(EngineError::Api(error)) => {
                warn!(task_id = task.id, %error, "processing task failed");
            }
            Err(error) => return Err(error),
        }
    }

    tx.commit().await?;
    debug!(
        processed = responses.iter().filter(|r| r.is_some()).count(),
        "batch committed"
    );
    Ok(report)
}
