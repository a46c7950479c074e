//! Uploader Core Library
//!
//! Persistent filesystem-operation upload engine for a cloud-sync client:
//! durably records user-originated mutations on a virtual filesystem
//! (directory create/remove, file create, file unlink) and reliably
//! executes each one against the remote storage service, with
//! at-least-once delivery, crash/resume safety, dependency ordering,
//! pipelined small-request dispatch and resumable chunked uploads for
//! large files.
//!
//! # Architecture
//!
//! - [`db`] - `SQLite` connection and schema management
//! - [`store`] - durable task queue, dependency edges, upload handles
//! - [`api`] - typed RPC surface of the remote storage service
//! - [`engine`] - dispatcher, pipelined batch runner, large upload worker
//! - [`status`] - process-wide gate on {auth, run, online, quota}
//! - [`wake`] - counted dispatcher wake-up
//! - [`overlay`] - collaborator seams (overlay, page cache)
//! - [`fileops`] - local mirror of remote metadata
//! - [`checksum`] / [`cache`] - upload digests and cache-file layout

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod cache;
pub mod checksum;
pub mod db;
pub mod engine;
pub mod fileops;
pub mod overlay;
pub mod status;
pub mod store;
pub mod wake;

// Re-export commonly used types
pub use api::{ApiConn, ApiError, ApiPool, ApiResponse, Command, ErrorClass, Metadata};
pub use db::{Database, DbError};
pub use engine::{EngineConfig, EngineError, UploadEngine, DIRECT_UPLOAD_LIMIT};
pub use overlay::{
    OverlayEvent, OverlayNotifier, PageCache, RecordingOverlay, RecordingPageCache,
    TracingOverlay, TracingPageCache,
};
pub use status::{Status, StatusGate};
pub use store::{Assigned, FsTask, NewTask, Ref, StoreError, TaskKind, TaskStatus, TaskStore};
pub use wake::Wakeup;
