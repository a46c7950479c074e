//! Upload engine: dispatcher, pipelined batch runner and large upload
//! worker over the durable task store.
//!
//! # Overview
//!
//! Producers insert task rows and call [`UploadEngine::wake`]. The
//! dispatcher wakes, selects a batch of ready tasks (dependencies resolved,
//! id order) and runs them pipelined on one connection. File creates whose
//! payload exceeds the direct-upload limit are deferred to a singleton
//! large upload worker with resumable, checksum-verified semantics.
//!
//! Everything durable lives in the task store; the engine survives restart,
//! network loss and mid-upload crashes by re-reading it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uploader_core::engine::{EngineConfig, UploadEngine};
//! use uploader_core::overlay::{TracingOverlay, TracingPageCache};
//! use uploader_core::status::StatusGate;
//! use uploader_core::store::TaskStore;
//! use uploader_core::{ApiPool, Database};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("tasks.db")).await?;
//! let store = TaskStore::new(db);
//! let api = ApiPool::new(url::Url::parse("https://api.example.com")?, "auth-token")?;
//! let engine = UploadEngine::new(
//!     store,
//!     api,
//!     Arc::new(StatusGate::ready()),
//!     Arc::new(TracingOverlay),
//!     Arc::new(TracingPageCache),
//!     EngineConfig::new("/var/cache/uploads"),
//! );
//! engine.init();
//! # Ok(())
//! # }
//! ```

mod batch;
mod config;
mod handlers;
mod large;

pub use config::{
    EngineConfig, BATCH_LIMIT, COPY_BUFFER_SIZE, DIRECT_UPLOAD_LIMIT, SLEEP_ON_DISK_FULL,
    SLEEP_ON_FAILED_UPLOAD,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::api::{ApiError, ApiPool};
use crate::overlay::{OverlayNotifier, PageCache};
use crate::status::StatusGate;
use crate::store::{StoreError, TaskStore};
use crate::wake::Wakeup;

use large::LargeWorkerFlag;

/// Errors that can occur inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Task store operation failed.
    #[error("task store error: {0}")]
    Store(#[from] StoreError),

    /// Remote API surface failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Direct database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// State shared by the dispatcher, the batch runner and the large upload
/// worker.
pub(crate) struct EngineShared {
    pub(crate) store: TaskStore,
    pub(crate) api: ApiPool,
    pub(crate) gate: Arc<StatusGate>,
    pub(crate) wake: Wakeup,
    pub(crate) overlay: Arc<dyn OverlayNotifier>,
    pub(crate) page_cache: Arc<dyn PageCache>,
    pub(crate) config: EngineConfig,
    pub(crate) large_worker: LargeWorkerFlag,
    pub(crate) running: AtomicBool,
}

impl EngineShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub(crate) type SharedRef = Arc<EngineShared>;

/// The persistent filesystem-operation upload engine.
///
/// One instance per process. [`UploadEngine::init`] spawns the dispatcher;
/// [`UploadEngine::wake`] is how producers (and the timer-exception hook)
/// tell it that work may be available.
pub struct UploadEngine {
    shared: SharedRef,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl UploadEngine {
    /// Creates an engine over the given store, API pool, status gate and
    /// collaborators.
    #[must_use]
    pub fn new(
        store: TaskStore,
        api: ApiPool,
        gate: Arc<StatusGate>,
        overlay: Arc<dyn OverlayNotifier>,
        page_cache: Arc<dyn PageCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                store,
                api,
                gate,
                wake: Wakeup::new(),
                overlay,
                page_cache,
                config,
                large_worker: LargeWorkerFlag::new(),
                running: AtomicBool::new(false),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Spawns the dispatcher. Idempotent.
    ///
    /// Also resumes the large upload worker when deferred tasks survived a
    /// restart.
    #[instrument(skip(self))]
    pub fn init(&self) {
        let mut guard = self.lock_dispatcher();
        if guard.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *guard = Some(tokio::spawn(dispatch_loop(shared)));
    }

    /// Records a wake for the dispatcher.
    ///
    /// Idempotent under bursts: any number of wakes while the dispatcher is
    /// busy buys exactly one extra iteration.
    pub fn wake(&self) {
        self.shared.wake.wake();
    }

    /// Returns a callable wake handle, e.g. to register as the
    /// timer-exception callback.
    #[must_use]
    pub fn waker(&self) -> impl Fn() + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        move || shared.wake.wake()
    }

    /// Returns the status gate workers block on.
    #[must_use]
    pub fn status_gate(&self) -> Arc<StatusGate> {
        Arc::clone(&self.shared.gate)
    }

    /// True while the dispatcher loop is meant to run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stops the dispatcher cooperatively and waits for it to exit.
    ///
    /// In-flight network operations finish or fail naturally; durable state
    /// is already safe in the store.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.wake();
        let handle = self.lock_dispatcher().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "dispatcher task failed");
            }
        }
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.dispatcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The dispatcher main loop.
async fn dispatch_loop(shared: SharedRef) {
    info!("upload dispatcher started");

    // Tasks deferred by size before a restart are still status pending-large;
    // nothing else would respawn their worker.
    match shared.store.has_pending_large().await {
        Ok(true) => large::ensure_running(&shared),
        Ok(false) => {}
        Err(error) => warn!(%error, "could not check for deferred uploads"),
    }

    while shared.is_running() {
        shared.gate.wait_ready().await;
        if !shared.is_running() {
            break;
        }

        match shared.store.next_ready_batch(shared.config.batch_limit).await {
            Ok(tasks) if !tasks.is_empty() => {
                if let Err(error) = batch::run_batch(&shared, &tasks).await {
                    warn!(%error, "batch run failed");
                    shared.wake.wake();
                    tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "could not select ready tasks");
                tokio::time::sleep(shared.config.sleep_on_failed_upload).await;
            }
        }

        shared.wake.wait().await;
    }
    info!("upload dispatcher exited");
}
