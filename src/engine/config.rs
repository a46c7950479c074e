//! Engine tuning constants and configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Largest payload sent inline on the pipelined channel (256 KiB).
/// Anything bigger is deferred to the large upload worker.
pub const DIRECT_UPLOAD_LIMIT: u64 = 256 * 1024;

/// Chunk size for streamed upload bodies (64 KiB).
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Ready tasks selected per dispatcher iteration.
pub const BATCH_LIMIT: i64 = 32;

/// Back-off after a transport failure.
pub const SLEEP_ON_FAILED_UPLOAD: Duration = Duration::from_secs(20);

/// Back-off when the account is over quota.
pub const SLEEP_ON_DISK_FULL: Duration = Duration::from_secs(60);

/// Engine configuration.
///
/// [`EngineConfig::new`] applies the module defaults; tests shrink the
/// sleeps and the direct-upload limit.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding pending upload payloads.
    pub cache_dir: PathBuf,
    /// Size threshold above which file creates leave the pipelined path.
    pub direct_upload_limit: u64,
    /// Chunk size for streamed upload bodies.
    pub copy_buffer_size: usize,
    /// Ready tasks selected per dispatcher iteration.
    pub batch_limit: i64,
    /// Back-off after a transport failure.
    pub sleep_on_failed_upload: Duration,
    /// Back-off when the account is over quota.
    pub sleep_on_disk_full: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default tuning for the given cache
    /// directory.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            direct_upload_limit: DIRECT_UPLOAD_LIMIT,
            copy_buffer_size: COPY_BUFFER_SIZE,
            batch_limit: BATCH_LIMIT,
            sleep_on_failed_upload: SLEEP_ON_FAILED_UPLOAD,
            sleep_on_disk_full: SLEEP_ON_DISK_FULL,
        }
    }
}
