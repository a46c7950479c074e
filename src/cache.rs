//! Cache-file layout for pending uploads.
//!
//! The payload of a pending file-create task lives in the cache directory
//! under the zero-padded hex of its task id followed by a literal `d`. The
//! name is derived from the id alone so it survives restarts and never
//! collides (task ids are unique and not reused).

use std::path::{Path, PathBuf};

/// File name of a pending upload payload.
#[must_use]
pub fn cache_file_name(task_id: i64) -> String {
    format!("{task_id:016x}d")
}

/// Full path of a pending upload payload.
#[must_use]
pub fn cache_file_path(cache_dir: &Path, task_id: i64) -> PathBuf {
    cache_dir.join(cache_file_name(task_id))
}
