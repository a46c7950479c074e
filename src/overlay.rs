//! Collaborator seams notified on task completion.
//!
//! The in-memory filesystem overlay and the page cache are external
//! subsystems; the engine only tells them what happened. [`OverlayNotifier`]
//! carries the task id whose placeholder just resolved so the overlay can
//! swap its provisional entry for the real one; [`PageCache`] learns which
//! content hash now backs a freshly uploaded task payload.

use std::sync::Mutex;

use tracing::debug;

/// Observer of the not-yet-committed filesystem view.
pub trait OverlayNotifier: Send + Sync {
    /// The folder placeholder `-task_id` under `parent` resolved to
    /// `folderid`.
    fn folder_created(&self, parent: u64, task_id: i64, folderid: u64, name: &str);

    /// The folder-delete intent of `task_id` under `parent` is settled.
    fn folder_deleted(&self, parent: u64, task_id: i64, name: &str);

    /// The file placeholder `-task_id` under `parent` resolved.
    fn file_created(&self, parent: u64, task_id: i64, name: &str);

    /// The file-delete intent of `task_id` under `parent` is settled.
    fn file_deleted(&self, parent: u64, task_id: i64, name: &str);
}

/// Observer of uploaded payloads.
pub trait PageCache: Send + Sync {
    /// The payload of `task_id` is now stored remotely under `content_hash`.
    fn file_uploaded(&self, task_id: i64, content_hash: u64);
}

/// Overlay notifier that only logs; for embedders without an in-memory view.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOverlay;

impl OverlayNotifier for TracingOverlay {
    fn folder_created(&self, parent: u64, task_id: i64, folderid: u64, name: &str) {
        debug!(parent, task_id, folderid, name, "overlay: folder created");
    }

    fn folder_deleted(&self, parent: u64, task_id: i64, name: &str) {
        debug!(parent, task_id, name, "overlay: folder deleted");
    }

    fn file_created(&self, parent: u64, task_id: i64, name: &str) {
        debug!(parent, task_id, name, "overlay: file created");
    }

    fn file_deleted(&self, parent: u64, task_id: i64, name: &str) {
        debug!(parent, task_id, name, "overlay: file deleted");
    }
}

/// Page cache notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPageCache;

impl PageCache for TracingPageCache {
    fn file_uploaded(&self, task_id: i64, content_hash: u64) {
        debug!(task_id, content_hash, "page cache: payload stored remotely");
    }
}

/// One recorded overlay notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// See [`OverlayNotifier::folder_created`].
    FolderCreated {
        /// Parent folder id.
        parent: u64,
        /// Completing task id.
        task_id: i64,
        /// Assigned remote folder id.
        folderid: u64,
        /// Folder name.
        name: String,
    },
    /// See [`OverlayNotifier::folder_deleted`].
    FolderDeleted {
        /// Parent folder id.
        parent: u64,
        /// Completing task id.
        task_id: i64,
        /// Folder name.
        name: String,
    },
    /// See [`OverlayNotifier::file_created`].
    FileCreated {
        /// Parent folder id.
        parent: u64,
        /// Completing task id.
        task_id: i64,
        /// File name.
        name: String,
    },
    /// See [`OverlayNotifier::file_deleted`].
    FileDeleted {
        /// Parent folder id.
        parent: u64,
        /// Completing task id.
        task_id: i64,
        /// File name.
        name: String,
    },
}

/// Overlay notifier that records every event; test support.
#[derive(Debug, Default)]
pub struct RecordingOverlay {
    events: Mutex<Vec<OverlayEvent>>,
}

impl RecordingOverlay {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<OverlayEvent> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OverlayEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OverlayNotifier for RecordingOverlay {
    fn folder_created(&self, parent: u64, task_id: i64, folderid: u64, name: &str) {
        self.lock().push(OverlayEvent::FolderCreated {
            parent,
            task_id,
            folderid,
            name: name.to_string(),
        });
    }

    fn folder_deleted(&self, parent: u64, task_id: i64, name: &str) {
        self.lock().push(OverlayEvent::FolderDeleted {
            parent,
            task_id,
            name: name.to_string(),
        });
    }

    fn file_created(&self, parent: u64, task_id: i64, name: &str) {
        self.lock().push(OverlayEvent::FileCreated {
            parent,
            task_id,
            name: name.to_string(),
        });
    }

    fn file_deleted(&self, parent: u64, task_id: i64, name: &str) {
        self.lock().push(OverlayEvent::FileDeleted {
            parent,
            task_id,
            name: name.to_string(),
        });
    }
}

/// Page cache notifier that records every entry; test support.
#[derive(Debug, Default)]
pub struct RecordingPageCache {
    entries: Mutex<Vec<(i64, u64)>>,
}

impl RecordingPageCache {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the `(task_id, content_hash)` pairs recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<(i64, u64)> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl PageCache for RecordingPageCache {
    fn file_uploaded(&self, task_id: i64, content_hash: u64) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push((task_id, content_hash)),
            Err(poisoned) => poisoned.into_inner().push((task_id, content_hash)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_overlay_keeps_order() {
        let overlay = RecordingOverlay::new();
        overlay.folder_created(0, 1, 100, "a");
        overlay.file_created(100, 2, "b");
        overlay.file_deleted(100, 3, "b");

        let events = overlay.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            OverlayEvent::FolderCreated {
                parent: 0,
                task_id: 1,
                folderid: 100,
                name: "a".to_string()
            }
        );
        assert!(matches!(events[2], OverlayEvent::FileDeleted { .. }));
    }

    #[test]
    fn test_recording_page_cache() {
        let cache = RecordingPageCache::new();
        cache.file_uploaded(1, 0xdead);
        cache.file_uploaded(2, 0xbeef);
        assert_eq!(cache.entries(), vec![(1, 0xdead), (2, 0xbeef)]);
    }
}
