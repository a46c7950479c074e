//! Task row types: operation kinds, statuses and placeholder references.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of filesystem mutation a task applies to remote storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Create a remote folder.
    MkDir,
    /// Delete a remote folder.
    RmDir,
    /// Upload a new file from the local cache.
    CreateFile,
    /// Delete a remote file.
    Unlink,
}

impl TaskKind {
    /// Returns the database integer representation.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::MkDir => 1,
            Self::RmDir => 2,
            Self::CreateFile => 3,
            Self::Unlink => 4,
        }
    }

    /// Parses the database integer representation.
    #[must_use]
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::MkDir),
            2 => Some(Self::RmDir),
            3 => Some(Self::CreateFile),
            4 => Some(Self::Unlink),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MkDir => "mkdir",
            Self::RmDir => "rmdir",
            Self::CreateFile => "create_file",
            Self::Unlink => "unlink",
        };
        write!(f, "{label}")
    }
}

/// Dispatch state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Eligible for the pipelined dispatcher once dependencies clear.
    Ready,
    /// Deferred by size; owned by the large upload worker.
    PendingLarge,
}

impl TaskStatus {
    /// Returns the database integer representation.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Ready => 0,
            Self::PendingLarge => 2,
        }
    }
}

/// A reference to a remote entity that may not exist yet.
///
/// Columns that name a folder or file store either the real remote id or,
/// while the creating task is still pending, the negative of that task's id.
/// The sign encoding is confined to [`Ref::from_column`] / [`Ref::to_column`];
/// everything else works with the typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    /// A real remote id assigned by the server.
    Remote(u64),
    /// A placeholder for the entity that the given (pending) task creates.
    Pending(i64),
}

impl Ref {
    /// The remote root folder.
    pub const ROOT: Self = Self::Remote(0);

    /// Decodes the signed column value.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_column(value: i64) -> Self {
        if value < 0 {
            Self::Pending(-value)
        } else {
            Self::Remote(value as u64)
        }
    }

    /// Encodes into the signed column value.
    #[must_use]
    pub fn to_column(self) -> i64 {
        match self {
            #[allow(clippy::cast_possible_wrap)]
            Self::Remote(id) => id as i64,
            Self::Pending(task_id) => -task_id,
        }
    }

    /// Returns the real remote id, if already assigned.
    #[must_use]
    pub fn remote(self) -> Option<u64> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Pending(_) => None,
        }
    }
}

/// The remote id assigned when a task that creates an entity completes.
///
/// Carried from a handler's `process` step into the completion transaction,
/// where every dependent reference to the placeholder is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assigned {
    /// A MkDir task produced this folder id.
    Folder(u64),
    /// A CreateFile task produced this file id.
    File(u64),
}

/// A durable intent to apply one mutation to remote storage.
///
/// Column semantics are per-kind:
/// - MkDir: `folderid` parent, `text1` name, `int2` assigned folder id.
/// - RmDir: `folderid` parent (overlay context), `int1` target folder id,
///   `text1` name.
/// - CreateFile: `folderid` parent, `text1` name, `int2` assigned file id;
///   payload at `<cache>/<hex16(id)>d`.
/// - Unlink: `fileid` target, `folderid` parent, `text1` name.
#[derive(Debug, Clone, FromRow)]
pub struct FsTask {
    /// Unique identifier; `-id` is the placeholder for whatever this task
    /// creates.
    pub id: i64,
    /// Operation kind (stored as integer, parsed via `kind()`).
    #[sqlx(rename = "type")]
    pub kind_raw: i64,
    /// Dispatch status (0 ready, 2 pending-large).
    pub status: i64,
    /// Remote parent folder reference (may be a placeholder).
    pub folderid: i64,
    /// Remote file reference for Unlink (may be a placeholder).
    pub fileid: i64,
    /// Primary name/path operand.
    pub text1: Option<String>,
    /// Secondary name/path operand.
    pub text2: Option<String>,
    /// Op-specific scalar (RmDir target folder id).
    pub int1: i64,
    /// Op-specific scalar; assigned remote id is recorded here on success.
    pub int2: i64,
}

impl FsTask {
    /// Returns the parsed operation kind, or `None` for a malformed row.
    #[must_use]
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_i64(self.kind_raw)
    }

    /// Typed view of the parent folder column.
    #[must_use]
    pub fn folder_ref(&self) -> Ref {
        Ref::from_column(self.folderid)
    }

    /// Typed view of the file column.
    #[must_use]
    pub fn file_ref(&self) -> Ref {
        Ref::from_column(self.fileid)
    }

    /// The primary name operand, defaulting to the empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.text1.as_deref().unwrap_or("")
    }
}

impl fmt::Display for FsTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FsTask {{ id: {}, type: {}, folderid: {} }}",
            self.id, self.kind_raw, self.folderid
        )
    }
}

/// A task to be inserted by a producer.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Operation kind.
    pub kind: TaskKind,
    /// Parent folder reference.
    pub folder: Ref,
    /// File reference (Unlink target).
    pub file: Ref,
    /// Primary name operand.
    pub text1: Option<String>,
    /// Secondary name operand.
    pub text2: Option<String>,
    /// Op-specific scalar.
    pub int1: i64,
}

impl NewTask {
    /// A folder-create intent under `parent`.
    #[must_use]
    pub fn mkdir(parent: Ref, name: &str) -> Self {
        Self {
            kind: TaskKind::MkDir,
            folder: parent,
            file: Ref::Remote(0),
            text1: Some(name.to_string()),
            text2: None,
            int1: 0,
        }
    }

    /// A folder-delete intent for `folderid` living under `parent`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn rmdir(parent: Ref, folderid: u64, name: &str) -> Self {
        Self {
            kind: TaskKind::RmDir,
            folder: parent,
            file: Ref::Remote(0),
            text1: Some(name.to_string()),
            text2: None,
            int1: folderid as i64,
        }
    }

    /// A file-upload intent under `parent`; the payload is the cache file
    /// keyed by the task id this insert assigns.
    #[must_use]
    pub fn create_file(parent: Ref, name: &str) -> Self {
        Self {
            kind: TaskKind::CreateFile,
            folder: parent,
            file: Ref::Remote(0),
            text1: Some(name.to_string()),
            text2: None,
            int1: 0,
        }
    }

    /// A file-delete intent for `file` living under `parent`.
    #[must_use]
    pub fn unlink(parent: Ref, file: Ref, name: &str) -> Self {
        Self {
            kind: TaskKind::Unlink,
            folder: parent,
            file,
            text1: Some(name.to_string()),
            text2: None,
            int1: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_roundtrip() {
        for kind in [
            TaskKind::MkDir,
            TaskKind::RmDir,
            TaskKind::CreateFile,
            TaskKind::Unlink,
        ] {
            assert_eq!(TaskKind::from_i64(kind.as_i64()), Some(kind));
        }
    }

    #[test]
    fn test_task_kind_from_i64_invalid() {
        assert_eq!(TaskKind::from_i64(0), None);
        assert_eq!(TaskKind::from_i64(5), None);
        assert_eq!(TaskKind::from_i64(-1), None);
    }

    #[test]
    fn test_ref_decodes_sign_convention() {
        assert_eq!(Ref::from_column(42), Ref::Remote(42));
        assert_eq!(Ref::from_column(0), Ref::Remote(0));
        assert_eq!(Ref::from_column(-7), Ref::Pending(7));
    }

    #[test]
    fn test_ref_column_roundtrip() {
        for value in [-100, -1, 0, 1, 9000] {
            assert_eq!(Ref::from_column(value).to_column(), value);
        }
    }

    #[test]
    fn test_ref_remote_accessor() {
        assert_eq!(Ref::Remote(9).remote(), Some(9));
        assert_eq!(Ref::Pending(9).remote(), None);
    }

    #[test]
    fn test_fstask_accessors() {
        let task = FsTask {
            id: 3,
            kind_raw: 1,
            status: 0,
            folderid: -2,
            fileid: 0,
            text1: Some("docs".to_string()),
            text2: None,
            int1: 0,
            int2: 0,
        };
        assert_eq!(task.kind(), Some(TaskKind::MkDir));
        assert_eq!(task.folder_ref(), Ref::Pending(2));
        assert_eq!(task.file_ref(), Ref::Remote(0));
        assert_eq!(task.name(), "docs");
    }

    #[test]
    fn test_fstask_malformed_kind() {
        let task = FsTask {
            id: 1,
            kind_raw: 99,
            status: 0,
            folderid: 0,
            fileid: 0,
            text1: None,
            text2: None,
            int1: 0,
            int2: 0,
        };
        assert_eq!(task.kind(), None);
        assert_eq!(task.name(), "");
    }

    #[test]
    fn test_new_task_constructors() {
        let mkdir = NewTask::mkdir(Ref::ROOT, "a");
        assert_eq!(mkdir.kind, TaskKind::MkDir);
        assert_eq!(mkdir.folder, Ref::Remote(0));

        let rmdir = NewTask::rmdir(Ref::Remote(5), 17, "b");
        assert_eq!(rmdir.int1, 17);

        let unlink = NewTask::unlink(Ref::Remote(5), Ref::Pending(3), "c");
        assert_eq!(unlink.file, Ref::Pending(3));
        assert_eq!(unlink.kind, TaskKind::Unlink);
    }
}
