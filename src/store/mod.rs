//! Durable task queue: pending mutations, dependency edges, upload handles.
//!
//! The store is the single source of truth for the upload engine. Producers
//! insert [`FsTask`] rows (optionally with dependency edges on tasks whose
//! placeholder ids they consume); the dispatcher and the large upload worker
//! mutate rows only through the operations here, and every multi-row
//! completion update rides one transaction.
//!
//! # Overview
//!
//! - [`TaskStore`] - main interface over the task tables
//! - [`FsTask`] / [`NewTask`] - row types
//! - [`Ref`] - typed placeholder reference (sign-encoded in columns)
//! - [`StoreError`] - operation error type

mod error;
mod task;

pub use error::StoreError;
pub use task::{Assigned, FsTask, NewTask, Ref, TaskKind, TaskStatus};

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise
/// [`StoreError::TaskNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::TaskNotFound(id))
    } else {
        Ok(())
    }
}

/// Manager for the durable task tables.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Creates a new store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a new ready task and returns its assigned id.
    ///
    /// The returned id is also the task's placeholder identity: until the
    /// task completes, other rows may reference the entity it will create as
    /// `Ref::Pending(id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, task), fields(kind = %task.kind))]
    pub async fn insert_task(&self, task: &NewTask) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO fstask (type, status, folderid, fileid, text1, text2, int1)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(task.kind.as_i64())
        .bind(TaskStatus::Ready.as_i64())
        .bind(task.folder.to_column())
        .bind(task.file.to_column())
        .bind(task.text1.as_deref())
        .bind(task.text2.as_deref())
        .bind(task.int1)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Inserts a task together with the dependency edges it needs, in one
    /// transaction, and returns the assigned id.
    ///
    /// `depends_on` lists ids of pending tasks whose placeholders the new
    /// task consumes; it will not be dispatched until all of them complete.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction fails.
    #[instrument(skip(self, task), fields(kind = %task.kind, deps = depends_on.len()))]
    pub async fn insert_task_with_dependencies(
        &self,
        task: &NewTask,
        depends_on: &[i64],
    ) -> Result<i64> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query(
            r"INSERT INTO fstask (type, status, folderid, fileid, text1, text2, int1)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(task.kind.as_i64())
        .bind(TaskStatus::Ready.as_i64())
        .bind(task.folder.to_column())
        .bind(task.file.to_column())
        .bind(task.text1.as_deref())
        .bind(task.text2.as_deref())
        .bind(task.int1)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.get("id");

        for dep in depends_on {
            sqlx::query(
                r"INSERT OR IGNORE INTO fstaskdepend (fstaskid, dependfstaskid) VALUES (?, ?)",
            )
            .bind(id)
            .bind(dep)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Adds a dependency edge: `task_id` runs only after `depends_on` is gone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn add_dependency(&self, task_id: i64, depends_on: i64) -> Result<()> {
        sqlx::query(r"INSERT OR IGNORE INTO fstaskdepend (fstaskid, dependfstaskid) VALUES (?, ?)")
            .bind(task_id)
            .bind(depends_on)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Selects the next batch of dispatchable tasks.
    ///
    /// A task is dispatchable when it is `ready` and no dependency edge
    /// references it as dependent. Results are ordered by id ascending and
    /// capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn next_ready_batch(&self, limit: i64) -> Result<Vec<FsTask>> {
        let tasks = sqlx::query_as::<_, FsTask>(
            r"SELECT f.* FROM fstask f
              LEFT JOIN fstaskdepend d ON f.id = d.fstaskid
              WHERE d.fstaskid IS NULL AND f.status = ?
              ORDER BY f.id
              LIMIT ?",
        )
        .bind(TaskStatus::Ready.as_i64())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(tasks)
    }

    /// Returns the oldest task deferred to the large upload worker, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn next_pending_large(&self) -> Result<Option<FsTask>> {
        let task = sqlx::query_as::<_, FsTask>(
            r"SELECT * FROM fstask WHERE status = ? ORDER BY id LIMIT 1",
        )
        .bind(TaskStatus::PendingLarge.as_i64())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(task)
    }

    /// Returns true when any task is deferred to the large upload worker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn has_pending_large(&self) -> Result<bool> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM fstask WHERE status = ?")
            .bind(TaskStatus::PendingLarge.as_i64())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Hands a task over to the large upload worker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task exists with the id.
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_pending_large(&self, id: i64) -> Result<()> {
        let result = sqlx::query(r"UPDATE fstask SET status = ? WHERE id = ?")
            .bind(TaskStatus::PendingLarge.as_i64())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Returns the resume candidate: the latest upload handle for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    #[allow(clippy::cast_sign_loss)]
    pub async fn latest_upload_id(&self, task_id: i64) -> Result<Option<u64>> {
        let row = sqlx::query(
            r"SELECT uploadid FROM fstaskupload WHERE fstaskid = ?
              ORDER BY uploadid DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("uploadid") as u64))
    }

    /// Records a server-side upload handle acquired for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self))]
    #[allow(clippy::cast_possible_wrap)]
    pub async fn record_upload_id(&self, task_id: i64, upload_id: u64) -> Result<()> {
        sqlx::query(r"INSERT OR IGNORE INTO fstaskupload (fstaskid, uploadid) VALUES (?, ?)")
            .bind(task_id)
            .bind(upload_id as i64)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Returns every upload handle recorded for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    #[allow(clippy::cast_sign_loss)]
    pub async fn upload_ids(&self, task_id: i64) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            r"SELECT uploadid FROM fstaskupload WHERE fstaskid = ? ORDER BY uploadid",
        )
        .bind(task_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("uploadid") as u64)
            .collect())
    }

    /// Forgets every upload handle recorded for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_uploads(&self, task_id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM fstaskupload WHERE fstaskid = ?")
            .bind(task_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Removes a task outright (unrecoverable local error or malformed row).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM fstask WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Resets a task's parent to the root folder.
    ///
    /// Fixup for parent-missing / access-denied remote errors: the next
    /// attempt runs against the root, which surfaces the failure path to the
    /// user instead of wedging the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_parent(&self, id: i64) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        Self::reset_parent_in(&mut conn, id).await
    }

    /// Replaces a task's primary name operand.
    ///
    /// Fixup for invalid-name remote errors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn rename(&self, id: i64, name: &str) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        Self::rename_in(&mut conn, id, name).await
    }

    /// Returns a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<FsTask>> {
        let task = sqlx::query_as::<_, FsTask>(r"SELECT * FROM fstask WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(task)
    }

    /// Counts all task rows (any status).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM fstask")
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Completes a task inside an open transaction.
    ///
    /// In order: rewrites every other task's placeholder reference to the
    /// assigned remote id, deletes the dependency edges this task was holding
    /// (returning how many dependents were unblocked), forgets its upload
    /// handles, and deletes the task row itself. The caller owns the commit;
    /// a reader never observes a completed task whose placeholders are still
    /// unresolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement fails.
    pub async fn complete_in(
        conn: &mut SqliteConnection,
        task_id: i64,
        assigned: Option<Assigned>,
    ) -> Result<u64> {
        match assigned {
            Some(Assigned::Folder(folderid)) => {
                sqlx::query(r"UPDATE fstask SET folderid = ? WHERE folderid = ?")
                    .bind(Ref::Remote(folderid).to_column())
                    .bind(Ref::Pending(task_id).to_column())
                    .execute(&mut *conn)
                    .await?;
            }
            Some(Assigned::File(fileid)) => {
                sqlx::query(r"UPDATE fstask SET fileid = ? WHERE fileid = ?")
                    .bind(Ref::Remote(fileid).to_column())
                    .bind(Ref::Pending(task_id).to_column())
                    .execute(&mut *conn)
                    .await?;
            }
            None => {}
        }

        let unblocked = sqlx::query(r"DELETE FROM fstaskdepend WHERE dependfstaskid = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        sqlx::query(r"DELETE FROM fstaskupload WHERE fstaskid = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(r"DELETE FROM fstask WHERE id = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        Ok(unblocked)
    }

    /// In-transaction variant of [`TaskStore::delete`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    pub async fn delete_in(conn: &mut SqliteConnection, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM fstask WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// In-transaction variant of [`TaskStore::reset_parent`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn reset_parent_in(conn: &mut SqliteConnection, id: i64) -> Result<()> {
        sqlx::query(r"UPDATE fstask SET folderid = 0 WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// In-transaction variant of [`TaskStore::rename`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn rename_in(conn: &mut SqliteConnection, id: i64, name: &str) -> Result<()> {
        sqlx::query(r"UPDATE fstask SET text1 = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
