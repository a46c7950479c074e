//! Local mirror of remote metadata.
//!
//! When a mutation is confirmed by the server, the corresponding `folder`
//! or `file` row is written here inside the same transaction that retires
//! the task, so the mirror never reflects a mutation the remote has not
//! acknowledged.

use sqlx::sqlite::SqliteConnection;

use crate::store::StoreError;

/// Records a confirmed remote folder.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the write fails.
#[allow(clippy::cast_possible_wrap)]
pub async fn create_folder(
    conn: &mut SqliteConnection,
    folderid: u64,
    parentfolderid: u64,
    name: &str,
) -> Result<(), StoreError> {
    sqlx::query(r"INSERT OR REPLACE INTO folder (id, parentfolderid, name) VALUES (?, ?, ?)")
        .bind(folderid as i64)
        .bind(parentfolderid as i64)
        .bind(name)
        .execute(conn)
        .await?;
    Ok(())
}

/// Removes a folder from the mirror.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the delete fails.
#[allow(clippy::cast_possible_wrap)]
pub async fn delete_folder(conn: &mut SqliteConnection, folderid: u64) -> Result<(), StoreError> {
    sqlx::query(r"DELETE FROM folder WHERE id = ?")
        .bind(folderid as i64)
        .execute(conn)
        .await?;
    Ok(())
}

/// Records a confirmed remote file.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the write fails.
#[allow(clippy::cast_possible_wrap)]
pub async fn create_file(
    conn: &mut SqliteConnection,
    fileid: u64,
    parentfolderid: u64,
    name: &str,
    size: u64,
    hash: u64,
) -> Result<(), StoreError> {
    sqlx::query(
        r"INSERT OR REPLACE INTO file (id, parentfolderid, name, size, hash)
          VALUES (?, ?, ?, ?, ?)",
    )
    .bind(fileid as i64)
    .bind(parentfolderid as i64)
    .bind(name)
    .bind(size as i64)
    .bind(hash as i64)
    .execute(conn)
    .await?;
    Ok(())
}

/// Removes a file from the mirror.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the delete fails.
#[allow(clippy::cast_possible_wrap)]
pub async fn delete_file(conn: &mut SqliteConnection, fileid: u64) -> Result<(), StoreError> {
    sqlx::query(r"DELETE FROM file WHERE id = ?")
        .bind(fileid as i64)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sqlx::Row;

    #[tokio::test]
    async fn test_folder_mirror_round_trip() {
        let db = Database::new_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        create_folder(&mut conn, 100, 0, "docs").await.unwrap();
        // Replaying the same confirmation is harmless.
        create_folder(&mut conn, 100, 0, "docs").await.unwrap();

        let row = sqlx::query(r"SELECT parentfolderid, name FROM folder WHERE id = 100")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("parentfolderid"), 0);
        assert_eq!(row.get::<String, _>("name"), "docs");

        delete_folder(&mut conn, 100).await.unwrap();
        let count = sqlx::query(r"SELECT COUNT(*) AS c FROM folder")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
            .get::<i64, _>("c");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_mirror_round_trip() {
        let db = Database::new_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        create_file(&mut conn, 7, 100, "a.bin", 12, 0xfeed).await.unwrap();

        let row = sqlx::query(r"SELECT name, size, hash FROM file WHERE id = 7")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("name"), "a.bin");
        assert_eq!(row.get::<i64, _>("size"), 12);
        assert_eq!(row.get::<i64, _>("hash"), 0xfeed);

        delete_file(&mut conn, 7).await.unwrap();
        let count = sqlx::query(r"SELECT COUNT(*) AS c FROM file")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
            .get::<i64, _>("c");
        assert_eq!(count, 0);
    }
}
