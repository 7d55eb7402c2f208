//! Server record queries.

use sqlx::FromRow;
use tracing::warn;

use gamectl_core::db::format_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ServerRecord, ServerRow};

impl Database {
    /// Get a server record by ID.
    ///
    /// A row that exists but cannot be decoded is reported as
    /// [`DatabaseError::Corrupt`].
    pub async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| {
            ServerRecord::try_from(row).map_err(|reason| DatabaseError::Corrupt {
                key: id.to_string(),
                reason,
            })
        })
        .transpose()
    }

    /// Insert a new server record. Fails if the id already exists.
    pub async fn insert_server(&self, record: &ServerRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO servers (
                id, name, password, admin_secret, max_players, description,
                exp_rate, capture_rate, spawn_rate, port, container_ref,
                status, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.id)
        .bind(&record.settings.name)
        .bind(&record.settings.password)
        .bind(&record.admin_secret)
        .bind(i64::from(record.settings.max_players))
        .bind(&record.settings.description)
        .bind(record.settings.exp_rate)
        .bind(record.settings.capture_rate)
        .bind(record.settings.spawn_rate)
        .bind(i64::from(record.port))
        .bind(record.container_ref.as_ref().map(|c| c.as_str().to_string()))
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.updated_at))
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Overwrite the mutable fields of an existing record.
    ///
    /// Never inserts: returns `false` when the row is gone, so a writer
    /// holding a stale copy cannot bring a deleted server back. `port` and
    /// `created_at` are not written.
    pub async fn update_server(&self, record: &ServerRecord) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE servers SET
                name = ?,
                password = ?,
                admin_secret = ?,
                max_players = ?,
                description = ?,
                exp_rate = ?,
                capture_rate = ?,
                spawn_rate = ?,
                container_ref = ?,
                status = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&record.settings.name)
        .bind(&record.settings.password)
        .bind(&record.admin_secret)
        .bind(i64::from(record.settings.max_players))
        .bind(&record.settings.description)
        .bind(record.settings.exp_rate)
        .bind(record.settings.capture_rate)
        .bind(record.settings.spawn_rate)
        .bind(record.container_ref.as_ref().map(|c| c.as_str().to_string()))
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(format_timestamp(&record.updated_at))
        .bind(&record.id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List all decodable server records, oldest first.
    ///
    /// Rows that fail to decode are logged and skipped.
    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY created_at ASC, id ASC")
            .fetch_all(self.pool())
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let decoded = ServerRow::from_row(row)
                .map_err(|e| e.to_string())
                .and_then(ServerRecord::try_from);
            match decoded {
                Ok(record) => records.push(record),
                Err(reason) => warn!(%reason, "Skipping unreadable server record"),
            }
        }
        Ok(records)
    }

    /// Ids of every stored row, readable or not.
    pub async fn server_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM servers ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete a server record. Returns whether a row was removed.
    pub async fn delete_server(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::engine::ContainerRef;
    use crate::storage::{GameSettings, ServerStatus};

    fn record(id: &str, port: u16) -> ServerRecord {
        let now = Utc::now();
        ServerRecord {
            id: id.to_string(),
            settings: GameSettings {
                name: "Alpha".into(),
                password: "p".into(),
                max_players: 16,
                description: "test".into(),
                exp_rate: 1.0,
                capture_rate: 1.0,
                spawn_rate: 1.0,
            },
            admin_secret: "secret".into(),
            port,
            container_ref: None,
            status: ServerStatus::Installing,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_then_update_roundtrips() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rec = record("srv-1", 8211);
        db.insert_server(&rec).await.unwrap();

        rec.status = ServerStatus::Running;
        rec.container_ref = Some(ContainerRef::new("abc123"));
        assert!(db.update_server(&rec).await.unwrap());

        let loaded = db.get_server("srv-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ServerStatus::Running);
        assert_eq!(loaded.container_ref.unwrap().as_str(), "abc123");
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_server(&record("srv-1", 8211)).await.unwrap();
        assert!(db.insert_server(&record("srv-1", 8212)).await.is_err());
    }

    #[tokio::test]
    async fn update_never_changes_port() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rec = record("srv-1", 8211);
        db.insert_server(&rec).await.unwrap();

        rec.port = 9999;
        assert!(db.update_server(&rec).await.unwrap());

        assert_eq!(db.get_server("srv-1").await.unwrap().unwrap().port, 8211);
    }

    #[tokio::test]
    async fn update_of_deleted_record_does_not_recreate_it() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rec = record("srv-1", 8211);
        db.insert_server(&rec).await.unwrap();
        db.delete_server("srv-1").await.unwrap();

        rec.status = ServerStatus::Running;
        assert!(!db.update_server(&rec).await.unwrap());
        assert!(db.get_server("srv-1").await.unwrap().is_none());
        assert!(db.server_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_skips_corrupt_rows_but_get_reports_them() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_server(&record("good", 8211)).await.unwrap();
        db.insert_server(&record("bad", 8212)).await.unwrap();
        sqlx::query("UPDATE servers SET status = 'melted' WHERE id = 'bad'")
            .execute(db.pool())
            .await
            .unwrap();

        let listed = db.list_servers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");

        let err = db.get_server("bad").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn server_ids_include_unreadable_rows() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_server(&record("b", 8212)).await.unwrap();
        db.insert_server(&record("a", 8211)).await.unwrap();
        sqlx::query("UPDATE servers SET created_at = 'yesterday' WHERE id = 'b'")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.server_ids().await.unwrap(), ["a", "b"]);
        assert_eq!(db.list_servers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_server(&record("srv-1", 8211)).await.unwrap();
        assert!(db.delete_server("srv-1").await.unwrap());
        assert!(!db.delete_server("srv-1").await.unwrap());
        assert!(db.get_server("srv-1").await.unwrap().is_none());
    }
}
