//! Config store: per-server records plus their on-disk data directories.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::db::{Database, DatabaseError};
use super::models::ServerRecord;

/// Durable per-server state keyed by server id.
///
/// Each write is a single `SQLite` statement, so a concurrent load sees
/// either the previous or the new record, never a mix. Only creation
/// inserts; later writes update in place.
#[derive(Clone)]
pub struct ConfigStore {
    db: Database,
    servers_root: PathBuf,
}

impl ConfigStore {
    /// Create a store whose data directories live under
    /// `<data_dir>/servers/<id>/`.
    pub fn new(db: Database, data_dir: &Path) -> Self {
        Self {
            db,
            servers_root: data_dir.join("servers"),
        }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub async fn load(&self, id: &str) -> Result<Option<ServerRecord>, DatabaseError> {
        self.db.get_server(id).await
    }

    /// Persist a record that does not exist yet.
    pub async fn insert(&self, record: &ServerRecord) -> Result<(), DatabaseError> {
        debug!(server_id = %record.id, status = %record.status, "Inserting server record");
        self.db.insert_server(record).await
    }

    /// Overwrite an existing record. Returns `false` if it was deleted in
    /// the meantime; nothing is written then.
    pub async fn save(&self, record: &ServerRecord) -> Result<bool, DatabaseError> {
        debug!(server_id = %record.id, status = %record.status, "Saving server record");
        self.db.update_server(record).await
    }

    /// Every readable record; corrupt rows are skipped.
    pub async fn list_all(&self) -> Result<Vec<ServerRecord>, DatabaseError> {
        self.db.list_servers().await
    }

    /// Ids of every stored record, including ones `list_all` skips.
    pub async fn record_ids(&self) -> Result<Vec<String>, DatabaseError> {
        self.db.server_ids().await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        self.db.delete_server(id).await
    }

    /// Host directory bound into the server's container.
    pub fn data_dir(&self, id: &str) -> PathBuf {
        self.servers_root.join(id).join("data")
    }

    /// Create the server's data directory.
    pub async fn ensure_data_dir(&self, id: &str) -> std::io::Result<PathBuf> {
        let dir = self.data_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove everything stored on disk for the server. Missing is fine.
    pub async fn purge_data_dir(&self, id: &str) -> std::io::Result<()> {
        let dir = self.servers_root.join(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(server_id = id, path = %dir.display(), "Removed server data");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
