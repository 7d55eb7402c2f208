//! Port mapping queries backing the port allocator.

use gamectl_core::db::is_unique_violation;

use super::db::{Database, DatabaseError};

/// Outcome of trying to claim a port for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClaim {
    Claimed,
    /// Another writer holds this port or already mapped this server.
    Taken,
}

impl Database {
    /// All ports currently mapped to a server.
    pub async fn used_ports(&self) -> Result<Vec<u16>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT port FROM port_mappings ORDER BY port")
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(port,)| u16::try_from(port).ok())
            .collect())
    }

    /// Port mapped to `server_id`, if any.
    pub async fn port_mapping(&self, server_id: &str) -> Result<Option<u16>, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT port FROM port_mappings WHERE server_id = ?")
                .bind(server_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.and_then(|(port,)| u16::try_from(port).ok()))
    }

    /// Every `(server_id, port)` pair, ordered by port.
    pub async fn list_port_mappings(&self) -> Result<Vec<(String, u16)>, DatabaseError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT server_id, port FROM port_mappings ORDER BY port")
                .fetch_all(self.pool())
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, port)| u16::try_from(port).ok().map(|p| (id, p)))
            .collect())
    }

    /// Try to map `port` to `server_id`.
    pub async fn claim_port(&self, server_id: &str, port: u16) -> Result<PortClaim, DatabaseError> {
        let result = sqlx::query("INSERT INTO port_mappings (server_id, port) VALUES (?, ?)")
            .bind(server_id)
            .bind(i64::from(port))
            .execute(self.pool())
            .await;

        match result {
            Ok(_) => Ok(PortClaim::Claimed),
            Err(e) if is_unique_violation(&e) => Ok(PortClaim::Taken),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the mapping for `server_id`. Returns whether one existed.
    pub async fn release_port(&self, server_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM port_mappings WHERE server_id = ?")
            .bind(server_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
