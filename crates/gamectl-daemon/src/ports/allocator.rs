//! Sequential port allocator persisted in the `port_mappings` table.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gamectl_core::config::MAX_PORT_OFFSET;

use crate::storage::{Database, DatabaseError, PortClaim};

/// Offset of the Steam query port from the game port.
const QUERY_PORT_OFFSET: u16 = MAX_PORT_OFFSET;
/// Offset of the RCON port from the game port.
const RCON_PORT_OFFSET: u16 = 100;
/// Claims lost to another writer before giving up.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Errors from port allocation.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No free port at or above {base}")]
    Exhausted { base: u16 },

    #[error("Port allocation kept losing races ({attempts} attempts)")]
    Contended { attempts: usize },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Host ports published for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortSet {
    pub game: u16,
    pub query: u16,
    pub rcon: u16,
}

impl PortSet {
    /// Derive the full set from an allocated base port.
    ///
    /// Saturates instead of wrapping; the allocator never hands out a base
    /// port that would need to.
    pub const fn from_base(port: u16) -> Self {
        Self {
            game: port,
            query: port.saturating_add(QUERY_PORT_OFFSET),
            rcon: port.saturating_add(RCON_PORT_OFFSET),
        }
    }
}

/// Smallest port `>= base` not in `used`, or `None` when the range whose
/// derived ports still fit in `u16` is exhausted.
pub fn lowest_free_port(base: u16, used: &BTreeSet<u16>) -> Option<u16> {
    let ceiling = u16::MAX - MAX_PORT_OFFSET;
    let mut candidate = base;
    for &port in used.range(base..) {
        if port != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    (candidate <= ceiling).then_some(candidate)
}

/// Owns the persisted `server_id -> port` mapping.
///
/// All allocations in this process go through one mutex spanning
/// read-used-set and persist-new-mapping. The UNIQUE constraint on the
/// table catches writers in other processes; a lost claim rescans.
pub struct PortAllocator {
    db: Database,
    base_port: u16,
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(db: Database, base_port: u16) -> Self {
        Self {
            db,
            base_port,
            lock: Mutex::new(()),
        }
    }

    pub const fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Assign the lowest free port to `server_id`.
    ///
    /// Idempotent: a server that already holds a port gets it back.
    pub async fn allocate(&self, server_id: &str) -> Result<u16, PortError> {
        let _guard = self.lock.lock().await;

        if let Some(port) = self.db.port_mapping(server_id).await? {
            debug!(server_id, port, "Server already holds a port");
            return Ok(port);
        }

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let used: BTreeSet<u16> = self.db.used_ports().await?.into_iter().collect();
            let port = lowest_free_port(self.base_port, &used).ok_or(PortError::Exhausted {
                base: self.base_port,
            })?;

            match self.db.claim_port(server_id, port).await? {
                PortClaim::Claimed => {
                    info!(server_id, port, "Allocated port");
                    return Ok(port);
                }
                PortClaim::Taken => {
                    if let Some(existing) = self.db.port_mapping(server_id).await? {
                        return Ok(existing);
                    }
                    warn!(server_id, port, attempt, "Port claimed concurrently, rescanning");
                }
            }
        }

        Err(PortError::Contended {
            attempts: MAX_CLAIM_ATTEMPTS,
        })
    }

    /// Return `server_id`'s port to the pool. Returns whether it held one.
    pub async fn release(&self, server_id: &str) -> Result<bool, PortError> {
        let _guard = self.lock.lock().await;
        let released = self.db.release_port(server_id).await?;
        if released {
            info!(server_id, "Released port");
        }
        Ok(released)
    }

    pub async fn port_of(&self, server_id: &str) -> Result<Option<u16>, PortError> {
        Ok(self.db.port_mapping(server_id).await?)
    }

    pub async fn mappings(&self) -> Result<Vec<(String, u16)>, PortError> {
        Ok(self.db.list_port_mappings().await?)
    }

    /// Re-create the mapping for a record that lost it. Returns false when
    /// another server holds `port`.
    pub async fn restore(&self, server_id: &str, port: u16) -> Result<bool, PortError> {
        let _guard = self.lock.lock().await;
        if self.db.port_mapping(server_id).await?.is_some() {
            return Ok(true);
        }
        match self.db.claim_port(server_id, port).await? {
            PortClaim::Claimed => {
                info!(server_id, port, "Restored port mapping");
                Ok(true)
            }
            PortClaim::Taken => {
                warn!(server_id, port, "Cannot restore port mapping, port is held");
                Ok(false)
            }
        }
    }

    /// Drop mappings whose server no longer exists.
    ///
    /// Such orphans appear when the process dies between allocating a port
    /// and persisting the server record. Returns the released server ids.
    pub async fn release_orphans(
        &self,
        live_server_ids: &HashSet<String>,
    ) -> Result<Vec<String>, PortError> {
        let _guard = self.lock.lock().await;
        let mut released = Vec::new();
        for (server_id, port) in self.db.list_port_mappings().await? {
            if live_server_ids.contains(&server_id) {
                continue;
            }
            warn!(server_id, port, "Releasing port held by missing server");
            self.db.release_port(&server_id).await?;
            released.push(server_id);
        }
        Ok(released)
    }
}
