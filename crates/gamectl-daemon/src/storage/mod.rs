//! Persistence for the `GameControl` daemon.
//!
//! Server records live one row per server id in `SQLite`; each server also
//! owns a data directory on disk that is bound into its container.

mod db;
mod models;
mod queries;
mod queries_ports;
mod store;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_ports::PortClaim;
pub use store::ConfigStore;
