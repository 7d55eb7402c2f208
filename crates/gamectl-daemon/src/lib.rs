//! `GameControl` Daemon Library
//!
//! Lifecycle core for containerised game servers:
//! - Port allocation persisted in `SQLite`
//! - Per-server config store and data directories
//! - Container engine adapter (Docker, in-memory)
//! - Lifecycle manager reconciling stored and observed state
//! - Cancellable log relay

pub mod engine;
pub mod lifecycle;
pub mod logs;
pub mod ports;
pub mod storage;
