//! Port allocation for game server instances.
//!
//! Each server gets one base port; the query and RCON ports are derived from
//! it, so only the base needs to be unique.

mod allocator;

pub use allocator::{PortAllocator, PortError, PortSet, lowest_free_port};
