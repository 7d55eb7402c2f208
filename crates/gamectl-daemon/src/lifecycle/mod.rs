//! Server lifecycle: creation, control, teardown and state reconciliation.

mod ids;
mod locks;
mod manager;
mod reconcile;
mod template;
mod types;
mod validate;

pub use ids::{IdGenerator, generate_secret};
pub use locks::{ServerGuard, ServerLocks};
pub use manager::{LifecycleManager, ManagerOptions};
pub use reconcile::{CONTAINER_MISSING, Observation, Reconciled, reconcile};
pub use template::palworld_spec;
pub use types::*;
pub use validate::{validate_new_server, validate_update};
