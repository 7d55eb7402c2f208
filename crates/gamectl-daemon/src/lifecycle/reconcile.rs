//! Merging observed container state into stored server status.

use crate::engine::{ContainerSnapshot, ContainerStatus, EngineError, ResourceUsage};
use crate::storage::ServerStatus;

pub const CONTAINER_MISSING: &str = "container missing";

/// What a read learned about a server's container.
#[derive(Debug)]
pub enum Observation {
    /// The record has no container reference.
    NoContainer,
    Live(ContainerSnapshot),
    Failed(EngineError),
    /// The engine did not answer within the stats timeout.
    TimedOut,
}

/// Status shown to the caller, plus the stored-status correction worth
/// persisting, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    pub status: ServerStatus,
    pub usage: ResourceUsage,
    pub correction: Option<ServerStatus>,
}

/// Merge `observed` into `stored`.
///
/// Only definite engine answers (running, exited, container gone) produce a
/// correction. Transient or unreachable states are shown as `unknown` and
/// never written back. A record without a container is never `running`.
pub fn reconcile(stored: ServerStatus, observed: &Observation) -> Reconciled {
    let unknown = Reconciled {
        status: ServerStatus::Unknown,
        usage: ResourceUsage::default(),
        correction: None,
    };
    let settled = |status: ServerStatus, usage: ResourceUsage| Reconciled {
        status,
        usage,
        correction: (stored != status).then_some(status),
    };

    match observed {
        Observation::NoContainer if stored == ServerStatus::Running => unknown,
        Observation::NoContainer => Reconciled {
            status: stored,
            usage: ResourceUsage::default(),
            correction: None,
        },
        Observation::Live(snapshot) => match snapshot.status {
            ContainerStatus::Running => settled(ServerStatus::Running, snapshot.usage),
            ContainerStatus::Exited => settled(ServerStatus::Stopped, ResourceUsage::default()),
            ContainerStatus::Restarting | ContainerStatus::Unknown => unknown,
        },
        Observation::Failed(EngineError::NotFound(_)) => {
            settled(ServerStatus::Error, ResourceUsage::default())
        }
        Observation::Failed(_) | Observation::TimedOut => unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(status: ContainerStatus, cpu: f64) -> Observation {
        Observation::Live(ContainerSnapshot {
            status,
            usage: ResourceUsage {
                cpu_percent: cpu,
                memory_mb: 512.0,
            },
        })
    }

    #[test]
    fn missing_container_is_never_running() {
        let merged = reconcile(ServerStatus::Running, &Observation::NoContainer);
        assert_eq!(merged.status, ServerStatus::Unknown);
        assert_eq!(merged.correction, None);

        let merged = reconcile(ServerStatus::Installing, &Observation::NoContainer);
        assert_eq!(merged.status, ServerStatus::Installing);
    }

    #[test]
    fn live_state_wins_and_is_corrected() {
        let merged = reconcile(ServerStatus::Stopped, &live(ContainerStatus::Running, 12.5));
        assert_eq!(merged.status, ServerStatus::Running);
        assert!((merged.usage.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert_eq!(merged.correction, Some(ServerStatus::Running));

        let merged = reconcile(ServerStatus::Running, &live(ContainerStatus::Running, 1.0));
        assert_eq!(merged.correction, None);

        let merged = reconcile(ServerStatus::Running, &live(ContainerStatus::Exited, 0.0));
        assert_eq!(merged.status, ServerStatus::Stopped);
        assert_eq!(merged.usage, ResourceUsage::default());
        assert_eq!(merged.correction, Some(ServerStatus::Stopped));
    }

    #[test]
    fn transient_states_are_unknown_and_not_persisted() {
        for observed in [
            live(ContainerStatus::Restarting, 3.0),
            Observation::Failed(EngineError::Unavailable("down".into())),
            Observation::Failed(EngineError::Api("500".into())),
            Observation::TimedOut,
        ] {
            let merged = reconcile(ServerStatus::Running, &observed);
            assert_eq!(merged.status, ServerStatus::Unknown);
            assert_eq!(merged.usage, ResourceUsage::default());
            assert_eq!(merged.correction, None);
        }
    }

    #[test]
    fn vanished_container_is_an_error() {
        let merged = reconcile(
            ServerStatus::Running,
            &Observation::Failed(EngineError::NotFound("abc".into())),
        );
        assert_eq!(merged.status, ServerStatus::Error);
        assert_eq!(merged.correction, Some(ServerStatus::Error));
    }
}
