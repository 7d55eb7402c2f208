//! Engine-facing value types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

/// Opaque handle the engine returned for a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in logs.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Container port published on a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: u16,
}

impl PortBinding {
    /// Docker-style key, e.g. `8211/udp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_str())
    }
}

/// Host directory mounted read-write into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// Everything needed to create and start one container.
#[derive(Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub environment: BTreeMap<String, String>,
    /// Time the engine gives the container to stop before killing it.
    pub stop_grace: Duration,
}

impl std::fmt::Debug for ContainerSpec {
    // Environment carries passwords; only the keys are printed.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("ports", &self.ports)
            .field("volumes", &self.volumes)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("stop_grace", &self.stop_grace)
            .finish()
    }
}

/// Container state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Exited,
    Restarting,
    Unknown,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Result of an inspect call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerSnapshot {
    pub status: ContainerStatus,
    pub usage: ResourceUsage,
}

/// Lazy, infinite, non-restartable sequence of raw log chunks.
///
/// A chunk may hold several lines. Ends when the container stops; dropping
/// it detaches from the engine.
pub type LogStream =
    Pin<Box<dyn Stream<Item = Result<String, super::EngineError>> + Send + 'static>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_key_format() {
        let binding = PortBinding {
            container_port: 25575,
            protocol: Protocol::Tcp,
            host_port: 8311,
        };
        assert_eq!(binding.container_key(), "25575/tcp");
    }

    #[test]
    fn short_ref_truncates_long_ids() {
        let long = ContainerRef::new("0123456789abcdef0123");
        assert_eq!(long.short(), "0123456789ab");
        let short = ContainerRef::new("abc");
        assert_eq!(short.short(), "abc");
    }

    #[test]
    fn spec_debug_hides_env_values() {
        let spec = ContainerSpec {
            name: "srv".into(),
            image: "img".into(),
            ports: Vec::new(),
            volumes: Vec::new(),
            environment: [("SERVER_PASSWORD".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
            stop_grace: Duration::from_secs(30),
        };
        let debug = format!("{spec:?}");
        assert!(debug.contains("SERVER_PASSWORD"));
        assert!(!debug.contains("hunter2"));
    }
}
