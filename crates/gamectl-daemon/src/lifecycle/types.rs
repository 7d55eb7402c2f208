//! Requests, views and errors of the lifecycle manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::ports::{PortError, PortSet};
use crate::storage::{DatabaseError, GameSettings, ServerRecord, ServerStatus};

/// Errors from lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Server {0} has no container")]
    NoContainer(String),

    /// Rejected input; nothing was persisted.
    #[error("Invalid settings: {0}")]
    Validation(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container name conflict: {0}")]
    Conflict(String),

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("No free port at or above {0}")]
    PortsExhausted(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for LifecycleError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => Self::EngineUnavailable(msg),
            EngineError::Image(msg) => Self::Image(msg),
            EngineError::Conflict(msg) => Self::Conflict(msg),
            other @ (EngineError::NotFound(_) | EngineError::Api(_)) => {
                Self::Engine(other.to_string())
            }
        }
    }
}

impl From<PortError> for LifecycleError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { base } => Self::PortsExhausted(base),
            PortError::Database(e) => Self::Persistence(e),
            contended @ PortError::Contended { .. } => {
                Self::Persistence(DatabaseError::Query(contended.to_string()))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

fn default_max_players() -> u32 {
    32
}

fn default_description() -> String {
    "Palworld Server".to_string()
}

const fn default_rate() -> f64 {
    1.0
}

/// Request to create a server.
#[derive(Clone, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub password: String,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_rate")]
    pub exp_rate: f64,
    #[serde(default = "default_rate")]
    pub capture_rate: f64,
    #[serde(default = "default_rate")]
    pub spawn_rate: f64,
    /// Generated when absent.
    #[serde(default)]
    pub admin_secret: Option<String>,
}

impl NewServer {
    /// Request with default description and rates.
    pub fn new(name: impl Into<String>, password: impl Into<String>, max_players: u32) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            max_players,
            description: default_description(),
            exp_rate: default_rate(),
            capture_rate: default_rate(),
            spawn_rate: default_rate(),
            admin_secret: None,
        }
    }

    pub(crate) fn settings(&self) -> GameSettings {
        GameSettings {
            name: self.name.clone(),
            password: self.password.clone(),
            max_players: self.max_players,
            description: self.description.clone(),
            exp_rate: self.exp_rate,
            capture_rate: self.capture_rate,
            spawn_rate: self.spawn_rate,
        }
    }
}

impl std::fmt::Debug for NewServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewServer")
            .field("name", &self.name)
            .field("max_players", &self.max_players)
            .field("description", &self.description)
            .field("exp_rate", &self.exp_rate)
            .field("capture_rate", &self.capture_rate)
            .field("spawn_rate", &self.spawn_rate)
            .finish_non_exhaustive()
    }
}

/// Partial settings change; `None` fields are left untouched.
#[derive(Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub name: Option<String>,
    pub password: Option<String>,
    pub max_players: Option<u32>,
    pub description: Option<String>,
    pub exp_rate: Option<f64>,
    pub capture_rate: Option<f64>,
    pub spawn_rate: Option<f64>,
    pub admin_secret: Option<String>,
}

impl SettingsUpdate {
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.password.is_none()
            && self.max_players.is_none()
            && self.description.is_none()
            && self.exp_rate.is_none()
            && self.capture_rate.is_none()
            && self.spawn_rate.is_none()
            && self.admin_secret.is_none()
    }

    /// Apply the provided fields to `record`.
    pub(crate) fn apply(self, record: &mut ServerRecord) {
        let settings = &mut record.settings;
        if let Some(name) = self.name {
            settings.name = name;
        }
        if let Some(password) = self.password {
            settings.password = password;
        }
        if let Some(max_players) = self.max_players {
            settings.max_players = max_players;
        }
        if let Some(description) = self.description {
            settings.description = description;
        }
        if let Some(rate) = self.exp_rate {
            settings.exp_rate = rate;
        }
        if let Some(rate) = self.capture_rate {
            settings.capture_rate = rate;
        }
        if let Some(rate) = self.spawn_rate {
            settings.spawn_rate = rate;
        }
        if let Some(secret) = self.admin_secret {
            record.admin_secret = secret;
        }
    }
}

impl std::fmt::Debug for SettingsUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsUpdate")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_players", &self.max_players)
            .field("description", &self.description)
            .field("exp_rate", &self.exp_rate)
            .field("capture_rate", &self.capture_rate)
            .field("spawn_rate", &self.spawn_rate)
            .field(
                "admin_secret",
                &self.admin_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Acknowledgement of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedServer {
    pub id: String,
    pub status: ServerStatus,
    pub port: u16,
}

/// Server as seen by callers: stored config merged with live engine state.
///
/// Never carries the password or admin secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerView {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub port: u16,
    pub ports: PortSet,
    pub max_players: u32,
    pub description: String,
    pub exp_rate: f64,
    pub capture_rate: f64,
    pub spawn_rate: f64,
    pub created_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionStatus {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "already running")]
    AlreadyRunning,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "already stopped")]
    AlreadyStopped,
    #[serde(rename = "restarting")]
    Restarting,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "updated")]
    Updated,
    /// The launch was re-run.
    #[serde(rename = "installing")]
    Installing,
}

/// `{status, id}` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub id: String,
}

impl ActionOutcome {
    pub fn new(status: ActionStatus, id: impl Into<String>) -> Self {
        Self {
            status,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub engine_reachable: bool,
    pub timestamp: DateTime<Utc>,
}

/// What [`recover`](super::LifecycleManager::recover) changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Port mappings released because their record was gone.
    pub orphan_ports: Vec<String>,
    /// Records whose missing port mapping was re-created.
    pub restored_ports: Vec<String>,
    /// Stale installs whose container turned out to exist.
    pub adopted: Vec<String>,
    /// Stale installs marked as failed.
    pub failed: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn action_status_serializes_as_phrase() {
        let outcome = ActionOutcome::new(ActionStatus::AlreadyStopped, "srv");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "already stopped");
        assert_eq!(json["id"], "srv");
    }

    #[test]
    fn new_server_defaults_from_json() {
        let req: NewServer =
            serde_json::from_str(r#"{"name":"Alpha","password":"p"}"#).unwrap();
        assert_eq!(req.max_players, 32);
        assert_eq!(req.description, "Palworld Server");
        assert!((req.exp_rate - 1.0).abs() < f64::EPSILON);
        assert!(req.admin_secret.is_none());
    }

    #[test]
    fn update_debug_hides_secrets() {
        let update = SettingsUpdate {
            password: Some("hunter2".into()),
            admin_secret: Some("root".into()),
            ..Default::default()
        };
        let debug = format!("{update:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("root"));
    }

    #[test]
    fn engine_errors_keep_their_category() {
        assert!(matches!(
            LifecycleError::from(EngineError::Unavailable("down".into())),
            LifecycleError::EngineUnavailable(_)
        ));
        assert!(matches!(
            LifecycleError::from(EngineError::Conflict("name".into())),
            LifecycleError::Conflict(_)
        ));
        assert!(matches!(
            LifecycleError::from(EngineError::NotFound("gone".into())),
            LifecycleError::Engine(_)
        ));
    }
}
