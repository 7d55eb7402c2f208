//! Database models for the `GameControl` daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gamectl_core::db::parse_timestamp;

use crate::engine::ContainerRef;

/// Persisted server status.
///
/// Authoritative only while the server has no container reference or the
/// engine cannot be reached; otherwise the engine's live state wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Installing,
    Running,
    Stopped,
    Error,
    Unknown,
}

impl ServerStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(Self::Installing),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// User-supplied game configuration; everything here may change after
/// creation through a settings update.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSettings {
    pub name: String,
    pub password: String,
    pub max_players: u32,
    pub description: String,
    pub exp_rate: f64,
    pub capture_rate: f64,
    pub spawn_rate: f64,
}

impl std::fmt::Debug for GameSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSettings")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("max_players", &self.max_players)
            .field("description", &self.description)
            .field("exp_rate", &self.exp_rate)
            .field("capture_rate", &self.capture_rate)
            .field("spawn_rate", &self.spawn_rate)
            .finish()
    }
}

/// One logical game server.
///
/// `id`, `port` and `created_at` never change once the record exists.
#[derive(Clone, PartialEq)]
pub struct ServerRecord {
    pub id: String,
    pub settings: GameSettings,
    pub admin_secret: String,
    pub port: u16,
    pub container_ref: Option<ContainerRef>,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRecord")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("admin_secret", &"<redacted>")
            .field("port", &self.port)
            .field("container_ref", &self.container_ref)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl ServerRecord {
    /// Record a lifecycle failure.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ServerStatus::Error;
        self.last_error = Some(reason.into());
    }
}

/// Raw `servers` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub id: String,
    pub name: String,
    pub password: String,
    pub admin_secret: String,
    pub max_players: i64,
    pub description: String,
    pub exp_rate: f64,
    pub capture_rate: f64,
    pub spawn_rate: f64,
    pub port: i64,
    pub container_ref: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ServerRow> for ServerRecord {
    type Error = String;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| format!("port {} out of range", row.port))?;
        let max_players = u32::try_from(row.max_players)
            .map_err(|_| format!("max_players {} out of range", row.max_players))?;
        let status = row.status.parse()?;
        let created_at =
            parse_timestamp(&row.created_at).map_err(|e| format!("created_at: {e}"))?;
        let updated_at =
            parse_timestamp(&row.updated_at).map_err(|e| format!("updated_at: {e}"))?;

        Ok(Self {
            id: row.id,
            settings: GameSettings {
                name: row.name,
                password: row.password,
                max_players,
                description: row.description,
                exp_rate: row.exp_rate,
                capture_rate: row.capture_rate,
                spawn_rate: row.spawn_rate,
            },
            admin_secret: row.admin_secret,
            port,
            container_ref: row.container_ref.map(ContainerRef::new),
            status,
            last_error: row.last_error,
            created_at,
            updated_at,
        })
    }
}
