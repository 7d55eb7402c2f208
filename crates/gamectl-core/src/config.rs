//! Configuration resolution for `GameControl`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (`--config`, or ~/.config/gamectl/settings.json)
//! 3. Environment variables (`GAMECTL_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Highest port offset derived from an allocated base port (query port).
pub const MAX_PORT_OFFSET: u16 = 10_000;

/// Complete `GameControl` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for per-server data (`<data_dir>/servers/<id>/data`).
    pub data_dir: Option<PathBuf>,
    /// `SQLite` database holding server records and port mappings.
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Which container engine backs the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Local Docker daemon.
    #[default]
    Docker,
    /// In-process engine; nothing is actually run.
    Memory,
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Self::Docker),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!("unknown engine kind: {other}"))),
        }
    }
}

/// Container engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Docker socket path; local defaults (`DOCKER_HOST` or the platform
    /// socket) are used when unset.
    pub docker_socket: Option<String>,
    /// Game server image (pulled before every container creation).
    pub image: String,
    /// Timeout applied to every request sent to the engine (seconds).
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Docker,
            docker_socket: None,
            image: "thijsvanloef/palworld-server-docker:latest".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Lifecycle manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// First port handed out by the allocator.
    pub base_port: u16,
    /// Grace period for stop/restart before the engine kills the container.
    pub grace_period_secs: u64,
    /// Bound on each per-server inspect during listing.
    pub stats_timeout_ms: u64,
    /// Per-connection log relay queue depth.
    pub log_buffer: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            base_port: 8211,
            grace_period_secs: 30,
            stats_timeout_ms: 2_000,
            log_buffer: 256,
        }
    }
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.base_port == 0 || self.lifecycle.base_port > u16::MAX - MAX_PORT_OFFSET {
            return Err(Error::Config(format!(
                "base_port must be between 1 and {}",
                u16::MAX - MAX_PORT_OFFSET
            )));
        }
        if self.lifecycle.log_buffer == 0 {
            return Err(Error::Config("log_buffer must be at least 1".into()));
        }
        if self.engine.image.trim().is_empty() {
            return Err(Error::Config("engine image cannot be empty".into()));
        }
        Ok(())
    }

    /// Data directory, falling back to the platform default.
    pub fn data_dir(&self) -> Result<PathBuf> {
        self.daemon
            .data_dir
            .clone()
            .or_else(default_data_dir)
            .ok_or_else(|| Error::Config("cannot determine data directory".into()))
    }

    /// Database path, falling back to `<data_dir>/gamectl.db`.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.daemon.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("gamectl.db")),
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicitly requested file must exist; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    } else if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gamectl").join("settings.json"))
}

/// Default data directory: `<platform data dir>/gamectl`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("gamectl"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.data_dir.is_some() {
        base.daemon.data_dir = overlay.daemon.data_dir;
    }
    if overlay.daemon.database_path.is_some() {
        base.daemon.database_path = overlay.daemon.database_path;
    }
    base.daemon.log_level = overlay.daemon.log_level;
    base.daemon.log_json = overlay.daemon.log_json;

    if overlay.engine.docker_socket.is_some() {
        base.engine.docker_socket = overlay.engine.docker_socket;
    }
    base.engine.kind = overlay.engine.kind;
    base.engine.image = overlay.engine.image;
    base.engine.request_timeout_secs = overlay.engine.request_timeout_secs;

    base.lifecycle = overlay.lifecycle;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("GAMECTL_DATA_DIR") {
        config.daemon.data_dir = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("GAMECTL_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("GAMECTL_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("GAMECTL_ENGINE")
        && let Ok(kind) = val.parse()
    {
        config.engine.kind = kind;
    }
    if let Ok(val) = std::env::var("GAMECTL_DOCKER_SOCKET") {
        config.engine.docker_socket = Some(val);
    }
    if let Ok(val) = std::env::var("GAMECTL_IMAGE") {
        config.engine.image = val;
    }
    if let Ok(val) = std::env::var("GAMECTL_BASE_PORT")
        && let Ok(n) = val.parse()
    {
        config.lifecycle.base_port = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_game_defaults() {
        let config = Config::default();
        assert_eq!(config.lifecycle.base_port, 8211);
        assert_eq!(config.lifecycle.grace_period_secs, 30);
        assert_eq!(config.engine.kind, EngineKind::Docker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn base_port_must_leave_room_for_derived_ports() {
        let mut config = Config::default();
        config.lifecycle.base_port = 60_000;
        assert!(config.validate().is_err());
        config.lifecycle.base_port = u16::MAX - MAX_PORT_OFFSET;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"engine": {"kind": "memory"}, "lifecycle": {"base_port": 9000}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        let mut merged = Config::default();
        merge_config(&mut merged, config);

        assert_eq!(merged.engine.kind, EngineKind::Memory);
        assert_eq!(merged.lifecycle.base_port, 9000);
        // Fields absent from the file keep their defaults.
        assert_eq!(merged.lifecycle.grace_period_secs, 30);
        assert!(merged.engine.image.contains("palworld"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn database_path_defaults_under_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = Some(PathBuf::from("/srv/gamectl"));
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/srv/gamectl/gamectl.db")
        );
    }

    #[test]
    fn engine_kind_parses() {
        assert_eq!("memory".parse::<EngineKind>().unwrap(), EngineKind::Memory);
        assert!("podman".parse::<EngineKind>().is_err());
    }
}
