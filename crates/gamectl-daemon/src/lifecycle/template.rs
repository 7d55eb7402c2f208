//! Container template for a Palworld dedicated server.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::{ContainerSpec, PortBinding, Protocol, VolumeBinding};
use crate::ports::PortSet;
use crate::storage::ServerRecord;

const GAME_PORT: u16 = 8211;
const QUERY_PORT: u16 = 27015;
const RCON_PORT: u16 = 25575;
const DATA_MOUNT: &str = "/palworld";

/// Build the container spec for `record`, mounting `data_dir`.
///
/// The container is named after the server id so a restarted process can
/// find it again.
pub fn palworld_spec(
    record: &ServerRecord,
    image: &str,
    data_dir: &Path,
    stop_grace: Duration,
) -> ContainerSpec {
    let ports = PortSet::from_base(record.port);
    let settings = &record.settings;

    let environment: BTreeMap<String, String> = [
        ("PUID", "1000".to_string()),
        ("PGID", "1000".to_string()),
        ("PORT", GAME_PORT.to_string()),
        ("PLAYERS", settings.max_players.to_string()),
        ("SERVER_PASSWORD", settings.password.clone()),
        ("ADMIN_PASSWORD", record.admin_secret.clone()),
        ("SERVER_NAME", settings.name.clone()),
        ("SERVER_DESCRIPTION", settings.description.clone()),
        ("MULTITHREADING", "true".to_string()),
        ("UPDATE_ON_BOOT", "true".to_string()),
        ("RCON_ENABLED", "true".to_string()),
        ("RCON_PORT", RCON_PORT.to_string()),
        ("COMMUNITY", "false".to_string()),
        ("EXP_RATE", settings.exp_rate.to_string()),
        ("PAL_CAPTURE_RATE", settings.capture_rate.to_string()),
        ("PAL_SPAWN_NUM_RATE", settings.spawn_rate.to_string()),
        ("TZ", "UTC".to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();

    ContainerSpec {
        name: record.id.clone(),
        image: image.to_string(),
        ports: vec![
            PortBinding {
                container_port: GAME_PORT,
                protocol: Protocol::Udp,
                host_port: ports.game,
            },
            PortBinding {
                container_port: QUERY_PORT,
                protocol: Protocol::Udp,
                host_port: ports.query,
            },
            PortBinding {
                container_port: RCON_PORT,
                protocol: Protocol::Tcp,
                host_port: ports.rcon,
            },
        ],
        volumes: vec![VolumeBinding {
            host_path: data_dir.to_path_buf(),
            container_path: DATA_MOUNT.to_string(),
        }],
        environment,
        stop_grace,
    }
}
