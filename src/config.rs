use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::Path};
use tracing::warn;
use voxlink_client::ClientConfig;
use voxlink_core::ChunkCoord;
use voxlink_net::WorldInfo;
use voxlink_server::HostConfig;

pub const DEFAULT_SETTINGS_PATH: &str = "config/session.toml";

/// Everything the binary needs to host or join a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Address the TCP host listens on.
    pub bind: SocketAddr,
    /// Chunks loaded around the origin, per horizontal axis.
    pub chunk_radius: i32,
    /// Pump interval in milliseconds.
    pub tick_ms: u64,
    /// World parameters announced to joining clients.
    pub world: WorldInfo,
    /// Host session settings used by `host` and `loopback`.
    pub host: HostConfig,
    /// Client session settings used by `join` and `loopback`.
    pub client: ClientConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 25570)),
            chunk_radius: 1,
            tick_ms: 50,
            world: WorldInfo::default(),
            host: HostConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl SessionSettings {
    /// Load settings from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<SessionSettings>(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    SessionSettings::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "Session settings not found at {}. Using defaults",
                        path.display()
                    );
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                SessionSettings::default()
            }
        }
    }

    /// Save settings to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Coordinates of the chunks the host loads at startup.
    pub fn spawn_chunks(&self) -> Vec<ChunkCoord> {
        let r = self.chunk_radius.max(0);
        (-r..=r)
            .flat_map(|x| (-r..=r).map(move |z| ChunkCoord::new(x, 0, z)))
            .collect()
    }
}
