use crate::{PeerdropError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Port the rendezvous server listens on.
    pub server_port: u16,
    /// Local port a joining peer binds for both its registration
    /// connection and its incoming-transfer listener.
    pub peer_port: u16,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// Where received files land. Defaults to the user's download
    /// directory when unset.
    pub inbox_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                name: gethostname::gethostname().to_string_lossy().to_string(),
            },
            network: NetworkSettings {
                server_port: 5000,
                peer_port: 5001,
                timeout_seconds: 30,
            },
            transfer: TransferSettings {
                chunk_size: 64 * 1024, // 64KB chunks
                inbox_dir: None,
            },
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| PeerdropError::Config(format!("Failed to read config: {}", e)))?;

            let settings: Settings = toml::from_str(&content)
                .map_err(|e| PeerdropError::Config(format!("Failed to parse config: {}", e)))?;

            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PeerdropError::Config(format!("Failed to create config dir: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PeerdropError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| PeerdropError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peerdrop", "peerdrop").ok_or_else(|| {
            PeerdropError::Config("Failed to get project directories".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn server_bind_address(&self) -> SocketAddr {
        format!("0.0.0.0:{}", self.network.server_port)
            .parse()
            .unwrap()
    }

    pub fn peer_bind_address(&self) -> SocketAddr {
        format!("0.0.0.0:{}", self.network.peer_port)
            .parse()
            .unwrap()
    }

    pub fn inbox_dir(&self) -> PathBuf {
        match &self.transfer.inbox_dir {
            Some(dir) => dir.clone(),
            None => directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("received")),
        }
    }
}
