//! `soulact` configuration file and environment overrides

use std::env;
use std::path::{Path, PathBuf};

use action_primitives::EngineConfig;
use anyhow::{Context, Result};
use cdp_adapter::config::{DEFAULT_CDP_ORIGIN, DEFAULT_WORLD_NAME};
use cdp_adapter::CdpConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const ENV_CDP_ORIGIN: &str = "SOULACT_CDP_ORIGIN";
pub const ENV_STATE_DIR: &str = "SOULACT_STATE_DIR";
pub const ENV_DOWNLOAD_DIR: &str = "SOULACT_DOWNLOAD_DIR";

const LOCAL_CONFIG: &str = "config/soulact.yaml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActConfig {
    pub cdp_origin: String,
    pub state_dir: PathBuf,
    /// Defaults to `<state_dir>/downloads`.
    pub download_dir: Option<PathBuf>,
    pub default_timeout_ms: u64,
    pub command_deadline_ms: u64,
    pub world_name: String,
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
    pub network_quiet_ms: u64,
}

impl Default for ActConfig {
    fn default() -> Self {
        Self {
            cdp_origin: DEFAULT_CDP_ORIGIN.to_string(),
            state_dir: default_state_dir(),
            download_dir: None,
            default_timeout_ms: 5_000,
            command_deadline_ms: 15_000,
            world_name: DEFAULT_WORLD_NAME.to_string(),
            settle_min_ms: 200,
            settle_max_ms: 1_000,
            network_quiet_ms: 500,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("soulact")
}

impl ActConfig {
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("downloads"))
    }

    /// `SOULACT_*` variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(origin) = non_empty_var(ENV_CDP_ORIGIN) {
            self.cdp_origin = origin;
        }
        if let Some(dir) = non_empty_var(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_var(ENV_DOWNLOAD_DIR) {
            self.download_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cdp: CdpConfig {
                origin: self.cdp_origin.clone(),
                default_deadline_ms: self.command_deadline_ms,
                world_name: self.world_name.clone(),
                ..CdpConfig::default()
            },
            download_dir: self.download_dir(),
            settle_min_ms: self.settle_min_ms,
            settle_max_ms: self.settle_max_ms,
            network_quiet_ms: self.network_quiet_ms,
            ..EngineConfig::default()
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Where the configuration was read from, if anywhere.
pub struct LoadedConfig {
    pub config: ActConfig,
    pub path: Option<PathBuf>,
}

/// `--config`, else `./config/soulact.yaml`, else the user config dir,
/// else defaults. An explicit path must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let candidate = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let local = PathBuf::from(LOCAL_CONFIG);
            if local.exists() {
                Some(local)
            } else {
                dirs::config_dir()
                    .map(|dir| dir.join("soulact").join("config.yaml"))
                    .filter(|path| path.exists())
            }
        }
    };

    let mut loaded = match candidate {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: ActConfig = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            info!(path = %path.display(), "loaded configuration");
            LoadedConfig {
                config,
                path: Some(path),
            }
        }
        None => {
            debug!("no configuration file found; using defaults");
            LoadedConfig {
                config: ActConfig::default(),
                path: None,
            }
        }
    };
    loaded.config.apply_env_overrides();
    Ok(loaded)
}
