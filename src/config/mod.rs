//! Configuration storage

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::calling::frame::DEFAULT_MAX_FRAME_RATE;
use crate::calling::session::SessionConfig;

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub calls: CallsSection,
}

/// `[calls]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsSection {
    /// Wait after the first server-reflexive candidate before sending SDP.
    pub ice_grace_ms: u64,
    /// Upper bound on remote video frames delivered per second.
    pub max_frame_rate: u32,
    /// Offer video on outgoing calls.
    pub video: bool,
    /// STUN/TURN URLs handed to the peer connection.
    pub ice_servers: Vec<String>,
    /// Name shown when a call's chat cannot be resolved.
    pub fallback_display_name: String,
}

impl Default for CallsSection {
    fn default() -> Self {
        Self {
            ice_grace_ms: 150,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            video: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            fallback_display_name: "Unknown".to_string(),
        }
    }
}

/// Runtime call settings derived from the config file.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub srflx_grace: Duration,
    pub max_frame_rate: u32,
    pub video: bool,
    pub ice_servers: Vec<String>,
    pub fallback_display_name: String,
}

impl Default for CallSettings {
    fn default() -> Self {
        CallsSection::default().into()
    }
}

impl From<CallsSection> for CallSettings {
    fn from(s: CallsSection) -> Self {
        Self {
            srflx_grace: Duration::from_millis(s.ice_grace_ms),
            max_frame_rate: s.max_frame_rate.max(1),
            video: s.video,
            ice_servers: s.ice_servers,
            fallback_display_name: s.fallback_display_name,
        }
    }
}

impl CallSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            srflx_grace: self.srflx_grace,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "chat-calls", "chat-calls")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        fs::write(&path, self.to_toml()?).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(path)
    }

    pub fn call_settings(&self) -> CallSettings {
        self.calls.clone().into()
    }
}
