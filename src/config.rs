//! Konfiguration für Call Engine und Signaling-Kanal
//!
//! Reihenfolge beim Laden:
//! 1. Defaults
//! 2. `signaling.json` im Config-Verzeichnis der Plattform (falls vorhanden)
//! 3. Umgebungsvariablen (`SIGNALING_URL`, `SIGNALING_TURN_*`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name der Konfigurationsdatei im Config-Verzeichnis
pub const CONFIG_FILE_NAME: &str = "signaling.json";

/// Default Signaling-Endpunkt (rohes WebSocket, kein SockJS-Fallback)
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080/ws/websocket";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Kamera-Track beim Anlegen der Session Transport mitsenden
    pub enable_video: bool,
    /// Kapazität des CallEvent-Broadcast
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            enable_video: true,
            event_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Fügt einen TURN-Server hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }
}

// ============================================================================
// CHANNEL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub signaling_url: String,
    /// STOMP-Destination für ausgehende Envelopes
    pub send_destination: String,
    /// Private Queue für eingehende Envelopes
    pub subscribe_destination: String,
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            send_destination: "/app/call".to_string(),
            subscribe_destination: "/user/queue/call".to_string(),
            heartbeat_interval_secs: 25,
            reconnect_delay_ms: 5000,
            connect_timeout_secs: 10,
        }
    }
}

impl ChannelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub channel: ChannelConfig,
}

impl Config {
    /// Lädt die Konfiguration aus dem Config-Verzeichnis und der Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Lädt `signaling.json` aus `dir`; fehlt die Datei, gelten die Defaults
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        tracing::info!("Loading config from {:?}", path);
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Überschreibt Werte aus Umgebungsvariablen
    ///
    /// `lookup` liefert den Wert einer Variable (in Produktion `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.channel.signaling_url = url;
        }

        if let Some(turn_url) = lookup("SIGNALING_TURN_URL") {
            let username = lookup("SIGNALING_TURN_USERNAME").unwrap_or_default();
            let credential = lookup("SIGNALING_TURN_CREDENTIAL").unwrap_or_default();
            self.engine.add_turn_server(turn_url, username, credential);
        }
    }

    /// Ermittelt das Config-Verzeichnis
    fn config_dir() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "pulse-signaling")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }
}

// ============================================================================
// TESTS
// ============================================================================
