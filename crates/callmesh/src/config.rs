//! Configuration types for peer negotiation and transports

use crate::transport::frame::CHUNK_HEADER_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default file chunk size (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Largest single data channel message we are willing to emit
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Default label of the file data channel
pub const DEFAULT_CHANNEL_LABEL: &str = "fileSending";

/// Main configuration shared by the negotiator and the transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN server URLs (may be empty on a LAN or loopback)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Bytes of file payload per chunk frame (default: 16 KiB)
    pub chunk_size: usize,

    /// Label of the ordered data channel used for files
    pub channel_label: String,

    /// Base URL of the message log backend; records are dropped when None
    pub backend_url: Option<String>,

    /// Bearer token sent to the message log backend
    pub backend_token: Option<String>,

    /// Timeout for one backend request in seconds (default: 10)
    pub backend_timeout_secs: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            backend_url: None,
            backend_token: None,
            backend_timeout_secs: 10,
        }
    }
}

impl MeshConfig {
    /// Largest chunk size that still fits one frame
    pub const fn max_chunk_size() -> usize {
        MAX_FRAME_SIZE - CHUNK_HEADER_LEN
    }

    /// Override the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Override the STUN server list
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Set the message log backend
    pub fn with_backend(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "Invalid STUN URL format: {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "Invalid TURN URL format: {}",
                    turn.url
                )));
            }
        }

        if self.chunk_size == 0 || self.chunk_size > Self::max_chunk_size() {
            return Err(Error::InvalidConfig(format!(
                "chunk_size must be in range 1-{}",
                Self::max_chunk_size()
            )));
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if let Some(url) = &self.backend_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::InvalidConfig(format!(
                    "Invalid backend URL format: {}",
                    url
                )));
            }
        }

        if self.backend_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "backend_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
