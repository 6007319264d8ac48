//! Client and reference-server settings, loadable from TOML.
//!
//! ```toml
//! [client]
//! chunk_size = 262144
//!
//! [server]
//! listen = "127.0.0.1:7374"
//! max_download_size = 262144
//! min_download_chunk_size = 65536
//! file_quota = 1073741824   # per workspace, unset means unlimited
//! ```

use crate::anp::kanp::{KANP_MAJOR, KANP_MINOR, KFS_CHUNK_SIZE};
use crate::anp::transport::MAX_PAYLOAD_SIZE;
use crate::error::{KanpError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Room left in a frame for the sub-message envelope around one chunk.
const CHUNK_ENVELOPE: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upload chunk size in bytes.
    pub chunk_size: usize,
    pub protocol_major: u32,
    pub protocol_minor: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: KFS_CHUNK_SIZE,
            protocol_major: KANP_MAJOR,
            protocol_minor: KANP_MINOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Target payload size of one download frame.
    pub max_download_size: usize,
    /// Smallest chunk the server will put in a download frame.
    pub min_download_chunk_size: usize,
    /// Committed plus in-flight upload bytes allowed per workspace.
    pub file_quota: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7374".to_string(),
            max_download_size: 256 * 1024,
            min_download_chunk_size: 64 * 1024,
            file_quota: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KanpError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.server.validate()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(KanpError::Config("client.chunk_size must be non-zero".into()));
        }
        if self.chunk_size > MAX_PAYLOAD_SIZE - CHUNK_ENVELOPE {
            return Err(KanpError::Config(format!(
                "client.chunk_size {} does not fit in a frame (max {})",
                self.chunk_size,
                MAX_PAYLOAD_SIZE - CHUNK_ENVELOPE
            )));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_download_size == 0 || self.min_download_chunk_size == 0 {
            return Err(KanpError::Config(
                "server download sizes must be non-zero".into(),
            ));
        }
        if self.min_download_chunk_size > self.max_download_size {
            return Err(KanpError::Config(format!(
                "server.min_download_chunk_size {} exceeds max_download_size {}",
                self.min_download_chunk_size, self.max_download_size
            )));
        }
        // A frame may run one minimum chunk past its target size
        let worst_frame = self
            .max_download_size
            .saturating_add(self.min_download_chunk_size)
            .saturating_add(CHUNK_ENVELOPE);
        if worst_frame > MAX_PAYLOAD_SIZE {
            return Err(KanpError::Config(format!(
                "server.max_download_size {} plus min_download_chunk_size {} does not fit in a frame (max {})",
                self.max_download_size,
                self.min_download_chunk_size,
                MAX_PAYLOAD_SIZE - CHUNK_ENVELOPE
            )));
        }
        Ok(())
    }
}
