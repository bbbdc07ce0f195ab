//! Mesh Configuration
//!
//! Defaults, then an optional JSON file, then `MESHLINK_*` environment
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::protocol::DEFAULT_TTL;
use crate::bluetooth::transport::MESH_VENDOR_CODE;
use crate::transfer::DEFAULT_CHUNK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

/// Node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// TTL that marks a packet as coming from a direct neighbor
    pub direct_ttl: u8,
    /// TTL stamped on our own advertisements
    pub advertise_ttl: u8,
    /// Manufacturer data slot carrying mesh packets
    pub vendor_code: u16,
    /// File transfer data frame size, in base64 characters
    pub chunk_size: usize,
    /// Where `origin_id.bin` and `seqnum.bin` live
    pub state_dir: PathBuf,
    /// Where received files are written
    pub download_dir: PathBuf,
    pub device_name: String,
    pub observation_queue: usize,
    pub frame_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            direct_ttl: DEFAULT_TTL,
            advertise_ttl: DEFAULT_TTL,
            vendor_code: MESH_VENDOR_CODE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            state_dir: PathBuf::from("."),
            download_dir: PathBuf::from("."),
            device_name: "meshlink".to_string(),
            observation_queue: 256,
            frame_queue: 1024,
        }
    }
}

impl MeshConfig {
    /// Load from `path` if given and present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MESHLINK_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        }

        if let Some(v) = lookup("MESHLINK_DIRECT_TTL") {
            self.direct_ttl = parse("MESHLINK_DIRECT_TTL", v)?;
        }
        if let Some(v) = lookup("MESHLINK_ADVERTISE_TTL") {
            self.advertise_ttl = parse("MESHLINK_ADVERTISE_TTL", v)?;
        }
        if let Some(v) = lookup("MESHLINK_CHUNK_SIZE") {
            self.chunk_size = parse("MESHLINK_CHUNK_SIZE", v)?;
        }
        if let Some(v) = lookup("MESHLINK_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MESHLINK_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MESHLINK_DEVICE_NAME") {
            self.device_name = v;
        }
        Ok(())
    }

    /// Normalise and check the settings
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.observation_queue == 0 {
            return Err(ConfigError::ZeroCapacity("observation_queue"));
        }
        if self.frame_queue == 0 {
            return Err(ConfigError::ZeroCapacity("frame_queue"));
        }
        Ok(self)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
