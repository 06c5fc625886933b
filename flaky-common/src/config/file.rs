//! TOML configuration file support.
//!
//! Every key is optional; anything left out falls through to the built-in
//! defaults. Values use the same units and clamping rules as the
//! command-line flags:
//!
//! ```toml
//! debug = true
//! leak = 1
//! linger = -1        # negative disables SO_LINGER
//! slow = 2
//! max_workers = 10
//!
//! [listen]
//! bind = "127.0.0.1"
//! port = 7777
//! backlog = 128
//! ```

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Contents of a `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub debug: Option<bool>,
    /// Raw leak bits; `0` disables leaking.
    #[serde(default)]
    pub leak: Option<u8>,
    #[serde(default)]
    pub linger: Option<i64>,
    #[serde(default)]
    pub slow: Option<i64>,
    #[serde(default)]
    pub max_workers: Option<i64>,
    #[serde(default)]
    pub listen: Option<FileListenConfig>,
}

/// `[listen]` table of a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileListenConfig {
    #[serde(default)]
    pub bind: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub backlog: Option<i32>,
}

impl FileConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
