//! Startup configuration for the flaky server.
//!
//! Configuration is resolved once, before the listening socket exists, and
//! is read-only afterwards. Sources are layered from lowest to highest
//! precedence:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (see [`FileConfig`])
//! 3. `FLAKY_*` environment variables and command-line flags, which the
//!    binary collects into [`ConfigOverrides`]

pub mod file;
pub mod leak;

pub use file::{FileConfig, FileListenConfig};
pub use leak::LeakMask;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7777;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 3000;

/// Default number of workers spawned before the accept loop throttles.
pub const DEFAULT_MAX_FAST_WORKERS: usize = 3000;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: expected {expected}, got '{value}'")]
    InvalidValue {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Fault-injection parameters shared by the accept loop and every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Emit debug-level diagnostics (read/write sizes, grandchild timing).
    pub debug: bool,
    /// Which descriptors are deliberately leaked across fork.
    pub leak: LeakMask,
    /// `SO_LINGER` timeout; `None` leaves lingering disabled.
    pub linger_secs: Option<u32>,
    /// Sleep applied by the throttle once too many workers were spawned.
    pub extra_slowdown_secs: u32,
    /// Workers spawned before the throttle kicks in.
    pub max_fast_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            leak: LeakMask::NONE,
            // Zero-second linger: closing resets the connection.
            linger_secs: Some(0),
            extra_slowdown_secs: 0,
            max_fast_workers: DEFAULT_MAX_FAST_WORKERS,
        }
    }
}

impl ServerConfig {
    pub fn extra_slowdown(&self) -> Duration {
        Duration::from_secs(u64::from(self.extra_slowdown_secs))
    }

    /// Short label used in the startup banner, e.g. `simple` or `leaky:3`.
    pub fn server_type(&self) -> String {
        if self.leak.is_empty() {
            "simple".to_string()
        } else {
            format!("leaky:{}", self.leak.bits())
        }
    }
}

/// Where and how the listening socket is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub backlog: i32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Values supplied by the command line or environment.
///
/// `None` (or `false` for `debug`) means "not given" and lets lower layers
/// win. Numeric values are raw: negative seconds and counts are clamped
/// during resolution, matching how the flags have always behaved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub debug: bool,
    pub leak: Option<LeakMask>,
    pub linger: Option<i64>,
    pub slow: Option<i64>,
    pub max_workers: Option<i64>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub backlog: Option<i32>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub server: ServerConfig,
    pub listen: ListenConfig,
}

impl ResolvedConfig {
    /// Layer an optional file and the overrides over the defaults.
    pub fn resolve(
        file: Option<&FileConfig>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut resolved = Self::default();

        if let Some(file) = file {
            resolved.apply_file(file);
        }
        resolved.apply_overrides(overrides);
        resolved.validate()?;

        Ok(resolved)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        let server = &mut self.server;
        if let Some(debug) = file.debug {
            server.debug = debug;
        }
        if let Some(bits) = file.leak {
            server.leak = LeakMask::from_bits(bits);
        }
        if let Some(linger) = file.linger {
            server.linger_secs = linger_from(linger);
        }
        if let Some(slow) = file.slow {
            server.extra_slowdown_secs = seconds_from(slow);
        }
        if let Some(max_workers) = file.max_workers {
            server.max_fast_workers = count_from(max_workers);
        }

        if let Some(listen) = &file.listen {
            if let Some(bind) = listen.bind {
                self.listen.bind = bind;
            }
            if let Some(port) = listen.port {
                self.listen.port = port;
            }
            if let Some(backlog) = listen.backlog {
                self.listen.backlog = backlog;
            }
        }
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let server = &mut self.server;
        if overrides.debug {
            server.debug = true;
        }
        if let Some(leak) = overrides.leak {
            server.leak = leak;
        }
        if let Some(linger) = overrides.linger {
            server.linger_secs = linger_from(linger);
        }
        if let Some(slow) = overrides.slow {
            server.extra_slowdown_secs = seconds_from(slow);
        }
        if let Some(max_workers) = overrides.max_workers {
            server.max_fast_workers = count_from(max_workers);
        }
        if let Some(bind) = overrides.bind {
            self.listen.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.listen.port = port;
        }
        if let Some(backlog) = overrides.backlog {
            self.listen.backlog = backlog;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.backlog < 0 {
            return Err(ConfigError::InvalidValue {
                key: "listen.backlog",
                expected: "non-negative integer",
                value: self.listen.backlog.to_string(),
            });
        }
        if !self.listen.bind.is_ipv4() {
            return Err(ConfigError::InvalidValue {
                key: "listen.bind",
                expected: "IPv4 address",
                value: self.listen.bind.to_string(),
            });
        }
        Ok(())
    }
}

/// Negative linger means "leave SO_LINGER off".
fn linger_from(value: i64) -> Option<u32> {
    if value < 0 {
        None
    } else {
        Some(value.min(i64::from(u32::MAX)) as u32)
    }
}

fn seconds_from(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn count_from(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}
