//! Shared types and utilities for the flaky fault-injecting server.
//!
//! - [`config`]: resolved startup parameters and their layered loading
//! - [`protocol`]: the plain-text command protocol and its framing rules
//! - [`logging`]: tracing subscriber setup shared by the binary and tests

pub mod config;
pub mod logging;
pub mod protocol;

pub use config::{
    ConfigError, ConfigOverrides, FileConfig, LeakMask, ListenConfig, ResolvedConfig,
    ServerConfig,
};
pub use logging::{LogConfig, LogFormat, LoggingError, init_logging};
pub use protocol::{
    COMMAND_READ_LEN, Command, CommandBuffer, FRAME_SIZE, Frame, FrameKind, SENTINEL,
    SYNTHETIC_BIG_COMMAND, Terminator, clamp_seconds, parse_atoi,
};
