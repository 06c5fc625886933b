//! Error types for the flaky daemon.
//!
//! Only setup and fatal accept failures ever reach `main`. Per-connection
//! failures end the worker that saw them and are reported through logs.

use std::net::SocketAddr;
use thiserror::Error;

/// Failures while preparing the listening socket or process state.
/// Each is fatal: logged, then the process exits with status 1.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("signal({signal}) {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("socket {0}")]
    Socket(#[source] std::io::Error),

    #[error("setsockopt({option}) {source}")]
    SetOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("bind {addr} {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listen({backlog}) {source}")]
    Listen {
        backlog: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal failure of a running accept loop.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("accept {0}")]
    Accept(#[source] std::io::Error),
}

/// Failure to start a grandchild for `fork`. Abandons the command only.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("pipe! {0}")]
    Pipe(#[source] nix::Error),

    #[error("fork! {0}")]
    Fork(#[source] nix::Error),
}
