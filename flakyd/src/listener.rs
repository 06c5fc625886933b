//! Process and listening-socket setup.

use crate::error::SetupError;
use flaky_common::{ListenConfig, ServerConfig};
use nix::sys::signal::{SigHandler, Signal, signal};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::TcpListener;
use std::time::Duration;
use tracing::debug;

/// Ignore `SIGCHLD` so exited workers are reaped by the kernel, and
/// `SIGPIPE` so writes to a vanished peer fail with `EPIPE`.
pub fn ignore_child_signals() -> Result<(), SetupError> {
    for (sig, name) in [(Signal::SIGCHLD, "SIGCHLD"), (Signal::SIGPIPE, "SIGPIPE")] {
        // SAFETY: SIG_IGN installs no handler code.
        #[allow(unsafe_code)]
        let installed = unsafe { signal(sig, SigHandler::SigIgn) };
        installed.map_err(|source| SetupError::Signal {
            signal: name,
            source,
        })?;
    }
    Ok(())
}

/// Create, configure, bind and listen on the server socket.
pub fn bind_listener(listen: &ListenConfig, server: &ServerConfig) -> Result<TcpListener, SetupError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(SetupError::Socket)?;

    match server.linger_secs {
        Some(secs) => {
            socket
                .set_linger(Some(Duration::from_secs(u64::from(secs))))
                .map_err(|source| SetupError::SetOption {
                    option: "SO_LINGER",
                    source,
                })?;
            debug!(linger_secs = secs, "SO_LINGER enabled");
        }
        None => debug!("SO_LINGER not enabled"),
    }

    socket
        .set_reuse_address(true)
        .map_err(|source| SetupError::SetOption {
            option: "SO_REUSEADDR",
            source,
        })?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|source| SetupError::SetOption {
            option: "SO_REUSEPORT",
            source,
        })?;

    let addr = listen.socket_addr();
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| SetupError::Bind { addr, source })?;

    socket
        .listen(listen.backlog)
        .map_err(|source| SetupError::Listen {
            backlog: listen.backlog,
            source,
        })?;

    Ok(TcpListener::from(socket))
}
