//! Accept loop and per-connection workers.
//!
//! Every accepted connection gets its own forked worker process. The parent
//! goes straight back to `accept`, after closing (or, with `LEAK_CLIENT`,
//! keeping) its copy of the client socket and tossing the throttle coin.
//!
//! With `LEAK_LISTENER` a worker keeps the listening socket, and once its
//! session is over it becomes one more acceptor on it.

use crate::error::ServeError;
use crate::session::{Session, SessionEnd};
use crate::throttle::Throttle;
use flaky_common::ServerConfig;
use nix::unistd::{ForkResult, fork};
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn};

pub struct AcceptLoop {
    listener: TcpListener,
    config: ServerConfig,
    throttle: Throttle,
    /// Client sockets kept open on purpose (`LEAK_CLIENT`).
    leaked: Vec<TcpStream>,
    pid: u32,
}

impl AcceptLoop {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let throttle = Throttle::new(&config);
        Self {
            listener,
            config,
            throttle,
            leaked: Vec::new(),
            pid: std::process::id(),
        }
    }

    /// Accept forever. Returns `Ok` only for the graceful stop that an
    /// accept failure means while leaking.
    pub fn run(mut self) -> Result<(), ServeError> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if !self.config.leak.is_empty() => {
                    info!(pid = self.pid, error = %err, leaked = self.leaked.len(), "stop");
                    return Ok(());
                }
                Err(err) => {
                    error!(pid = self.pid, error = %err, "FATAL: accept");
                    return Err(ServeError::Accept(err));
                }
            };

            self.throttle.record_spawn();

            // SAFETY: the server is single-threaded; the child continues
            // with a private copy of this loop's state.
            #[allow(unsafe_code)]
            let forked = unsafe { fork() };

            match forked {
                Ok(ForkResult::Child) => {
                    if !self.config.leak.leaks_listener() {
                        self.become_worker(stream, peer);
                    }
                    self.pid = std::process::id();
                    debug!(pid = self.pid, "leak listen socket");
                    run_worker(stream, peer, &self.config);
                    info!(pid = self.pid, "nope!");
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!(pid = self.pid, worker = child.as_raw(), peer = peer.port(), "spawned");
                    if self.config.leak.leaks_client() {
                        debug!(pid = self.pid, peer = peer.port(), "leak client socket");
                        self.leaked.push(stream);
                    } else {
                        drop(stream);
                    }
                }
                Err(errno) => {
                    warn!(pid = self.pid, error = %errno, peer = peer.port(), "fork failed");
                    self.throttle.record_failed_spawn();
                    drop(stream);
                    continue;
                }
            }

            self.throttle.coin_toss();
        }
    }

    /// Serve one connection in this process and exit.
    fn become_worker(self, stream: TcpStream, peer: SocketAddr) -> ! {
        drop(self.listener);
        let code = run_worker(stream, peer, &self.config);
        std::process::exit(code);
    }
}

/// Run a session on `stream` under a `worker` span and close the
/// connection. Returns the worker exit code.
pub fn run_worker(stream: TcpStream, peer: SocketAddr, config: &ServerConfig) -> i32 {
    let span = info_span!("worker", pid = std::process::id(), peer = peer.port());
    let _enter = span.enter();
    info!("connect");

    let mut session = Session::new(stream, config);
    let end = session.run();
    let conn = session.into_connection();
    drop(conn);

    if let SessionEnd::Aborted(reason) = &end {
        warn!(reason = %reason, "abort?");
    }
    end.exit_code()
}
