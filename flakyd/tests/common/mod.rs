//! Helpers shared by the flakyd end-to-end tests.

#![allow(dead_code)]

use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_target(true))
            .with(filter)
            .init();
    });
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the binary under test.
pub fn flakyd_bin() -> &'static str {
    env!("CARGO_BIN_EXE_flakyd")
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral listener");
    listener.local_addr().expect("ephemeral address").port()
}

/// A running flakyd in its own process group.
///
/// Workers and leaky acceptors are killed together with the server when
/// the guard is dropped.
pub struct FlakyServer {
    child: Child,
    pub addr: SocketAddr,
    logs: Arc<Mutex<Vec<String>>>,
}

/// Options for starting a [`FlakyServer`].
#[derive(Debug, Clone)]
pub struct FlakyServerBuilder {
    args: Vec<String>,
    log_level: String,
    fd_limit: Option<u64>,
}

impl Default for FlakyServerBuilder {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            log_level: "debug".to_string(),
            fd_limit: None,
        }
    }
}

impl FlakyServerBuilder {
    /// Extra command line arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|arg| arg.to_string()));
        self
    }

    /// Filter passed through `FLAKY_LOG`.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Cap `RLIMIT_NOFILE` of the server before it runs.
    pub fn fd_limit(mut self, limit: u64) -> Self {
        self.fd_limit = Some(limit);
        self
    }

    /// Start flakyd on a free loopback port and wait for its startup line.
    pub fn start(self) -> FlakyServer {
        let port = free_port();
        let mut command = Command::new(flakyd_bin());
        command
            .args(["--bind", "127.0.0.1", "--port", &port.to_string()])
            .args(["--log-format", "json"])
            .args(&self.args)
            .env("FLAKY_LOG", &self.log_level)
            .env_remove("FLAKY_CONFIG")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);

        if let Some(limit) = self.fd_limit {
            // SAFETY: setrlimit is async-signal-safe and touches no shared state.
            #[allow(unsafe_code)]
            unsafe {
                command.pre_exec(move || {
                    setrlimit(Resource::RLIMIT_NOFILE, limit, limit).map_err(std::io::Error::from)
                });
            }
        }

        let mut child = command.spawn().expect("spawn flakyd");

        let stdout = child.stdout.take().expect("piped stdout");
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&logs);
        // Workers inherit stdout, so this thread may outlive the guard.
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                sink.lock().expect("log sink").push(line);
            }
        });

        let server = FlakyServer {
            child,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            logs,
        };
        assert!(
            server.wait_for_log("\"message\":\"start\"", STARTUP_TIMEOUT),
            "flakyd did not start; logs: {:?}",
            server.logs()
        );
        server
    }
}

impl FlakyServer {
    pub fn builder() -> FlakyServerBuilder {
        FlakyServerBuilder::default()
    }

    /// Start flakyd with extra `args` and debug logging.
    pub fn start(args: &[&str]) -> Self {
        Self::builder().args(args).start()
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect to flakyd");
        stream.set_read_timeout(Some(IO_TIMEOUT)).expect("read timeout");
        stream
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().expect("log sink").clone()
    }

    /// Connect without panicking; `None` once nothing accepts the connection.
    pub fn try_connect(&self, timeout: Duration) -> Option<TcpStream> {
        TcpStream::connect_timeout(&self.addr, timeout).ok()
    }

    /// Poll for the server process to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().expect("poll flakyd") {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        None
    }

    /// Poll captured stdout until a line contains `needle`.
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.logs().iter().any(|line| line.contains(needle)) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Drop for FlakyServer {
    fn drop(&mut self) {
        let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

/// Send `command` and read exactly `len` reply bytes.
pub fn roundtrip(stream: &mut TcpStream, command: &[u8], len: usize) -> Vec<u8> {
    stream.write_all(command).expect("send command");
    let mut reply = vec![0; len];
    stream.read_exact(&mut reply).expect("read reply");
    reply
}

/// Read until the server closes. A reset counts as a close: the default
/// zero-second linger turns every server-side close into an RST.
pub fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return received,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => return received,
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
}

/// Number of open descriptors of `pid`.
#[cfg(target_os = "linux")]
pub fn open_fds(pid: u32) -> usize {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .expect("read /proc fd dir")
        .count()
}
