//! Nested spawn for the `fork` command.
//!
//! The worker forks a grandchild that shares the client connection. The
//! grandchild sleeps, writes its pid line to the client, reports how that
//! write went over a private pipe, and exits. The worker blocks on the pipe
//! until the report arrives or the grandchild is gone.

use crate::error::SpawnError;
use nix::time::{ClockId, clock_gettime};
use nix::unistd::{ForkResult, fork, pipe};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// Size of the status word on the pipe.
const STATUS_LEN: usize = std::mem::size_of::<i32>();

/// What the worker learned from the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrandchildStatus {
    /// The pid line was written in full.
    Delivered,
    /// The grandchild reported a short or failed write.
    WriteMismatch(i32),
    /// The pipe closed before a full status word arrived.
    Disconnected,
}

impl GrandchildStatus {
    fn from_word(bytes: &[u8]) -> Self {
        match <[u8; STATUS_LEN]>::try_from(bytes) {
            Ok(word) => match i32::from_ne_bytes(word) {
                0 => Self::Delivered,
                code => Self::WriteMismatch(code),
            },
            Err(_) => Self::Disconnected,
        }
    }

    pub fn is_delivered(&self) -> bool {
        *self == Self::Delivered
    }
}

impl fmt::Display for GrandchildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "0"),
            Self::WriteMismatch(code) => write!(f, "{code}"),
            Self::Disconnected => write!(f, "unknown"),
        }
    }
}

/// Read end of the status pipe, held by the worker.
#[derive(Debug)]
pub struct StatusReader(File);

/// Write end of the status pipe, held by the grandchild.
#[derive(Debug)]
pub struct StatusWriter(File);

/// Create a connected reader/writer pair.
pub fn status_pipe() -> Result<(StatusReader, StatusWriter), SpawnError> {
    let (read_fd, write_fd) = pipe().map_err(SpawnError::Pipe)?;
    Ok((
        StatusReader(File::from(read_fd)),
        StatusWriter(File::from(write_fd)),
    ))
}

impl StatusReader {
    /// Block until one status word arrives or every writer is closed.
    pub fn wait(mut self) -> GrandchildStatus {
        let mut word = [0u8; STATUS_LEN];
        let mut filled = 0;
        while filled < STATUS_LEN {
            match self.0.read(&mut word[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "status pipe read failed");
                    break;
                }
            }
        }
        GrandchildStatus::from_word(&word[..filled])
    }
}

impl StatusWriter {
    /// Send the status word. Consumes the writer so the pipe closes after.
    pub fn report(mut self, code: i32) -> io::Result<()> {
        self.0.write_all(&code.to_ne_bytes())
    }
}

/// Result of writing the pid line.
#[derive(Debug)]
pub struct Delivery {
    pub expected: usize,
    pub written: io::Result<usize>,
}

impl Delivery {
    /// 0 when the whole line went out in one write, 1 otherwise.
    pub fn status_code(&self) -> i32 {
        match self.written {
            Ok(n) if n == self.expected => 0,
            _ => 1,
        }
    }
}

/// Write `"<pid>\n"` with a single write call.
pub fn deliver_pid<W: Write>(conn: &mut W, pid: u32) -> Delivery {
    let line = format!("{pid}\n");
    Delivery {
        expected: line.len(),
        written: conn.write(line.as_bytes()),
    }
}

/// Worker-side result of a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnReport {
    pub child: i32,
    pub status: GrandchildStatus,
}

/// Fork a grandchild that answers on `conn` after `delay`, and wait for its
/// status report. Never returns in the grandchild.
pub fn spawn_grandchild<S: Write>(
    conn: &mut S,
    delay: Duration,
    debug: bool,
) -> Result<SpawnReport, SpawnError> {
    let (reader, writer) = status_pipe()?;

    // SAFETY: the server never starts a second thread, so the child gets a
    // consistent copy of the whole address space.
    #[allow(unsafe_code)]
    let forked = unsafe { fork() }.map_err(SpawnError::Fork)?;

    match forked {
        ForkResult::Child => {
            drop(reader);
            let code = run_grandchild(conn, writer, delay, debug);
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(writer);
            let status = reader.wait();
            Ok(SpawnReport {
                child: child.as_raw(),
                status,
            })
        }
    }
}

fn run_grandchild<S: Write>(
    conn: &mut S,
    writer: StatusWriter,
    delay: Duration,
    debug: bool,
) -> i32 {
    let pid = std::process::id();
    let span = info_span!("grandchild", pid);
    let _enter = span.enter();

    let started = if debug { cpu_time() } else { None };
    info!(delay_secs = delay.as_secs(), "start");

    std::thread::sleep(delay);
    let delivery = deliver_pid(conn, pid);
    match &delivery.written {
        Ok(n) => debug!(written = n, expected = delivery.expected, "last write"),
        Err(err) => warn!(error = %err, "write failed"),
    }

    let code = delivery.status_code();
    if let Err(err) = writer.report(code) {
        warn!(error = %err, "status report failed");
    }

    if let (Some(start), Some(stop)) = (started, cpu_time()) {
        let used = stop.saturating_sub(start);
        debug!(cpu_us = used.as_micros() as u64, "stop");
    }
    code
}

/// CPU time consumed by this process so far.
fn cpu_time() -> Option<Duration> {
    let now = clock_gettime(ClockId::CLOCK_PROCESS_CPUTIME_ID).ok()?;
    let secs = u64::try_from(now.tv_sec()).ok()?;
    let nanos = u32::try_from(now.tv_nsec()).ok()?;
    Some(Duration::new(secs, nanos))
}
