//! Wire protocol for the flaky server.
//!
//! Clients send short text commands, one per read, terminated by `\n` or
//! `\r\n`. Each command is read with a single `read(2)` of at most
//! [`COMMAND_READ_LEN`] bytes, so anything longer spills into the next
//! command. The one exception is the sentinel frame: exactly
//! [`SENTINEL`] as the first eight bytes announces a [`FRAME_SIZE`] payload
//! that is read in one more call and then treated as the command
//! [`SYNTHETIC_BIG_COMMAND`] without looking at the payload.
//!
//! | Command      | Meaning                                            |
//! |--------------|----------------------------------------------------|
//! | `ping`       | echo the read bytes, second byte replaced by `o`   |
//! | `big`        | write the whole frame buffer twice                 |
//! | `close`      | server closes the connection                       |
//! | `bug<N>`     | sleep N seconds, then hang up silently             |
//! | `busy<N>`    | sleep N seconds, reply `N\n`                       |
//! | `fork[<N>]`  | a grandchild sleeps N seconds, replies `<pid>\n`   |

use std::io::{self, Read};

/// Size of the command buffer and of every `big` response write.
pub const FRAME_SIZE: usize = 4096;

/// Maximum bytes consumed by one command read.
pub const COMMAND_READ_LEN: usize = 8;

/// First eight bytes of a large frame.
pub const SENTINEL: &[u8; COMMAND_READ_LEN] = b"aaaaaaaa";

/// Command text substituted for any sentinel frame.
pub const SYNTHETIC_BIG_COMMAND: &[u8] = b"big (SYN)";

/// Byte written over position 1 of echoed buffers (`ping` -> `pong`).
pub const ECHO_MARKER: u8 = b'o';

/// Line terminator found at the end of a command read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    None,
    Lf,
    CrLf,
}

impl Terminator {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.ends_with(b"\r\n") {
            Self::CrLf
        } else if bytes.ends_with(b"\n") {
            Self::Lf
        } else {
            Self::None
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Lf => 1,
            Self::CrLf => 2,
        }
    }

    pub fn is_empty(self) -> bool {
        self == Self::None
    }
}

/// How the current command arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A short text line.
    Line,
    /// The sentinel followed by a payload read.
    Sentinel,
}

/// Result of one successful command read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Bytes read in total (sentinel frames include the eight sentinel bytes).
    pub len: usize,
    pub terminator: Terminator,
}

impl Frame {
    /// True when a sentinel frame's payload read came back short.
    pub fn is_short(&self) -> bool {
        self.kind == FrameKind::Sentinel && self.len != FRAME_SIZE
    }
}

/// A parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Big,
    Close,
    /// Arguments are kept as parsed, sign included; see [`clamp_seconds`].
    Bug(i32),
    Busy(i32),
    Fork(i32),
    Unknown,
}

impl Command {
    /// Parse command text (terminator already removed). First matching
    /// prefix wins; trailing bytes after `ping`/`big`/`close` are ignored.
    pub fn parse(text: &[u8]) -> Self {
        if text.starts_with(b"ping") || text.starts_with(b"big") {
            if text[0] == b'b' { Self::Big } else { Self::Ping }
        } else if text.starts_with(b"close") {
            Self::Close
        } else if let Some(rest) = text.strip_prefix(b"bug") {
            Self::Bug(parse_atoi(rest))
        } else if let Some(rest) = text.strip_prefix(b"busy") {
            Self::Busy(parse_atoi(rest))
        } else if let Some(rest) = text.strip_prefix(b"fork") {
            Self::Fork(parse_atoi(rest))
        } else {
            Self::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Big => "big",
            Self::Close => "close",
            Self::Bug(_) => "bug",
            Self::Busy(_) => "busy",
            Self::Fork(_) => "fork",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bug(secs) | Self::Busy(secs) | Self::Fork(secs) => {
                write!(f, "{}{}", self.name(), secs)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Parse a signed decimal argument the way C `atoi` would.
///
/// Leading ASCII whitespace and one sign are accepted, digits are consumed
/// up to the first non-digit, and anything unparseable yields 0. Values
/// outside the `i32` range saturate.
pub fn parse_atoi(bytes: &[u8]) -> i32 {
    let mut rest = bytes;
    while let [first, tail @ ..] = rest {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }

    let negative = match rest.first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        _ => false,
    };

    let limit = i64::from(i32::MAX) + 1;
    let mut value: i64 = 0;
    for digit in rest.iter().take_while(|b| b.is_ascii_digit()) {
        value = (value * 10 + i64::from(digit - b'0')).min(limit);
    }

    let signed = if negative { -value } else { value };
    signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Sleep length for a parsed argument: negatives become 0.
pub fn clamp_seconds(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Per-connection command buffer.
///
/// The buffer is reused for the whole connection and never cleared, so a
/// short sentinel payload leaves bytes from earlier commands in the tail of
/// the frame. Those stale bytes are part of what `big` echoes.
pub struct CommandBuffer {
    bytes: Box<[u8; FRAME_SIZE]>,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0; FRAME_SIZE]),
        }
    }

    /// Read the next command.
    ///
    /// Returns `Ok(None)` when the peer has closed the connection. An error
    /// from either the command read or the sentinel payload read is
    /// returned as is.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<Frame>> {
        let n = reader.read(&mut self.bytes[..COMMAND_READ_LEN])?;
        if n == 0 {
            return Ok(None);
        }

        if n == COMMAND_READ_LEN && &self.bytes[..COMMAND_READ_LEN] == SENTINEL {
            let payload = reader.read(&mut self.bytes[COMMAND_READ_LEN..])?;
            let end = SYNTHETIC_BIG_COMMAND.len();
            self.bytes[..end].copy_from_slice(SYNTHETIC_BIG_COMMAND);
            self.bytes[end] = 0;
            return Ok(Some(Frame {
                kind: FrameKind::Sentinel,
                len: COMMAND_READ_LEN + payload,
                terminator: Terminator::None,
            }));
        }

        let terminator = Terminator::detect(&self.bytes[..n]);
        self.bytes[n - terminator.len()] = 0;
        Ok(Some(Frame {
            kind: FrameKind::Line,
            len: n,
            terminator,
        }))
    }

    /// Command text of `frame`, without its terminator.
    pub fn command_text(&self, frame: &Frame) -> &[u8] {
        match frame.kind {
            FrameKind::Line => &self.bytes[..frame.len - frame.terminator.len()],
            FrameKind::Sentinel => SYNTHETIC_BIG_COMMAND,
        }
    }

    /// Overwrite the second byte with [`ECHO_MARKER`] and put back the
    /// first terminator byte that framing replaced with NUL.
    pub fn mark_echo(&mut self, frame: &Frame) {
        self.bytes[1] = ECHO_MARKER;
        if frame.kind == FrameKind::Line {
            let at = frame.len - frame.terminator.len();
            match frame.terminator {
                Terminator::None => {}
                Terminator::Lf => self.bytes[at] = b'\n',
                Terminator::CrLf => self.bytes[at] = b'\r',
            }
        }
    }

    /// The bytes of the last command read. Until [`mark_echo`](Self::mark_echo)
    /// runs, the first terminator byte reads as NUL.
    pub fn read_bytes(&self, frame: &Frame) -> &[u8] {
        &self.bytes[..frame.len.min(FRAME_SIZE)]
    }

    /// The whole buffer.
    pub fn full_frame(&self) -> &[u8] {
        &self.bytes[..]
    }
}
