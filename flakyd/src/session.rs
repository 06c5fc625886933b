//! Per-connection command loop.
//!
//! A [`Session`] owns one client connection and its [`CommandBuffer`]. It
//! reads commands until the client leaves, a command ends the session, or
//! an I/O failure aborts it.

use crate::interpreter::{EchoSpan, Effect, Step, plan};
use crate::spawn::spawn_grandchild;
use flaky_common::{Command, CommandBuffer, Frame, ServerConfig};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

/// Why an aborted session stopped.
#[derive(Debug)]
pub enum AbortReason {
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    ShortWrite { expected: usize, written: usize },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::ReadFailed(err) => write!(f, "read {err}"),
            Self::WriteFailed(err) => write!(f, "write {err}"),
            Self::ShortWrite { expected, written } => {
                write!(f, "short write {written}/{expected}")
            }
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// `close` or `bug`: the protocol ended the session.
    ClientExit,
    Aborted(AbortReason),
}

impl SessionEnd {
    /// Worker exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ClientExit => 0,
            Self::Aborted(_) => 1,
        }
    }
}

pub struct Session<'a, S> {
    conn: Option<S>,
    buffer: CommandBuffer,
    config: &'a ServerConfig,
}

impl<'a, S: Read + Write> Session<'a, S> {
    pub fn new(conn: S, config: &'a ServerConfig) -> Self {
        Self {
            conn: Some(conn),
            buffer: CommandBuffer::new(),
            config,
        }
    }

    /// The connection, unless a `close` command already dropped it.
    pub fn into_connection(self) -> Option<S> {
        self.conn
    }

    /// Serve commands until the session ends.
    pub fn run(&mut self) -> SessionEnd {
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return SessionEnd::ClientExit;
            };

            let frame = match self.buffer.read_frame(conn) {
                Ok(Some(frame)) => frame,
                Ok(None) => return SessionEnd::Aborted(AbortReason::PeerClosed),
                Err(err) => {
                    warn!(error = %err, "pipe?");
                    self.conn = None;
                    return SessionEnd::Aborted(AbortReason::ReadFailed(err));
                }
            };

            debug!(read = frame.len, "last read");
            if frame.is_short() {
                warn!(read = frame.len, "short big frame");
            }

            let command = Command::parse(self.buffer.command_text(&frame));
            info!(
                command = %String::from_utf8_lossy(self.buffer.command_text(&frame)),
                "command"
            );

            if let Some(end) = self.execute(&frame, command) {
                return end;
            }
        }
    }

    fn execute(&mut self, frame: &Frame, command: Command) -> Option<SessionEnd> {
        let Step { delay, effect } = plan(command);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        match effect {
            Effect::Echo { span, repeat } => self.echo(frame, span, repeat),
            Effect::Reply(bytes) => {
                self.reply(&bytes);
                None
            }
            Effect::Close => {
                self.conn = None;
                info!("close");
                Some(SessionEnd::ClientExit)
            }
            Effect::Hangup => {
                info!("hangup");
                Some(SessionEnd::ClientExit)
            }
            Effect::Spawn { delay } => {
                self.spawn(delay);
                None
            }
            Effect::Ignore => None,
        }
    }

    fn echo(&mut self, frame: &Frame, span: EchoSpan, repeat: u8) -> Option<SessionEnd> {
        self.buffer.mark_echo(frame);
        let bytes = match span {
            EchoSpan::Read => self.buffer.read_bytes(frame),
            EchoSpan::FullFrame => self.buffer.full_frame(),
        };
        let conn = self.conn.as_mut()?;

        for round in 0..repeat {
            match conn.write(bytes) {
                Ok(written) => {
                    debug!(written, "last write");
                    // Only the first write must be complete.
                    if round == 0 && written != bytes.len() {
                        warn!(written, expected = bytes.len(), "short write");
                        return Some(SessionEnd::Aborted(AbortReason::ShortWrite {
                            expected: bytes.len(),
                            written,
                        }));
                    }
                }
                Err(err) => {
                    warn!(error = %err, expected = bytes.len(), "write pipe?");
                    return Some(SessionEnd::Aborted(AbortReason::WriteFailed(err)));
                }
            }
        }
        None
    }

    fn reply(&mut self, bytes: &[u8]) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.write(bytes) {
            Ok(written) => debug!(written, "last write"),
            Err(err) => warn!(error = %err, "write pipe?"),
        }
    }

    fn spawn(&mut self, delay: std::time::Duration) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match spawn_grandchild(conn, delay, self.config.debug) {
            Ok(report) => {
                if report.status.is_delivered() {
                    info!(child = report.child, status = %report.status, "child");
                } else {
                    warn!(child = report.child, status = %report.status, "child");
                }
            }
            Err(err) => warn!(error = %err, "fork abandoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flaky_common::{FRAME_SIZE, SENTINEL};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Everything a scripted connection saw, shared so it survives `close`.
    #[derive(Default)]
    struct Transcript {
        writes: Vec<Vec<u8>>,
        dropped: bool,
    }

    /// Connection that returns one scripted chunk per read.
    struct Scripted {
        reads: VecDeque<io::Result<Vec<u8>>>,
        write_limit: Option<usize>,
        fail_writes_after: Option<usize>,
        transcript: Rc<RefCell<Transcript>>,
    }

    impl Scripted {
        fn new(reads: &[&[u8]]) -> (Self, Rc<RefCell<Transcript>>) {
            let transcript = Rc::new(RefCell::new(Transcript::default()));
            let conn = Self {
                reads: reads.iter().map(|chunk| Ok(chunk.to_vec())).collect(),
                write_limit: None,
                fail_writes_after: None,
                transcript: Rc::clone(&transcript),
            };
            (conn, transcript)
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Ok(0),
                Some(Err(err)) => Err(err),
                Some(Ok(chunk)) => {
                    assert!(chunk.len() <= buf.len(), "chunk larger than read");
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut transcript = self.transcript.borrow_mut();
            if self.fail_writes_after == Some(transcript.writes.len()) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            }
            let n = self.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
            transcript.writes.push(buf[..n].to_vec());
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for Scripted {
        fn drop(&mut self) {
            self.transcript.borrow_mut().dropped = true;
        }
    }

    fn serve(conn: Scripted) -> SessionEnd {
        let config = ServerConfig::default();
        let mut session = Session::new(conn, &config);
        session.run()
    }

    #[test]
    fn ping_becomes_pong_with_terminator() {
        let (conn, transcript) = Scripted::new(&[b"ping\r\n"]);
        let end = serve(conn);

        assert!(matches!(end, SessionEnd::Aborted(AbortReason::PeerClosed)));
        assert_eq!(transcript.borrow().writes, vec![b"pong\r\n".to_vec()]);
    }

    #[test]
    fn ping_with_trailing_bytes_echoes_all_read_bytes() {
        let (conn, transcript) = Scripted::new(&[b"pingxyz\n"]);
        serve(conn);
        assert_eq!(transcript.borrow().writes, vec![b"pongxyz\n".to_vec()]);
    }

    #[test]
    fn sentinel_frame_writes_full_frame_twice() {
        let payload = vec![b'z'; FRAME_SIZE - SENTINEL.len()];
        let (conn, transcript) = Scripted::new(&[&SENTINEL[..], &payload[..]]);
        serve(conn);

        let transcript = transcript.borrow();
        assert_eq!(transcript.writes.len(), 2);
        for write in &transcript.writes {
            assert_eq!(write.len(), FRAME_SIZE);
            assert_eq!(&write[..10], b"bog (SYN)\0");
            assert!(write[10..].iter().all(|&b| b == b'z'));
        }
    }

    #[test]
    fn big_text_line_writes_stale_frame_twice() {
        let (conn, transcript) = Scripted::new(&[b"big\n"]);
        serve(conn);

        let transcript = transcript.borrow();
        assert_eq!(transcript.writes.len(), 2);
        assert_eq!(&transcript.writes[0][..4], b"bog\n");
        assert_eq!(transcript.writes[0].len(), FRAME_SIZE);
    }

    #[test]
    fn close_drops_connection_without_reply() {
        let (conn, transcript) = Scripted::new(&[b"close\n", b"ping\n"]);
        let end = serve(conn);

        assert!(matches!(end, SessionEnd::ClientExit));
        assert_eq!(end.exit_code(), 0);
        let transcript = transcript.borrow();
        assert!(transcript.writes.is_empty());
        assert!(transcript.dropped);
    }

    #[test]
    fn bug_hangs_up_silently_keeping_connection() {
        let (conn, transcript) = Scripted::new(&[b"bug0\n", b"ping\n"]);
        let config = ServerConfig::default();
        let mut session = Session::new(conn, &config);
        let end = session.run();

        assert!(matches!(end, SessionEnd::ClientExit));
        assert!(transcript.borrow().writes.is_empty());
        assert!(session.into_connection().is_some());
    }

    #[test]
    fn busy_replies_and_continues() {
        let (conn, transcript) = Scripted::new(&[b"busy0\n", b"ping\n"]);
        serve(conn);
        assert_eq!(
            transcript.borrow().writes,
            vec![b"0\n".to_vec(), b"pong\n".to_vec()]
        );
    }

    #[test]
    fn busy_with_negative_argument_replies_as_parsed() {
        let (conn, transcript) = Scripted::new(&[b"busy-4\n"]);
        serve(conn);
        assert_eq!(transcript.borrow().writes, vec![b"-4\n".to_vec()]);
    }

    #[test]
    fn big_after_longer_line_shows_nul_at_trim_point() {
        let (conn, transcript) = Scripted::new(&[b"pingxy\n", b"big"]);
        serve(conn);

        let transcript = transcript.borrow();
        assert_eq!(transcript.writes[0], b"pongxy\n");
        assert_eq!(&transcript.writes[1][..8], b"bog\0xy\n\0");
        assert_eq!(transcript.writes[1].len(), FRAME_SIZE);
    }

    #[test]
    fn unknown_command_is_ignored() {
        let (conn, transcript) = Scripted::new(&[b"hello\n", b"ping\n"]);
        serve(conn);
        assert_eq!(transcript.borrow().writes, vec![b"pong\n".to_vec()]);
    }

    #[test]
    fn eof_aborts_with_exit_one() {
        let (conn, _transcript) = Scripted::new(&[]);
        let end = serve(conn);
        assert!(matches!(end, SessionEnd::Aborted(AbortReason::PeerClosed)));
        assert_eq!(end.exit_code(), 1);
    }

    #[test]
    fn read_error_aborts_and_closes() {
        let (mut conn, transcript) = Scripted::new(&[]);
        conn.reads
            .push_back(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        let end = serve(conn);

        assert!(matches!(end, SessionEnd::Aborted(AbortReason::ReadFailed(_))));
        assert!(transcript.borrow().dropped);
    }

    #[test]
    fn short_first_echo_write_aborts() {
        let (mut conn, transcript) = Scripted::new(&[b"ping\n", b"ping\n"]);
        conn.write_limit = Some(2);
        let end = serve(conn);

        assert!(matches!(
            end,
            SessionEnd::Aborted(AbortReason::ShortWrite {
                expected: 5,
                written: 2
            })
        ));
        assert_eq!(transcript.borrow().writes.len(), 1);
    }

    #[test]
    fn failed_second_big_write_aborts() {
        let (mut conn, transcript) = Scripted::new(&[b"big\n"]);
        conn.fail_writes_after = Some(1);
        let end = serve(conn);

        assert!(matches!(end, SessionEnd::Aborted(AbortReason::WriteFailed(_))));
        assert_eq!(transcript.borrow().writes.len(), 1);
    }

    #[test]
    fn failed_busy_reply_keeps_session_alive() {
        let (mut conn, transcript) = Scripted::new(&[b"busy0\n", b"close\n"]);
        conn.fail_writes_after = Some(0);
        let end = serve(conn);

        assert!(matches!(end, SessionEnd::ClientExit));
        assert!(transcript.borrow().writes.is_empty());
    }

    #[test]
    fn works_over_a_real_socket() {
        use std::os::unix::net::UnixStream;

        let (server, mut client) = UnixStream::pair().unwrap();
        client.write_all(b"ping\n").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let config = ServerConfig::default();
        let mut session = Session::new(server, &config);
        let end = session.run();
        drop(session);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"pong\n");
        assert!(matches!(end, SessionEnd::Aborted(AbortReason::PeerClosed)));
    }
}
