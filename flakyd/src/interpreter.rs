//! Command interpreter.
//!
//! Maps a parsed [`Command`] to the [`Step`] a worker performs. Planning is
//! pure; the session executes the step against the connection.

use flaky_common::{Command, clamp_seconds};
use std::time::Duration;

/// Which part of the command buffer an echo writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoSpan {
    /// Exactly the bytes of the last read, terminator included.
    Read,
    /// The whole frame buffer, stale bytes included.
    FullFrame,
}

/// What a worker does after the step's delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Mark the buffer and write `span` `repeat` times.
    Echo { span: EchoSpan, repeat: u8 },
    /// Write these bytes once and keep going.
    Reply(Vec<u8>),
    /// Close the connection and end the session.
    Close,
    /// End the session without a response.
    Hangup,
    /// Hand the connection to a grandchild that answers after `delay`.
    Spawn { delay: Duration },
    /// Do nothing.
    Ignore,
}

/// One interpreted command: an optional sleep followed by an effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub delay: Option<Duration>,
    pub effect: Effect,
}

impl Step {
    pub fn now(effect: Effect) -> Self {
        Self {
            delay: None,
            effect,
        }
    }

    pub fn after(secs: u32, effect: Effect) -> Self {
        Self {
            delay: Some(seconds(secs)),
            effect,
        }
    }
}

/// Plan the step for `command`.
pub fn plan(command: Command) -> Step {
    match command {
        Command::Ping => Step::now(Effect::Echo {
            span: EchoSpan::Read,
            repeat: 1,
        }),
        Command::Big => Step::now(Effect::Echo {
            span: EchoSpan::FullFrame,
            repeat: 2,
        }),
        Command::Close => Step::now(Effect::Close),
        Command::Bug(arg) => Step::after(clamp_seconds(arg), Effect::Hangup),
        // Only the sleep is clamped; the reply echoes the argument as parsed.
        Command::Busy(arg) => Step::after(
            clamp_seconds(arg),
            Effect::Reply(format!("{arg}\n").into_bytes()),
        ),
        // The grandchild sleeps, not the worker.
        Command::Fork(arg) => Step::now(Effect::Spawn {
            delay: seconds(clamp_seconds(arg)),
        }),
        Command::Unknown => Step::now(Effect::Ignore),
    }
}

fn seconds(secs: u32) -> Duration {
    Duration::from_secs(u64::from(secs))
}
