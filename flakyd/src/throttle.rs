//! Accept-loop throttling.
//!
//! The throttle counts workers spawned since the last check. Once the count
//! reaches `max_fast_workers`, the calling process sleeps for the configured
//! slowdown before accepting again, and the count starts over.
//!
//! The count is approximate. Every forked process inherits its own copy of
//! the counter and nothing is synchronized between processes, so a leaky
//! worker that turns into an acceptor starts from whatever value its parent
//! had at fork time.

use flaky_common::ServerConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep accepting immediately.
    Fast,
    /// Too many workers: sleep this long first.
    Throttled(Duration),
}

#[derive(Debug)]
pub struct Throttle {
    spawned: AtomicUsize,
    max_fast_workers: usize,
    slowdown: Duration,
}

impl Throttle {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_limits(config.max_fast_workers, config.extra_slowdown())
    }

    pub fn with_limits(max_fast_workers: usize, slowdown: Duration) -> Self {
        Self {
            spawned: AtomicUsize::new(0),
            max_fast_workers,
            slowdown,
        }
    }

    /// Count a worker about to be spawned. Returns the new count.
    pub fn record_spawn(&self) -> usize {
        self.spawned.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Undo [`record_spawn`](Self::record_spawn) after a failed fork.
    pub fn record_failed_spawn(&self) {
        let _ = self
            .spawned
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Decide whether the next accept must wait, resetting the count when
    /// it does. Does not sleep.
    pub fn check(&self) -> Verdict {
        let spawned = self.spawned();
        if spawned < self.max_fast_workers {
            return Verdict::Fast;
        }
        self.spawned.store(0, Ordering::Relaxed);
        Verdict::Throttled(self.slowdown)
    }

    /// The coin toss: [`check`](Self::check), then sleep if throttled.
    pub fn coin_toss(&self) -> Verdict {
        let verdict = self.check();
        match verdict {
            Verdict::Fast => {}
            Verdict::Throttled(delay) => {
                info!(
                    pid = std::process::id(),
                    max_workers = self.max_fast_workers,
                    slowdown_secs = delay.as_secs(),
                    "too many workers, slowing down"
                );
                std::thread::sleep(delay);
                debug!(pid = std::process::id(), "slowdown done");
            }
        }
        verdict
    }
}
