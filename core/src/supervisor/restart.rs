//! Restart budget: MaxR/MaxT windowed restart intensity
//!
//! A service may restart up to MaxR times; once that many restarts have been
//! spent, a new restart is only granted when the oldest restart still
//! tracked is older than MaxT seconds. A crash-looping service therefore
//! runs out of budget quickly, while a service that fails rarely over a long
//! uptime keeps restarting forever.
//!
//! The strategy is borrowed from Erlang's maximum restart intensity:
//! <http://erlang.org/doc/design_principles/sup_princ.html#maximum-restart-intensity>

use crate::defaults::{EXIT_CODE_DROPPED, EXIT_CODE_FATAL, EXIT_CODE_QUIT};
use schema::ServiceExit;

/// Ring buffer of the most recent restart timestamps plus a monotonic
/// restart count.
///
/// The ring holds at most MaxR entries; `position` is the slot written last,
/// so once the ring is full the oldest retained slot is
/// `(position + 1) % capacity`. Entries are only ever appended in ring
/// order and `count` never decreases.
#[derive(Debug, Clone)]
pub struct RestartCounters {
    count: u32,
    position: usize,
    start_times: Vec<u64>,
}

impl RestartCounters {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "restart ring needs at least one slot");
        Self {
            count: 0,
            position: 0,
            start_times: vec![0; capacity],
        }
    }

    /// Total restarts recorded so far (monotonic)
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Timestamp of the oldest restart still tracked, if any
    pub fn oldest(&self) -> Option<u64> {
        if self.count == 0 {
            None
        } else if (self.count as usize) < self.start_times.len() {
            Some(self.start_times[0])
        } else {
            Some(self.start_times[(self.position + 1) % self.start_times.len()])
        }
    }

    /// Record a restart that just happened at `now` (epoch seconds)
    pub fn record_restart(&mut self, now: u64) {
        if self.count > 0 {
            self.position = (self.position + 1) % self.start_times.len();
        }
        self.start_times[self.position] = now;
        self.count += 1;
    }

    /// Whether the MaxR/MaxT budget permits another restart at `now`.
    ///
    /// Within the first `max_retries` restarts the answer is always yes;
    /// past that, the oldest tracked restart must have aged out of the
    /// `max_time` window.
    pub fn may_restart(&self, now: u64, max_retries: u32, max_time: u64) -> bool {
        if self.count < max_retries {
            return true;
        }
        match self.oldest() {
            Some(oldest) => now.saturating_sub(oldest) > max_time,
            None => true,
        }
    }
}

/// Classification of a service exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code zero: asked politely to quit, or ran to completion
    CleanQuit,
    /// The node has been administratively removed; stop everything cleanly
    /// and never restart
    Dropped,
    /// Unrecoverable condition; stop everything with a fatal status and
    /// never restart
    Fatal,
    /// Anything else: an ordinary failure
    Failure,
}

/// Classify a service exit by its distinguished exit codes
pub fn classify_exit(exit: &ServiceExit) -> ExitClass {
    match exit.exit_code {
        Some(EXIT_CODE_QUIT) => ExitClass::CleanQuit,
        Some(EXIT_CODE_DROPPED) => ExitClass::Dropped,
        Some(EXIT_CODE_FATAL) => ExitClass::Fatal,
        _ => ExitClass::Failure,
    }
}
