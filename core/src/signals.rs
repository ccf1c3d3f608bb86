//! Cooperative signal flags
//!
//! Signal handlers do exactly one thing: set a process-wide flag. Every loop
//! in the process polls these flags at its next wake-up, which bounds signal
//! handling latency to one loop tick. The flags live behind an injectable
//! [`SignalState`] handle so tests can simulate signal delivery without the
//! OS.
//!
//! Four signals are handled:
//! - SIGHUP: reload configuration and forward to services
//! - SIGTERM: smart shutdown, services finish their current work
//! - SIGINT: fast shutdown
//! - SIGQUIT: immediate shutdown; service processes exit on the spot without
//!   cleanup, the supervisor forwards it and stops waiting politely
//!
//! The strongest stop signal observed so far is recorded as a rank and never
//! downgraded: once the shutdown has escalated to SIGINT, a later SIGTERM
//! does not soften it.

use crate::defaults::EXIT_CODE_QUIT;
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

/// Escalation rank of a stop signal. Higher never yields to lower.
fn signal_rank(sig: Signal) -> u8 {
    match sig {
        Signal::SIGTERM => 1,
        Signal::SIGINT => 2,
        Signal::SIGQUIT => 3,
        _ => 0,
    }
}

fn rank_signal(rank: u8) -> Signal {
    match rank {
        0 | 1 => Signal::SIGTERM,
        2 => Signal::SIGINT,
        _ => Signal::SIGQUIT,
    }
}

/// Process-wide signal flags, shared across all loops of one process
#[derive(Debug, Default)]
pub struct SignalState {
    asked_to_reload: AtomicBool,
    asked_to_stop: AtomicBool,
    asked_to_stop_fast: AtomicBool,
    asked_to_quit: AtomicBool,
    shutdown_rank: AtomicU8,
}

impl SignalState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the OS signal listeners for this process.
    ///
    /// With `exit_on_quit`, SIGQUIT terminates the process immediately with
    /// no cleanup; service processes run in that mode. The supervisor runs
    /// with `exit_on_quit = false` so it can forward the signal to its
    /// children first.
    pub fn install(self: &Arc<Self>, exit_on_quit: bool) -> crate::Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;

        let state = self.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                warn!("Received signal SIGHUP");
                state.asked_to_reload.store(true, Ordering::SeqCst);
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            while terminate.recv().await.is_some() {
                warn!("Smart shutdown: received signal SIGTERM");
                state.record_stop(Signal::SIGTERM);
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            while interrupt.recv().await.is_some() {
                warn!("Fast shutdown: received signal SIGINT");
                state.record_stop(Signal::SIGINT);
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            while quit.recv().await.is_some() {
                warn!("Immediate shutdown: received signal SIGQUIT");
                if exit_on_quit {
                    // no cleanup, crash-style exit
                    std::process::exit(EXIT_CODE_QUIT);
                }
                state.record_stop(Signal::SIGQUIT);
            }
        });

        Ok(())
    }

    /// Record a stop request. The shutdown rank only ever increases.
    pub fn record_stop(&self, sig: Signal) {
        match sig {
            Signal::SIGTERM => self.asked_to_stop.store(true, Ordering::SeqCst),
            Signal::SIGINT => self.asked_to_stop_fast.store(true, Ordering::SeqCst),
            Signal::SIGQUIT => self.asked_to_quit.store(true, Ordering::SeqCst),
            _ => {}
        }
        self.shutdown_rank
            .fetch_max(signal_rank(sig), Ordering::SeqCst);
    }

    /// Request a configuration reload (also used by tests)
    pub fn request_reload(&self) {
        self.asked_to_reload.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reload request, if any
    pub fn take_reload(&self) -> bool {
        self.asked_to_reload.swap(false, Ordering::SeqCst)
    }

    pub fn asked_to_stop(&self) -> bool {
        self.asked_to_stop.load(Ordering::SeqCst)
    }

    pub fn asked_to_stop_fast(&self) -> bool {
        self.asked_to_stop_fast.load(Ordering::SeqCst)
    }

    pub fn asked_to_quit(&self) -> bool {
        self.asked_to_quit.load(Ordering::SeqCst)
    }

    /// Whether any stop signal has been observed
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_rank.load(Ordering::SeqCst) > 0
    }

    /// The strongest stop signal observed so far. Defaults to SIGTERM when
    /// the shutdown was initiated internally rather than by a signal.
    pub fn shutdown_signal(&self) -> Signal {
        rank_signal(self.shutdown_rank.load(Ordering::SeqCst))
    }

    /// Escalate the shutdown signal to the next stronger one and return it.
    ///
    /// Capped at SIGQUIT: the group signal would reach the supervisor too,
    /// and SIGQUIT is the strongest signal it knows how to receive while
    /// still cleaning up its pidfile.
    pub fn escalate(&self) -> Signal {
        let prev = self.shutdown_rank.load(Ordering::SeqCst);
        let next = (prev.max(1) + 1).min(signal_rank(Signal::SIGQUIT));
        self.shutdown_rank.fetch_max(next, Ordering::SeqCst);
        rank_signal(self.shutdown_rank.load(Ordering::SeqCst))
    }
}
