//! Child process management
//!
//! Services are launched as child processes that stay in the supervisor's
//! process group. This is deliberate: the shutdown escalation sequence
//! re-signals the whole group, and that only reaches the services if they
//! have not detached into sessions of their own.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
