//! Core functionality for the Mizar HA agent
//!
//! This crate contains the process supervision engine, the keeper
//! reconciliation loop, and the plumbing they share: signal flags, the
//! supervisor pidfile, and the process launcher.

pub mod config;
pub mod defaults;
pub mod error;
pub mod fsm;
pub mod keeper;
pub mod monitor;
pub mod pg;
pub mod pidfile;
pub mod process;
pub mod signals;
pub mod supervisor;

pub use error::{CoreError, Result};
