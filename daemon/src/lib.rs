//! Mizar daemon library
//!
//! Wires the supervision engine and the keeper loop into the `mizard`
//! binary: building the service list, and the entry points for the
//! supervisor and for the two services it re-executes.

pub mod bootstrap;
pub mod postgres_service;

pub use mizar_core::{CoreError, Result};
