//! Shared types for the Mizar high-availability agent
//!
//! This crate contains the serializable data structures exchanged between the
//! supervisor, the keeper reconciliation loop, and external tooling: node
//! roles, restart policies, service exit records, and the persisted keeper
//! state.

pub mod node;
pub mod service;

pub use node::*;
pub use service::*;
