//! Nebula library crate
//!
//! The mutation pipeline (workspace guard, JSON recovery, anchor and diff
//! editing, orchestration, rollback) and the agents built on it. The binary
//! is a thin CLI over [`agents::Pipeline`].

pub mod action;
pub mod agents;
pub mod anchor;
pub mod config;
pub mod diff;
pub mod error;
pub mod llm;
pub mod logging;
pub mod mutation;
pub mod orchestrator;
pub mod recovery;
pub mod util;
pub mod workspace;

pub use error::{NebulaError, Result};
