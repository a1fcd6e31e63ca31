//! Core domain types and traits for the Conveyor CI/CD trigger engine.
//!
//! This crate contains:
//! - Queue entry identifiers, priorities and lifecycle states
//! - Push event parsing and repository URL normalization
//! - Job definitions and the registry trait
//! - Collaborator traits: executor, resource monitor, commit gate

pub mod error;
pub mod executor;
pub mod gate;
pub mod id;
pub mod job;
pub mod queue;
pub mod repository;
pub mod resources;

pub use error::{Error, Result};
pub use id::QueueEntryId;
