//! Adapters for the scheduler and poller collaborators.

pub mod git;
pub mod shell;
