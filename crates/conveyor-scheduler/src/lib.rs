//! Job queue and dispatch scheduling for the Conveyor CI/CD trigger engine.
//!
//! Holds pending work in priority order, enforces the concurrency cap and
//! resource gating, dispatches to an injected executor, and turns executor
//! outcomes into completion, retry or terminal failure.

pub mod admission;
pub mod events;
pub mod queue;
pub mod scheduler;

pub use admission::{Admission, LoadAverageMonitor, ResourceAdmission, StaticUsageMonitor};
pub use events::{EventBus, SchedulerEvent};
pub use queue::PendingQueue;
pub use scheduler::{JobScheduler, QueueSnapshot, SchedulerOptions, SchedulerStats};
