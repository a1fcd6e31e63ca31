//! Push notification ingestion and repository polling.
//!
//! The [`TriggerGateway`] authenticates provider webhooks, normalizes the
//! repository identity, filters duplicate deliveries through the
//! [`CommitDedupCache`], matches job definitions and submits admitted work
//! to the scheduler. The [`RepositoryPoller`] covers jobs that are watched
//! by polling instead of (or in addition to) webhooks.

pub mod dedup;
pub mod gate;
pub mod gateway;
pub mod poller;
pub mod signature;

pub use dedup::CommitDedupCache;
pub use gate::LastBuiltCommitGate;
pub use gateway::{JobSubmission, PushOutcome, SubmissionStatus, TriggerGateway, WebhookStats};
pub use poller::{PollSummary, RemoteHeads, RepositoryPoller};
