//! KDL configuration parsing for the Conveyor CI/CD trigger engine.
//!
//! This crate handles parsing of the system configuration file
//! (`conveyor.kdl`): server, scheduler, webhook and poller settings plus the
//! job definitions served to the trigger gateway.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    PollerSettings, SchedulerSettings, ServerSettings, SystemConfig, WebhookSettings,
    parse_system_config,
};
