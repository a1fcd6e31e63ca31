//! API server for the Conveyor trigger engine.
//!
//! Provides webhook receivers, the queue management REST API and a
//! WebSocket stream of scheduler events.

pub mod error;
pub mod routes;
pub mod services;
pub mod state;
pub mod tasks;
pub mod ws;

pub use state::AppState;
