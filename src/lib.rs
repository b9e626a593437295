//! nbsync: durable northbound journal synchronization for an SDN controller.
//!
//! Orchestrator resource changes are recorded into a SQLite-backed journal
//! and drained asynchronously to the controller's RESTCONF/JSON interface,
//! in dependency order and with at-least-once semantics. Maintenance tasks
//! keep the journal healthy and resynchronize after either side loses
//! state; a WebSocket receiver feeds controller-side port status back into
//! the orchestrator.

pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod filters;
pub mod journal;
pub mod periodic;
pub mod ports;
pub mod resources;
pub mod transport;
pub mod websocket;

pub use config::Config;
pub use error::{Error, Result};
pub use journal::{EntryState, JournalEntry, JournalWorker};
pub use resources::{Operation, PluginRegistry, ResourcePlugin, ResourceType};
