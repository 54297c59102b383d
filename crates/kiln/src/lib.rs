//! # Kiln: agent-facing infrastructure for FDM printer fleets
//!
//! Kiln exposes a tool-call surface through which autonomous agents
//! submit print jobs, monitor in-flight prints, and recover from
//! failures across a fleet of 3D printers. This crate assembles the
//! subsystems into one [`Kiln`] context and hosts the tool dispatcher:
//!
//! - [`kiln_adapters`] — capability-typed printer backends + registry
//! - [`kiln_safety`] — the gate every mutating operation passes through
//! - [`kiln_orchestrator`] — job assignment and retry across printers
//! - [`kiln_health`] — thermal/progress monitoring sessions
//! - [`kiln_recovery`] — failure classification and recovery planning
//! - [`kiln_events`] — typed pub/sub with bounded history
//! - [`kiln_store`] — persistence seams (injected collaborators)
//!
//! ## Usage
//!
//! ```
//! use kiln::Kiln;
//! use kiln_config::KilnConfig;
//! use serde_json::json;
//!
//! let kiln = Kiln::new(KilnConfig::default());
//! let status = kiln.call_tool("fleet_status", json!({}));
//! assert_eq!(status["success"], true);
//! ```
//!
//! Every tool returns `{"success": true, ...}` or a structured error
//! envelope with a machine-readable code and a retryability flag.

mod context;
mod envelope;
mod logging;
mod tools;

pub use context::{Kiln, DEFAULT_PRINTER};
pub use logging::init_logging;
pub use tools::CATALOG;

// Re-export the subsystem crates for embedders.
pub use kiln_adapters as adapters;
pub use kiln_config as config;
pub use kiln_events as events;
pub use kiln_health as health;
pub use kiln_orchestrator as orchestrator;
pub use kiln_recovery as recovery;
pub use kiln_safety as safety;
pub use kiln_store as store;
pub use kiln_types as types;
