//! # kiln-health: Print health monitoring for `Kiln`
//!
//! Two modes over the same measurement machinery:
//!
//! - a one-shot [`HealthMonitor::check_health`] that samples a printer's
//!   thermal stability, progress, sensors, and connectivity
//! - session-based periodic monitoring on a background thread, with
//!   stall detection, issue reporting, and auto-pause flagging
//!
//! The monitor emits structured reports rather than judgements: agents
//! inspect the metrics (optionally alongside camera snapshots) and
//! decide what to do. A critical overall report records an issue and,
//! when the session policy allows, flags the printer for pause by the
//! caller.

mod monitor;
mod policy;
mod report;
mod session;

pub use monitor::{HealthError, HealthMonitor, HealthResult, ReportCallback};
pub use policy::MonitorPolicy;
pub use report::{evaluate_health, HealthMetric, HealthReport};
pub use session::{IssueRecord, MonitorSession, MonitorSnapshot};
