//! Event record and type enumeration shared by publishers and subscribers.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Metadata;

/// Classification of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobSubmitted,
    JobQueued,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    PrintStarted,
    PrintCompleted,
    PrintProgress,
    PrintTerminal,
    PrinterState,
    PrinterError,
    VisionCheck,
    VisionAlert,
    SafetyEscalated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobSubmitted => "job_submitted",
            Self::JobQueued => "job_queued",
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::PrintStarted => "print_started",
            Self::PrintCompleted => "print_completed",
            Self::PrintProgress => "print_progress",
            Self::PrintTerminal => "print_terminal",
            Self::PrinterState => "printer_state",
            Self::PrinterError => "printer_error",
            Self::VisionCheck => "vision_check",
            Self::VisionAlert => "vision_alert",
            Self::SafetyEscalated => "safety_escalated",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single published event.
///
/// The payload is an opaque JSON map; subscribers pick out the keys they
/// understand and ignore the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Metadata,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: EventType, data: Metadata, source: impl Into<String>) -> Self {
        Self {
            event_type,
            data,
            source: source.into(),
            timestamp: crate::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialises_type_tag() {
        let mut data = Metadata::new();
        data.insert("job_id".into(), serde_json::json!("j1"));
        let event = Event::new(EventType::JobSubmitted, data, "orchestrator");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_submitted");
        assert_eq!(json["source"], "orchestrator");
        assert_eq!(json["data"]["job_id"], "j1");
    }
}
