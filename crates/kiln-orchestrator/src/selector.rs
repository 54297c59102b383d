//! Pluggable printer selection strategy.

use crate::job::Job;

/// Chooses a printer for a job from the currently idle candidates.
///
/// Implementations must be pure with respect to the registry: the idle
/// list is already a snapshot, and returning a name not in it is a
/// contract violation.
pub trait Selector: Send + Sync {
    fn select(&self, job: &Job, idle_printers: &[String]) -> Option<String>;
}

/// Default policy: skip printers that already failed this job, prefer
/// the job's preferred printer if it remains eligible, otherwise take
/// the first candidate in registry order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSelector;

impl Selector for DefaultSelector {
    fn select(&self, job: &Job, idle_printers: &[String]) -> Option<String> {
        let candidates: Vec<&String> = idle_printers
            .iter()
            .filter(|p| !job.failed_printers.contains(p.as_str()))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        if let Some(preferred) = &job.preferred_printer {
            if candidates.iter().any(|p| *p == preferred) {
                return Some(preferred.clone());
            }
        }
        Some(candidates[0].clone())
    }
}

#[cfg(test)]
mod tests {
    use kiln_types::{JobId, JobStatus, Metadata};

    use super::*;

    fn job() -> Job {
        Job {
            id: JobId::generate(),
            file_path: "benchy.gcode".into(),
            printer_name: None,
            status: JobStatus::Queued,
            submitted_at: kiln_types::now(),
            started_at: None,
            completed_at: None,
            submitted_by: "test".into(),
            priority: 0,
            error: None,
            attempt: 0,
            max_attempts: 3,
            preferred_printer: None,
            failed_printers: Default::default(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn picks_first_in_registry_order() {
        let idle = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(DefaultSelector.select(&job(), &idle), Some("p1".into()));
    }

    #[test]
    fn skips_printers_that_failed_the_job() {
        let mut j = job();
        j.failed_printers.insert("p1".into());
        let idle = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(DefaultSelector.select(&j, &idle), Some("p2".into()));
    }

    #[test]
    fn prefers_requested_printer_when_eligible() {
        let mut j = job();
        j.preferred_printer = Some("p2".into());
        let idle = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(DefaultSelector.select(&j, &idle), Some("p2".into()));

        // A preferred printer that already failed loses its preference.
        j.failed_printers.insert("p2".into());
        assert_eq!(DefaultSelector.select(&j, &idle), Some("p1".into()));
    }

    #[test]
    fn none_when_no_candidates_remain() {
        let mut j = job();
        j.failed_printers.insert("p1".into());
        assert_eq!(DefaultSelector.select(&j, &["p1".to_string()]), None);
        assert_eq!(DefaultSelector.select(&j, &[]), None);
    }
}
