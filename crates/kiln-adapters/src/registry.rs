//! Fleet registry: named adapters in stable registration order with a
//! cached status view.
//!
//! The cache exists so schedulers can ask "which printers are idle?"
//! without touching any transport: `get_idle_printers` and
//! `get_fleet_status` read cached state only, and `refresh_all` performs
//! the adapter I/O with no registry lock held.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kiln_types::{PrinterCapabilities, PrinterStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contract::PrinterAdapter;

/// Errors from registry bookkeeping.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("printer {0:?} is already registered")]
    Duplicate(String),

    #[error("printer not found: {0:?}")]
    NotFound(String),
}

/// A registered backend as seen by the orchestrator and tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterRecord {
    pub name: String,
    pub adapter_type: String,
    pub capabilities: PrinterCapabilities,
    pub safety_profile_id: String,
    pub last_status: PrinterStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

/// One printer's cached status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetPrinterStatus {
    pub name: String,
    pub adapter_type: String,
    pub connected: bool,
    pub status: PrinterStatus,
    pub tool_temp_actual: Option<f64>,
    pub bed_temp_actual: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
}

struct Entry {
    name: String,
    adapter: Arc<dyn PrinterAdapter>,
    cached: FleetPrinterStatus,
}

/// Registry of printer adapters keyed by unique name.
///
/// Iteration order is registration order and never changes while a
/// printer stays registered — the default selector depends on this.
pub struct PrinterRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl PrinterRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn PrinterAdapter>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::Duplicate(name));
        }
        let cached = FleetPrinterStatus {
            name: name.clone(),
            adapter_type: adapter.name().to_string(),
            connected: false,
            status: PrinterStatus::Unknown,
            tool_temp_actual: None,
            bed_temp_actual: None,
            checked_at: None,
        };
        tracing::info!(printer = %name, backend = adapter.name(), "registered printer");
        entries.push(Entry {
            name,
            adapter,
            cached,
        });
        Ok(())
    }

    /// Removes a printer. Returns `false` when the name is unknown.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.name != name);
        before != entries.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PrinterAdapter>> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.adapter))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn list_names(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Full record for one printer (cached status, no I/O).
    pub fn record(&self, name: &str) -> Option<PrinterRecord> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.iter().find(|e| e.name == name).map(|e| PrinterRecord {
            name: e.name.clone(),
            adapter_type: e.adapter.name().to_string(),
            capabilities: e.adapter.capabilities(),
            safety_profile_id: e.adapter.safety_profile().id,
            last_status: e.cached.status,
            last_checked: e.cached.checked_at,
        })
    }

    /// Queries every adapter for fresh state and updates the cache.
    ///
    /// Adapter I/O runs with the registry lock released; a printer that
    /// fails to respond is cached as offline rather than propagating.
    pub fn refresh_all(&self) -> Vec<FleetPrinterStatus> {
        let adapters: Vec<(String, Arc<dyn PrinterAdapter>)> = {
            let entries = self.entries.lock().expect("registry lock poisoned");
            entries
                .iter()
                .map(|e| (e.name.clone(), Arc::clone(&e.adapter)))
                .collect()
        };

        let now = kiln_types::now();
        let fresh: Vec<(String, crate::contract::PrinterState)> = adapters
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.get_state()))
            .collect();

        let mut entries = self.entries.lock().expect("registry lock poisoned");
        for (name, state) in fresh {
            if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
                entry.cached.connected = state.connected;
                entry.cached.status = state.state;
                entry.cached.tool_temp_actual = state.tool_temp_actual;
                entry.cached.bed_temp_actual = state.bed_temp_actual;
                entry.cached.checked_at = Some(now);
            }
        }
        entries.iter().map(|e| e.cached.clone()).collect()
    }

    /// Cached status of every printer, in registration order. No I/O.
    pub fn get_fleet_status(&self) -> Vec<FleetPrinterStatus> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.iter().map(|e| e.cached.clone()).collect()
    }

    /// Names of printers whose cached status is `Idle`, in registration
    /// order. Non-blocking with respect to backend I/O by construction.
    pub fn get_idle_printers(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .iter()
            .filter(|e| e.cached.status == PrinterStatus::Idle && e.cached.connected)
            .map(|e| e.name.clone())
            .collect()
    }
}

impl Default for PrinterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PrinterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterRegistry")
            .field("printers", &self.list_names())
            .finish()
    }
}
