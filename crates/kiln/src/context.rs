//! The long-lived `Kiln` context: every subsystem wired together once,
//! at startup, and handed around explicitly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_adapters::{
    resolve_profile, AdapterError, AdapterResult, BambuAdapter, MoonrakerAdapter,
    OctoPrintAdapter, PrinterAdapter, PrinterRegistry, PrusaConnectAdapter, SerialAdapter,
};
use kiln_config::{KilnConfig, PrinterBackend};
use kiln_events::EventBus;
use kiln_health::{HealthMonitor, MonitorPolicy};
use kiln_orchestrator::FleetOrchestrator;
use kiln_recovery::RecoveryPlanner;
use kiln_safety::{AuditLog, GateConfig, MaterialTracker, SafetyGate};
use kiln_store::{EventSink, JobRow, JobStore, MemoryStore};
use kiln_types::EventType;

/// Name used when the env-configured printer is auto-registered.
pub const DEFAULT_PRINTER: &str = "default";

/// The assembled coordination layer.
///
/// Construction wires the event bus subscribers (persistence hooks) and
/// builds each subsystem eagerly; nothing here lazily self-initialises.
pub struct Kiln {
    config: KilnConfig,
    registry: Arc<PrinterRegistry>,
    bus: EventBus,
    orchestrator: Arc<FleetOrchestrator>,
    monitor: HealthMonitor,
    recovery: RecoveryPlanner,
    gate: SafetyGate,
    materials: MaterialTracker,
    job_store: Arc<dyn JobStore>,
    started_at: DateTime<Utc>,
}

impl Kiln {
    /// Builds the context with in-memory persistence.
    pub fn new(config: KilnConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_stores(config, store.clone(), store.clone(), store)
    }

    /// Builds the context with injected persistence collaborators.
    pub fn with_stores(
        config: KilnConfig,
        job_store: Arc<dyn JobStore>,
        event_sink: Arc<dyn EventSink>,
        audit_sink: Arc<dyn kiln_store::AuditSink>,
    ) -> Self {
        let registry = Arc::new(PrinterRegistry::new());
        let bus = EventBus::new();

        let orchestrator = Arc::new(FleetOrchestrator::new(Arc::clone(&registry), bus.clone()));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            bus.clone(),
            MonitorPolicy::from(&config.monitor),
        );
        let recovery = RecoveryPlanner::new(config.recovery.max_retries);

        let gate_config = GateConfig {
            confirm_mode: config.safety.confirm_mode,
            auth: config
                .safety
                .auth_enabled
                .then(|| (config.safety.auth_token.clone(), Vec::new())),
        };
        let gate = SafetyGate::new(&gate_config, bus.clone(), AuditLog::with_sink(audit_sink));

        // Persistence hooks: every event is mirrored to the sink, and
        // job lifecycle events refresh the job row. Both best-effort.
        {
            let sink = Arc::clone(&event_sink);
            let jobs = Arc::clone(&job_store);
            let orch = Arc::clone(&orchestrator);
            bus.subscribe(None, move |event| {
                if let Err(e) = sink.append_event(event) {
                    tracing::debug!(error = %e, "event sink write failed");
                }
                let is_job_event = matches!(
                    event.event_type,
                    EventType::JobSubmitted
                        | EventType::JobQueued
                        | EventType::JobStarted
                        | EventType::JobCompleted
                        | EventType::JobFailed
                        | EventType::JobCancelled
                );
                if !is_job_event {
                    return;
                }
                let Some(job_id) = event
                    .data
                    .get("job_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| kiln_types::JobId::parse(s).ok())
                else {
                    return;
                };
                let Some(job) = orch.get_job(job_id) else {
                    return;
                };
                let row = JobRow {
                    id: job.id,
                    file_path: job.file_path,
                    printer_name: job.printer_name,
                    status: job.status,
                    priority: job.priority,
                    attempt: job.attempt,
                    max_attempts: job.max_attempts,
                    submitted_by: job.submitted_by,
                    submitted_at: job.submitted_at,
                    started_at: job.started_at,
                    completed_at: job.completed_at,
                    error: job.error,
                };
                if let Err(e) = jobs.save_job(&row) {
                    tracing::debug!(job = %job_id, error = %e, "job row write failed");
                }
            });
        }

        Self {
            config,
            registry,
            bus,
            orchestrator,
            monitor,
            recovery,
            gate,
            materials: MaterialTracker::new(),
            job_store,
            started_at: kiln_types::now(),
        }
    }

    // -- accessors -------------------------------------------------------

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &FleetOrchestrator {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn recovery(&self) -> &RecoveryPlanner {
        &self.recovery
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn materials(&self) -> &MaterialTracker {
        &self.materials
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    // -- printer plumbing ------------------------------------------------

    /// Constructs a backend adapter from a type tag and connection
    /// parameters, binding the safety profile for `model`.
    pub fn build_adapter(
        backend: PrinterBackend,
        host: &str,
        api_key: Option<&str>,
        serial: Option<&str>,
        model: &str,
    ) -> AdapterResult<Arc<dyn PrinterAdapter>> {
        let profile = resolve_profile(model);
        let adapter: Arc<dyn PrinterAdapter> = match backend {
            PrinterBackend::Octoprint => {
                let key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
                    AdapterError::InvalidArgument(
                        "api_key is required for OctoPrint printers".into(),
                    )
                })?;
                Arc::new(OctoPrintAdapter::new(host, key, profile))
            }
            PrinterBackend::Moonraker => Arc::new(MoonrakerAdapter::new(
                host,
                api_key.filter(|k| !k.is_empty()).map(ToString::to_string),
                profile,
            )),
            PrinterBackend::Bambu => {
                let access_code = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
                    AdapterError::InvalidArgument(
                        "api_key (LAN access code) is required for Bambu printers".into(),
                    )
                })?;
                let serial = serial.filter(|s| !s.is_empty()).ok_or_else(|| {
                    AdapterError::InvalidArgument("serial is required for Bambu printers".into())
                })?;
                Arc::new(BambuAdapter::new(host, access_code, serial, profile)?)
            }
            PrinterBackend::Prusaconnect => Arc::new(PrusaConnectAdapter::new(
                host,
                api_key.filter(|k| !k.is_empty()).map(ToString::to_string),
                model,
            )),
            PrinterBackend::Serial => Arc::new(SerialAdapter::open(host, profile)?),
        };
        Ok(adapter)
    }

    /// Registers the env-configured printer as `"default"` when the
    /// registry is empty and a host is configured.
    pub fn ensure_default_printer(&self) -> bool {
        if !self.registry.is_empty() || self.config.printer.host.is_empty() {
            return !self.registry.is_empty();
        }
        let printer = &self.config.printer;
        match Self::build_adapter(
            printer.printer_type,
            &printer.host,
            Some(printer.api_key.as_str()),
            Some(printer.serial.as_str()),
            &printer.model,
        ) {
            Ok(adapter) => {
                if let Err(e) = self.registry.register(DEFAULT_PRINTER, adapter) {
                    tracing::warn!(error = %e, "default printer registration failed");
                    return false;
                }
                self.registry.refresh_all();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "default printer could not be constructed");
                false
            }
        }
    }

    /// Resolves the target printer for a tool call: an explicit
    /// `printer_name` argument, else the first registered printer,
    /// bootstrapping the default printer when none is registered yet.
    pub fn resolve_printer(
        &self,
        printer_name: Option<&str>,
    ) -> Result<(String, Arc<dyn PrinterAdapter>), String> {
        if let Some(name) = printer_name {
            return self
                .registry
                .get(name)
                .map(|adapter| (name.to_string(), adapter))
                .ok_or_else(|| format!("printer not found: {name:?}"));
        }
        if self.registry.is_empty() {
            self.ensure_default_printer();
        }
        let names = self.registry.list_names();
        let first = names.first().ok_or_else(|| {
            "no printers registered; set KILN_PRINTER_HOST or call register_printer".to_string()
        })?;
        let adapter = self
            .registry
            .get(first)
            .expect("first listed printer resolves");
        Ok((first.clone(), adapter))
    }
}

impl std::fmt::Debug for Kiln {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kiln")
            .field("printers", &self.registry.list_names())
            .field("jobs", &self.orchestrator.job_count())
            .finish_non_exhaustive()
    }
}
