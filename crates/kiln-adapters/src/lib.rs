//! # kiln-adapters: Printer backend adapters for `Kiln`
//!
//! One abstract capability set ([`PrinterAdapter`]) with a concrete
//! implementation per backend protocol:
//!
//! - [`SerialAdapter`] — Marlin/RepRap G-code over USB serial
//! - [`OctoPrintAdapter`] — OctoPrint REST with `X-Api-Key`
//! - [`MoonrakerAdapter`] — Klipper/Moonraker JSON-RPC over WebSocket
//! - [`BambuAdapter`] — Bambu Lab MQTT (TLS :8883) + FTPS (:990)
//! - [`PrusaConnectAdapter`] — PrusaLink/PrusaConnect HTTP poll
//!
//! Every adapter serialises access to its own transport and binds a
//! [`SafetyProfile`] that caps temperatures before any byte reaches the
//! device. Transient unreachability is reported as `connected = false`
//! with [`kiln_types::PrinterStatus::Offline`], never as a panic or an
//! error from `get_state`.
//!
//! The [`PrinterRegistry`] holds the fleet view: stable registration
//! order, cached printer status for non-blocking idle queries, and the
//! record shape consumed by the orchestrator.

mod bambu;
mod contract;
mod error;
mod gcode_text;
mod moonraker;
mod octoprint;
mod profiles;
mod prusaconnect;
mod registry;
mod serial;
pub mod testing;

pub use bambu::BambuAdapter;
pub use contract::{
    FirmwareComponent, FirmwareStatus, JobProgress, PrintResult, PrinterAdapter, PrinterFile,
    PrinterState, UploadResult,
};
pub use error::{AdapterError, AdapterResult};
pub use moonraker::MoonrakerAdapter;
pub use octoprint::OctoPrintAdapter;
pub use profiles::{
    default_profile, get_profile, list_profiles, resolve_profile, BuildVolume, SafetyProfile,
};
pub use prusaconnect::PrusaConnectAdapter;
pub use registry::{FleetPrinterStatus, PrinterRecord, PrinterRegistry, RegistryError};
pub use serial::SerialAdapter;
