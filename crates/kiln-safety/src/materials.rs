//! Loaded-material tracking and the model/material compatibility table.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Temperatures validated for a (model, material) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaterialSettings {
    pub hotend_temp_c: f64,
    pub bed_temp_c: f64,
}

/// What an operator reported as loaded on a printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedMaterial {
    pub material_type: String,
    pub color: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

// (model, material) -> validated print temperatures. Models absent from
// the table accept the common trio at generic temperatures.
const VALIDATED: &[(&str, &str, f64, f64)] = &[
    ("ender3", "PLA", 205.0, 60.0),
    ("ender3", "PETG", 235.0, 80.0),
    ("prusa-mk3s", "PLA", 215.0, 60.0),
    ("prusa-mk3s", "PETG", 240.0, 85.0),
    ("prusa-mk3s", "ABS", 255.0, 100.0),
    ("prusa-mk4", "PLA", 215.0, 60.0),
    ("prusa-mk4", "PETG", 240.0, 85.0),
    ("prusa-mk4", "ABS", 255.0, 100.0),
    ("prusa-mini", "PLA", 215.0, 60.0),
    ("prusa-mini", "PETG", 240.0, 80.0),
    ("voron-350", "ABS", 255.0, 105.0),
    ("voron-350", "ASA", 260.0, 105.0),
    ("voron-350", "PLA", 205.0, 60.0),
    ("bambu-x1c", "PLA", 220.0, 55.0),
    ("bambu-x1c", "PETG", 255.0, 70.0),
    ("bambu-x1c", "ABS", 270.0, 90.0),
    ("bambu-x1c", "PC", 280.0, 100.0),
    ("bambu-p1s", "PLA", 220.0, 55.0),
    ("bambu-p1s", "PETG", 255.0, 70.0),
    ("bambu-p1s", "ABS", 270.0, 90.0),
];

/// Validated temperatures for a material on a model, or `None` when the
/// pairing has not been validated.
pub fn material_settings(model: &str, material: &str) -> Option<MaterialSettings> {
    let model = model.trim().to_ascii_lowercase();
    let material = material.trim().to_ascii_uppercase();
    VALIDATED
        .iter()
        .find(|(m, mat, _, _)| *m == model && *mat == material)
        .map(|(_, _, hotend, bed)| MaterialSettings {
            hotend_temp_c: *hotend,
            bed_temp_c: *bed,
        })
}

/// Materials validated for a model, upper-cased.
pub fn validated_materials(model: &str) -> Vec<&'static str> {
    let model = model.trim().to_ascii_lowercase();
    VALIDATED
        .iter()
        .filter(|(m, _, _, _)| *m == model)
        .map(|(_, material, _, _)| *material)
        .collect()
}

/// Per-printer record of what filament is loaded.
#[derive(Default)]
pub struct MaterialTracker {
    loaded: Mutex<HashMap<String, LoadedMaterial>>,
}

impl MaterialTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_material(&self, printer: &str, material_type: &str, color: Option<String>) {
        self.loaded.lock().expect("material lock poisoned").insert(
            printer.to_string(),
            LoadedMaterial {
                material_type: material_type.to_ascii_uppercase(),
                color,
                loaded_at: kiln_types::now(),
            },
        );
    }

    pub fn get_material(&self, printer: &str) -> Option<LoadedMaterial> {
        self.loaded
            .lock()
            .expect("material lock poisoned")
            .get(printer)
            .cloned()
    }

    pub fn clear_material(&self, printer: &str) -> bool {
        self.loaded
            .lock()
            .expect("material lock poisoned")
            .remove(printer)
            .is_some()
    }

    /// Case-insensitive mismatch check. `None` when the types match or
    /// nothing is recorded as loaded.
    pub fn check_match(&self, printer: &str, expected: &str) -> Option<String> {
        let loaded = self.get_material(printer)?;
        if loaded.material_type.eq_ignore_ascii_case(expected.trim()) {
            None
        } else {
            Some(format!(
                "Printer {printer:?} has {} loaded but the job expects {}",
                loaded.material_type,
                expected.trim().to_ascii_uppercase()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_lookup_is_case_insensitive() {
        assert!(material_settings("ENDER3", "pla").is_some());
        assert!(material_settings("ender3", "ABS").is_none());
        assert!(material_settings("unknown-model", "PLA").is_none());
    }

    #[test]
    fn validated_list_per_model() {
        let materials = validated_materials("voron-350");
        assert!(materials.contains(&"ABS"));
        assert!(materials.contains(&"ASA"));
        assert!(validated_materials("nothing").is_empty());
    }

    #[test]
    fn tracker_match_semantics() {
        let tracker = MaterialTracker::new();
        // Nothing loaded: no mismatch reported.
        assert!(tracker.check_match("P1", "PLA").is_none());

        tracker.set_material("P1", "pla", Some("galaxy black".into()));
        assert!(tracker.check_match("P1", "PLA").is_none());
        assert!(tracker.check_match("P1", "pla").is_none());

        let mismatch = tracker.check_match("P1", "PETG").unwrap();
        assert!(mismatch.contains("PLA"));
        assert!(mismatch.contains("PETG"));

        assert!(tracker.clear_material("P1"));
        assert!(!tracker.clear_material("P1"));
        assert!(tracker.check_match("P1", "PETG").is_none());
    }
}
