//! Per-model safety profiles: physical limits consulted before any
//! temperature or motion command reaches a device.

use serde::{Deserialize, Serialize};

/// Printable volume in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVolume {
    pub x_mm: u32,
    pub y_mm: u32,
    pub z_mm: u32,
}

/// Physical limits for one printer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyProfile {
    /// Stable identifier, e.g. `"ender3"` or `"bambu-x1c"`.
    pub id: String,
    pub display_name: String,
    /// Hotend ceiling in degrees Celsius.
    pub max_hotend_temp: f64,
    /// Bed ceiling in degrees Celsius.
    pub max_bed_temp: f64,
    /// Maximum commanded feedrate in mm/s.
    pub max_feedrate_mm_s: f64,
    pub build_volume: Option<BuildVolume>,
}

impl SafetyProfile {
    /// Whether a hotend target is within `0..=max_hotend_temp`.
    pub fn hotend_temp_ok(&self, target: f64) -> bool {
        (0.0..=self.max_hotend_temp).contains(&target)
    }

    /// Whether a bed target is within `0..=max_bed_temp`.
    pub fn bed_temp_ok(&self, target: f64) -> bool {
        (0.0..=self.max_bed_temp).contains(&target)
    }
}

fn profile(
    id: &str,
    display_name: &str,
    max_hotend: f64,
    max_bed: f64,
    max_feedrate: f64,
    volume: Option<(u32, u32, u32)>,
) -> SafetyProfile {
    SafetyProfile {
        id: id.to_string(),
        display_name: display_name.to_string(),
        max_hotend_temp: max_hotend,
        max_bed_temp: max_bed,
        max_feedrate_mm_s: max_feedrate,
        build_volume: volume.map(|(x, y, z)| BuildVolume {
            x_mm: x,
            y_mm: y,
            z_mm: z,
        }),
    }
}

/// Conservative generic limits used when no model is configured.
pub fn default_profile() -> SafetyProfile {
    profile("generic", "Generic FDM printer", 300.0, 130.0, 150.0, None)
}

/// Looks up a bundled profile by identifier (case-insensitive).
pub fn get_profile(id: &str) -> Option<SafetyProfile> {
    let id = id.trim().to_ascii_lowercase();
    list_profiles().into_iter().find(|p| p.id == id)
}

/// All bundled model profiles.
pub fn list_profiles() -> Vec<SafetyProfile> {
    vec![
        profile("ender3", "Creality Ender 3", 260.0, 110.0, 180.0, Some((220, 220, 250))),
        profile("prusa-mk3s", "Prusa i3 MK3S+", 300.0, 120.0, 200.0, Some((250, 210, 210))),
        profile("prusa-mk4", "Prusa MK4", 300.0, 120.0, 300.0, Some((250, 210, 220))),
        profile("prusa-mini", "Prusa MINI+", 280.0, 100.0, 200.0, Some((180, 180, 180))),
        profile("voron-350", "Voron 2.4 350", 300.0, 120.0, 400.0, Some((350, 350, 340))),
        profile("bambu-x1c", "Bambu Lab X1 Carbon", 300.0, 120.0, 500.0, Some((256, 256, 256))),
        profile("bambu-p1s", "Bambu Lab P1S", 300.0, 100.0, 500.0, Some((256, 256, 256))),
    ]
}

/// Resolves a model hint to a profile, falling back to generic limits.
pub fn resolve_profile(model: &str) -> SafetyProfile {
    if model.trim().is_empty() {
        return default_profile();
    }
    get_profile(model).unwrap_or_else(default_profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_conservative() {
        let p = default_profile();
        assert!((p.max_hotend_temp - 300.0).abs() < f64::EPSILON);
        assert!((p.max_bed_temp - 130.0).abs() < f64::EPSILON);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(get_profile("ENDER3").is_some());
        assert!(get_profile("  bambu-x1c ").is_some());
        assert!(get_profile("makerbot").is_none());
    }

    #[test]
    fn ceilings_are_inclusive() {
        let p = get_profile("ender3").unwrap();
        assert!(p.hotend_temp_ok(260.0));
        assert!(!p.hotend_temp_ok(260.1));
        assert!(p.bed_temp_ok(0.0));
        assert!(!p.bed_temp_ok(-1.0));
    }

    #[test]
    fn unknown_model_resolves_to_generic() {
        assert_eq!(resolve_profile("mystery-printer").id, "generic");
        assert_eq!(resolve_profile("").id, "generic");
        assert_eq!(resolve_profile("voron-350").id, "voron-350");
    }
}
