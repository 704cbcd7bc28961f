//! Electrode addressing and per-device layout descriptions.
//!
//! A chip is one 16-channel amplifier/stimulator IC. Global electrode
//! indices are `chip * 16 + local`; every electrode publishes an `<n>_ac`
//! and an `<n>_dc` series.

use serde::Serialize;

/// Channels handled by one chip.
pub const ELECTRODES_PER_CHIP: usize = 16;

/// Chips addressable in one stimulation event.
pub const NUM_CHIPS: usize = 4;

/// Chip index for a global electrode number.
pub fn chip_of(electrode: usize) -> usize {
    electrode / ELECTRODES_PER_CHIP
}

/// Channel index within the chip for a global electrode number.
pub fn chip_electrode_of(electrode: usize) -> usize {
    electrode % ELECTRODES_PER_CHIP
}

/// Name of the AC or DC series for an electrode, e.g. `"17_ac"`.
pub fn electrode_name(electrode: usize, kind: &str) -> String {
    format!("{electrode}_{kind}")
}

/// Static description of an attached device, sent once on attach and
/// embedded in recording files as the `notes` JSON blob.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProps {
    pub name: &'static str,
    pub can_control_replay: bool,
    pub can_control_sampling: bool,
    pub can_record_to_file: bool,
    pub can_stimulate: bool,
    pub can_sample_dc: bool,
    pub num_electrodes: usize,
    pub num_electrode_rows: usize,
    /// Electrode number at each grid position, row-major; `None` marks an
    /// empty corner of the array.
    pub electrode_map: Vec<Option<usize>>,
    pub electrode_exists: Vec<bool>,
    pub electrode_names: Vec<Option<String>>,
}

impl DeviceProps {
    /// Derive grid-style display names ("column-row", 1-based) from the
    /// electrode map. Positions without an electrode keep `None`.
    pub fn grid_names(num_electrodes: usize, num_rows: usize, map: &[Option<usize>]) -> Vec<Option<String>> {
        let num_cols = num_electrodes / num_rows;
        let mut names = vec![None; num_electrodes];

        for row in 0..num_rows {
            for col in 0..num_cols {
                if let Some(electrode) = map[row * num_cols + col] {
                    names[electrode] = Some(format!("{}", (col + 1) * 10 + (row + 1)));
                }
            }
        }

        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_addressing() {
        assert_eq!(chip_of(0), 0);
        assert_eq!(chip_electrode_of(0), 0);
        assert_eq!(chip_of(17), 1);
        assert_eq!(chip_electrode_of(17), 1);
        assert_eq!(chip_of(63), 3);
        assert_eq!(chip_electrode_of(63), 15);
    }

    #[test]
    fn test_electrode_names() {
        assert_eq!(electrode_name(5, "ac"), "5_ac");
        assert_eq!(electrode_name(5, "dc"), "5_dc");
    }

    #[test]
    fn test_grid_names_skip_missing_positions() {
        // 2x2 grid with one empty corner.
        let map = vec![None, Some(0), Some(1), Some(2)];
        let names = DeviceProps::grid_names(4, 2, &map);
        assert_eq!(names[0], Some("21".to_string()));
        assert_eq!(names[1], Some("12".to_string()));
        assert_eq!(names[2], Some("22".to_string()));
        assert_eq!(names[3], None);
    }
}
