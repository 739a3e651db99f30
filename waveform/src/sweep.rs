use serde::{Deserialize, Serialize};

/// Timing margins that stretch an exposure into a full sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepConstants {
    /// Camera trigger delay, percent of the exposure time.
    pub camera_delay_percent: f64,
    /// Remote-focus ramp fall, percent of the exposure time.
    pub ramp_falling_percent: f64,
    /// Hold after the fall before the next sweep starts, in milliseconds.
    pub settle_duration_ms: f64,
}

impl Default for SweepConstants {
    fn default() -> Self {
        Self {
            camera_delay_percent: 2.0,
            ramp_falling_percent: 5.0,
            settle_duration_ms: 0.0,
        }
    }
}

/// Sweep duration in seconds for an exposure of `exposure_time` seconds.
///
/// `readout_time` is added as-is; pass 0 for sensors whose readout overlaps
/// the exposure.
pub fn sweep_time(exposure_time: f64, readout_time: f64, constants: &SweepConstants) -> f64 {
    let margins = (constants.camera_delay_percent + constants.ramp_falling_percent) / 100.0;
    exposure_time + exposure_time * margins + readout_time + constants.settle_duration_ms / 1000.0
}
