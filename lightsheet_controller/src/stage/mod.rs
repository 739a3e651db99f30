//! Absolute-move contract shared by every stage backend.
//!
//! Positions are micrometres. A move request is a map from logical axis
//! name to target position; [`StageAxes`] owns the per-axis limits and the
//! mapping from logical axis to device channel.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, info};

use crate::{config::AxisConfig, error::ControllerError};

pub mod galvo;
pub mod motor;

pub use galvo::GalvoStage;
pub use motor::MotorStage;

pub type MoveRequest = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    pub axis: String,
    pub position: f64,
    pub min_limit: f64,
    pub max_limit: f64,
    pub device_channel: String,
}

#[derive(Debug)]
pub struct StageAxes {
    axes: Mutex<BTreeMap<String, AxisState>>,
    limits_enabled: AtomicBool,
}

impl StageAxes {
    pub fn new(configs: &[AxisConfig]) -> Self {
        let axes = configs
            .iter()
            .map(|config| {
                let device_channel = config.device_channel.clone().unwrap_or_else(|| {
                    debug!(axis = %config.name, "Axes mapping not specified, using axis name");
                    config.name.clone()
                });
                let state = AxisState {
                    axis: config.name.clone(),
                    position: 0.0,
                    min_limit: config.min,
                    max_limit: config.max,
                    device_channel,
                };
                (config.name.clone(), state)
            })
            .collect();

        Self {
            axes: Mutex::new(axes),
            limits_enabled: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AxisState>> {
        self.axes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains(&self, axis: &str) -> bool {
        self.lock().contains_key(axis)
    }

    pub fn get(&self, axis: &str) -> Option<AxisState> {
        self.lock().get(axis).cloned()
    }

    pub fn device_channel(&self, axis: &str) -> Result<String, ControllerError> {
        self.lock()
            .get(axis)
            .map(|state| state.device_channel.clone())
            .ok_or_else(|| ControllerError::UnknownAxis(axis.to_string()))
    }

    pub fn limits_enabled(&self) -> bool {
        self.limits_enabled.load(Ordering::Acquire)
    }

    pub fn set_limits_enabled(&self, enabled: bool) {
        self.limits_enabled.store(enabled, Ordering::Release);
    }

    /// Checks one target against the axis limits. NaN and infinities never
    /// pass, even with limits disabled.
    pub fn check(&self, axis: &str, position: f64) -> Result<(), ControllerError> {
        let axes = self.lock();
        let state = axes
            .get(axis)
            .ok_or_else(|| ControllerError::UnknownAxis(axis.to_string()))?;

        let within = state.min_limit <= position && position <= state.max_limit;
        let allowed = position.is_finite() && (within || !self.limits_enabled());

        if allowed {
            Ok(())
        } else {
            Err(ControllerError::OutOfRangeMove {
                axis: axis.to_string(),
                position,
                min: state.min_limit,
                max: state.max_limit,
            })
        }
    }

    /// Keeps the entries of `request` that may be moved to. Axes this stage
    /// does not own are ignored. With `strict`, one rejected axis empties the
    /// whole result.
    pub fn validate(&self, request: &MoveRequest, strict: bool) -> MoveRequest {
        let mut accepted = MoveRequest::new();
        let mut rejected = false;

        for (axis, &position) in request {
            match self.check(axis, position) {
                Ok(()) => {
                    accepted.insert(axis.clone(), position);
                }
                Err(ControllerError::UnknownAxis(_)) => {}
                Err(e) => {
                    info!("{e}");
                    rejected = true;
                }
            }
        }

        if strict && rejected {
            MoveRequest::new()
        } else {
            accepted
        }
    }

    pub fn set_position(&self, axis: &str, position: f64) {
        if let Some(state) = self.lock().get_mut(axis) {
            state.position = position;
        }
    }

    pub fn positions(&self) -> BTreeMap<String, f64> {
        self.lock()
            .iter()
            .map(|(axis, state)| (axis.clone(), state.position))
            .collect()
    }
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn axes(&self) -> &StageAxes;

    fn validate(&self, request: &MoveRequest, strict: bool) -> MoveRequest {
        self.axes().validate(request, strict)
    }

    /// Returns `Ok(false)` when the target is rejected; hardware failures are
    /// errors.
    fn move_axis_absolute(&self, axis: &str, position: f64, wait: bool)
    -> Result<bool, ControllerError>;

    /// Moves every axis of `request` that passes validation.
    fn move_absolute(&self, request: &MoveRequest, wait: bool) -> Result<bool, ControllerError> {
        let accepted = self.validate(request, false);
        if accepted.is_empty() {
            return Ok(false);
        }

        let mut all_moved = true;
        for (axis, position) in accepted {
            all_moved &= self.move_axis_absolute(&axis, position, wait)?;
        }
        Ok(all_moved)
    }

    /// Best-effort halt. Safe to call while another thread is inside
    /// [`Stage::move_axis_absolute`].
    fn stop(&self);

    fn report_position(&self) -> Result<BTreeMap<String, f64>, ControllerError> {
        Ok(self.axes().positions())
    }

    /// Declares the current position of `axes` to be zero. Not subject to
    /// limits.
    fn zero_axes(&self, axes: &[&str]) -> Result<(), ControllerError>;

    fn set_limits_enabled(&self, enabled: bool) {
        self.axes().set_limits_enabled(enabled);
    }
}

/// A stage whose controller can run encoder-triggered constant velocity
/// scans.
pub trait ScanningStage: Stage {
    /// Sets the speed to a percentage of the maximum and returns the speed
    /// the controller settled on, in mm/s.
    fn set_speed_percent(&self, percent: f64) -> Result<f64, ControllerError>;

    fn get_speed(&self) -> Result<f64, ControllerError>;

    /// Requests a scan speed for `axis`; returns the achieved speed in mm/s.
    fn set_velocity(&self, axis: &str, speed_mm_s: f64) -> Result<f64, ControllerError>;

    fn scanr(
        &self,
        axis: &str,
        start_mm: f64,
        end_mm: f64,
        enc_divide_mm: f64,
    ) -> Result<(), ControllerError>;

    /// Runs the configured scan and returns the number of triggers emitted.
    fn start_scan(&self, axis: &str) -> Result<u64, ControllerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> StageAxes {
        StageAxes::new(&[
            AxisConfig::new("x", 0.0, 1000.0, "X"),
            AxisConfig::new("y", -50.0, 50.0, "Y"),
            AxisConfig {
                name: "theta".to_string(),
                min: 0.0,
                max: 360.0,
                device_channel: None,
            },
        ])
    }

    fn request(entries: &[(&str, f64)]) -> MoveRequest {
        entries
            .iter()
            .map(|(axis, position)| (axis.to_string(), *position))
            .collect()
    }

    #[test]
    fn position_above_limit_is_dropped() {
        let validated = axes().validate(&request(&[("x", 1200.0)]), false);
        assert!(validated.is_empty());
        assert!(!validated.contains_key("x"));
    }

    #[test]
    fn non_strict_keeps_the_valid_axes() {
        let validated = axes().validate(&request(&[("x", 1200.0), ("y", 10.0)]), false);
        assert_eq!(validated, request(&[("y", 10.0)]));
    }

    #[test]
    fn strict_rejects_everything_on_any_violation() {
        let validated = axes().validate(&request(&[("x", 500.0), ("y", -51.0)]), true);
        assert!(validated.is_empty());
    }

    #[test]
    fn strict_accepts_when_all_axes_are_valid() {
        let validated = axes().validate(&request(&[("x", 0.0), ("y", 50.0)]), true);
        assert_eq!(validated.len(), 2);
    }

    #[test]
    fn unknown_axes_are_ignored() {
        let validated = axes().validate(&request(&[("q", 1.0), ("x", 1.0)]), true);
        assert_eq!(validated, request(&[("x", 1.0)]));
    }

    #[test]
    fn nan_is_never_accepted() {
        let axes = axes();
        assert!(axes.validate(&request(&[("x", f64::NAN)]), false).is_empty());
        axes.set_limits_enabled(false);
        assert!(axes.validate(&request(&[("x", f64::NAN)]), false).is_empty());
    }

    #[test]
    fn disabled_limits_pass_every_mapped_axis() {
        let axes = axes();
        axes.set_limits_enabled(false);
        let validated = axes.validate(&request(&[("x", 5000.0), ("y", -900.0)]), true);
        assert_eq!(validated.len(), 2);
    }

    #[test]
    fn validated_positions_stay_within_limits() {
        let axes = axes();
        for position in [-1e9, -50.0, -0.1, 0.0, 499.5, 1000.0, 1000.1, 1e9] {
            let validated = axes.validate(&request(&[("x", position), ("y", position)]), false);
            for (axis, value) in validated {
                let state = axes.get(&axis).unwrap();
                assert!(state.min_limit <= value && value <= state.max_limit);
            }
        }
    }

    #[test]
    fn missing_device_channel_falls_back_to_axis_name() {
        assert_eq!(axes().device_channel("theta").unwrap(), "theta");
        assert_eq!(axes().device_channel("x").unwrap(), "X");
        assert!(matches!(
            axes().device_channel("q"),
            Err(ControllerError::UnknownAxis(_))
        ));
    }

    #[test]
    fn out_of_range_check_reports_the_limits() {
        match axes().check("x", 1200.0) {
            Err(ControllerError::OutOfRangeMove { min, max, .. }) => {
                assert_eq!((min, max), (0.0, 1000.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
