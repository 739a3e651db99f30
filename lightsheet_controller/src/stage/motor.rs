use std::{
    collections::BTreeMap,
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use synthetic::ScanConfig;
use tracing::{debug, error, info, instrument, warn};

use super::{ScanningStage, Stage, StageAxes};
use crate::{
    command_executor::stage::command_sender::StageCommandSender, config::AxisConfig,
    error::ControllerError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stage backend for a motorised controller reached through its command
/// executor.
pub struct MotorStage {
    name: String,
    axes: StageAxes,
    sender: StageCommandSender,
    moving: AtomicBool,
    time_limit: Duration,
}

impl MotorStage {
    pub fn new(
        name: &str,
        axes: &[AxisConfig],
        sender: StageCommandSender,
        time_limit: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            axes: StageAxes::new(axes),
            sender,
            moving: AtomicBool::new(false),
            time_limit,
        }
    }

    fn is_moving(&self) -> bool {
        self.moving.load(Ordering::Acquire)
    }

    /// Polls the controller until the axis settles, a stop is requested or
    /// the time limit runs out. Returns whether the target was reached.
    fn wait_until_done(&self, axis: &str, channel: &str) -> Result<bool, ControllerError> {
        let start_time = Instant::now();

        loop {
            let state = self.sender.get_state(channel)?;
            self.axes.set_position(axis, state.position());

            if !state.is_moving() {
                return Ok(!state.was_stopped());
            }
            if !self.is_moving() {
                debug!(axis, position = state.position(), "Move interrupted");
                return Ok(false);
            }
            if start_time.elapsed() > self.time_limit {
                self.sender.stop()?;
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Axis {axis} did not settle within {:?}", self.time_limit),
                )
                .into());
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Stage for MotorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn axes(&self) -> &StageAxes {
        &self.axes
    }

    #[instrument(skip(self), fields(stage = %self.name))]
    fn move_axis_absolute(
        &self,
        axis: &str,
        position: f64,
        wait: bool,
    ) -> Result<bool, ControllerError> {
        if let Err(e) = self.axes.check(axis, position) {
            info!("Move rejected: {e}");
            return Ok(false);
        }
        let channel = self.axes.device_channel(axis)?;

        self.moving.store(true, Ordering::Release);
        self.sender.move_absolute(&channel, position)?;

        if wait {
            self.wait_until_done(axis, &channel)
        } else {
            self.axes.set_position(axis, position);
            Ok(true)
        }
    }

    fn stop(&self) {
        self.moving.store(false, Ordering::Release);
        if let Err(e) = self.sender.stop() {
            error!(stage = %self.name, "Failed to stop stage: {e}");
        }
    }

    fn report_position(&self) -> Result<BTreeMap<String, f64>, ControllerError> {
        for axis in self.axes.names() {
            let channel = self.axes.device_channel(&axis)?;
            let state = self.sender.get_state(&channel)?;
            self.axes.set_position(&axis, state.position());
        }
        Ok(self.axes.positions())
    }

    fn zero_axes(&self, axes: &[&str]) -> Result<(), ControllerError> {
        for axis in axes {
            let channel = self.axes.device_channel(axis)?;
            self.sender.set_zero(&channel)?;
            self.axes.set_position(axis, 0.0);
        }
        Ok(())
    }
}

impl ScanningStage for MotorStage {
    fn set_speed_percent(&self, percent: f64) -> Result<f64, ControllerError> {
        let speed = self.sender.set_speed_percent(percent)?;
        debug!(stage = %self.name, percent, speed, "Speed set");
        Ok(speed)
    }

    fn get_speed(&self) -> Result<f64, ControllerError> {
        Ok(self.sender.get_speed()?)
    }

    fn set_velocity(&self, axis: &str, speed_mm_s: f64) -> Result<f64, ControllerError> {
        self.axes.device_channel(axis)?;
        let achieved = self.sender.set_velocity(speed_mm_s)?;
        if (achieved - speed_mm_s).abs() > f64::EPSILON {
            warn!(
                axis,
                requested = speed_mm_s,
                achieved,
                "Controller rounded the scan speed"
            );
        }
        Ok(achieved)
    }

    #[instrument(skip(self), fields(stage = %self.name))]
    fn scanr(
        &self,
        axis: &str,
        start_mm: f64,
        end_mm: f64,
        enc_divide_mm: f64,
    ) -> Result<(), ControllerError> {
        let channel = self.axes.device_channel(axis)?;
        for position_mm in [start_mm, end_mm] {
            if let Err(e) = self.axes.check(axis, position_mm * 1000.0) {
                info!("Scan rejected: {e}");
                return Err(e);
            }
        }
        self.sender.scanr(
            &channel,
            ScanConfig {
                start_mm,
                end_mm,
                enc_divide_mm,
            },
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(stage = %self.name))]
    fn start_scan(&self, axis: &str) -> Result<u64, ControllerError> {
        let channel = self.axes.device_channel(axis)?;
        let pulses = self.sender.start_scan(&channel)?;

        let state = self.sender.get_state(&channel)?;
        self.axes.set_position(axis, state.position());
        Ok(pulses)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use synthetic::{StageSettings, SyntheticStage};
    use utilities::command_executor::CommandExecutor;

    use super::*;
    use crate::command_executor::stage::StageHandler;

    fn motor_stage(max_speed_mm_s: f64) -> MotorStage {
        let device = SyntheticStage::new(
            &["X", "Z"],
            StageSettings {
                max_speed_mm_s,
                velocity_resolution_mm_s: 0.001,
            },
        );
        let executor = CommandExecutor::new(StageHandler::new("stage", device));
        let sender = StageCommandSender::new(executor.sender());
        executor.spawn().unwrap();

        MotorStage::new(
            "stage",
            &[
                AxisConfig::new("x", 0.0, 1000.0, "X"),
                AxisConfig::new("z", -5000.0, 5000.0, "Z"),
            ],
            sender,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn blocking_move_reaches_target() {
        let stage = motor_stage(5.0);
        assert!(stage.move_axis_absolute("x", 25.0, true).unwrap());
        assert_eq!(stage.report_position().unwrap()["x"], 25.0);
    }

    #[test]
    fn out_of_range_move_is_refused_without_moving() {
        let stage = motor_stage(5.0);
        assert!(!stage.move_axis_absolute("x", 1200.0, true).unwrap());
        assert_eq!(stage.report_position().unwrap()["x"], 0.0);
    }

    #[test]
    fn move_absolute_moves_only_valid_axes() {
        let stage = motor_stage(5.0);
        let request = BTreeMap::from([("x".to_string(), 2000.0), ("z".to_string(), -10.0)]);

        assert!(stage.move_absolute(&request, true).unwrap());
        let positions = stage.report_position().unwrap();
        assert_eq!(positions["x"], 0.0);
        assert_eq!(positions["z"], -10.0);
    }

    #[test]
    fn stop_interrupts_a_blocking_move() {
        // 0.1 mm/s: 4 mm would take 40 s
        let stage = Arc::new(motor_stage(0.1));

        let mover = {
            let stage = Arc::clone(&stage);
            thread::spawn(move || stage.move_axis_absolute("z", 4000.0, true))
        };

        thread::sleep(Duration::from_millis(50));
        stage.stop();

        let reached = mover.join().unwrap().unwrap();
        assert!(!reached);
        let position = stage.report_position().unwrap()["z"];
        assert!(position > 0.0 && position < 4000.0);
    }

    #[test]
    fn zero_axes_ignores_limits() {
        let stage = motor_stage(5.0);
        stage.move_axis_absolute("z", 15.0, true).unwrap();
        stage.zero_axes(&["z"]).unwrap();
        assert_eq!(stage.report_position().unwrap()["z"], 0.0);
    }

    #[test]
    fn scan_leaves_axis_at_scan_end() {
        let stage = motor_stage(5.0);
        stage.set_velocity("z", 0.1).unwrap();
        stage.scanr("z", 0.0, 0.1, 0.01).unwrap();

        assert_eq!(stage.start_scan("z").unwrap(), 10);
        assert!((stage.report_position().unwrap()["z"] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn scan_past_the_limit_is_refused() {
        let stage = motor_stage(5.0);
        assert!(matches!(
            stage.scanr("z", 0.0, 6.0, 0.5),
            Err(ControllerError::OutOfRangeMove { .. })
        ));
        assert_eq!(stage.report_position().unwrap()["z"], 0.0);
    }

    #[test]
    fn unknown_axis_is_an_error_for_scans() {
        let stage = motor_stage(5.0);
        assert!(matches!(
            stage.scanr("q", 0.0, 1.0, 0.1),
            Err(ControllerError::UnknownAxis(_))
        ));
    }
}
