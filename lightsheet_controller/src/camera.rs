use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use synthetic::{FrameStream, SensorMode};
use tracing::{debug, instrument};
use waveform::SweepConstants;

use crate::{
    command_executor::camera::command_sender::CameraCommandSender, config::ExperimentConfig,
    error::ControllerError,
};

/// Anything that hands out acquired frame ids.
pub trait FrameSource: Send {
    /// Waits up to `timeout` for frames; an empty result means none arrived.
    fn next_frames(&mut self, timeout: Duration) -> Vec<usize>;
}

impl FrameSource for FrameStream {
    fn next_frames(&mut self, timeout: Duration) -> Vec<usize> {
        FrameStream::next_frames(self, timeout)
    }
}

/// Exposure and readout queries the acquisition planning needs from the
/// camera.
pub struct CameraTimingAdapter {
    camera: CameraCommandSender,
    sweep: SweepConstants,
    experiment: Arc<RwLock<ExperimentConfig>>,
}

impl CameraTimingAdapter {
    pub fn new(
        camera: CameraCommandSender,
        sweep: SweepConstants,
        experiment: Arc<RwLock<ExperimentConfig>>,
    ) -> Self {
        Self {
            camera,
            sweep,
            experiment,
        }
    }

    pub fn sweep_constants(&self) -> &SweepConstants {
        &self.sweep
    }

    /// Seconds needed to read a frame off the sensor.
    pub fn get_readout_time(&self) -> Result<f64, ControllerError> {
        let (readout_time, max_frame_rate) = self.camera.get_readout_time()?;
        debug!(readout_time, max_frame_rate, "Camera readout");
        Ok(readout_time)
    }

    /// Exposure and sweep time, in seconds, of every selected channel.
    #[instrument(skip(self))]
    pub fn calculate_exposure_sweep_times(
        &self,
        readout_time: f64,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let experiment = self.experiment.read().unwrap_or_else(PoisonError::into_inner);

        let mut exposure_times = BTreeMap::new();
        let mut sweep_times = BTreeMap::new();
        for (key, channel) in experiment.selected_channels() {
            let exposure = channel.exposure_time_ms / 1000.0;
            let sweep = waveform::sweep_time(exposure, readout_time, &self.sweep);
            exposure_times.insert(key.clone(), exposure);
            sweep_times.insert(key, sweep);
        }

        (exposure_times, sweep_times)
    }

    pub fn set_exposure_time(&self, exposure_ms: f64) -> Result<(), ControllerError> {
        Ok(self.camera.set_exposure_time(exposure_ms)?)
    }

    pub fn exposure_time(&self) -> Result<f64, ControllerError> {
        Ok(self.camera.get_exposure_time()?)
    }

    pub fn set_roi(&self, height: u32, width: u32) -> Result<(), ControllerError> {
        Ok(self.camera.set_roi(height, width)?)
    }

    pub fn set_binning(&self, binning: &str) -> Result<(), ControllerError> {
        Ok(self.camera.set_binning(binning)?)
    }

    pub fn set_sensor_mode(&self, mode: SensorMode) -> Result<(), ControllerError> {
        Ok(self.camera.set_sensor_mode(mode)?)
    }

    /// Image size after binning, `(width, height)`.
    pub fn image_size(&self) -> Result<(u32, u32), ControllerError> {
        Ok(self.camera.get_image_size()?)
    }
}

#[cfg(test)]
mod tests {
    use synthetic::{CameraSettings, SyntheticCamera};
    use utilities::command_executor::CommandExecutor;

    use super::*;
    use crate::command_executor::camera::CameraHandler;

    fn adapter(sensor_mode: SensorMode) -> CameraTimingAdapter {
        let camera = SyntheticCamera::new(CameraSettings {
            sensor_mode,
            ..CameraSettings::default()
        });
        let executor = CommandExecutor::new(CameraHandler::new("camera", camera));
        let sender = CameraCommandSender::new(executor.sender());
        executor.spawn().unwrap();

        let sweep = SweepConstants {
            camera_delay_percent: 10.0,
            ramp_falling_percent: 15.0,
            settle_duration_ms: 0.0,
        };
        CameraTimingAdapter::new(sender, sweep, Arc::new(RwLock::new(ExperimentConfig::default())))
    }

    #[test]
    fn sweep_times_cover_selected_channels_only() {
        let adapter = adapter(SensorMode::LightSheet);
        let readout = adapter.get_readout_time().unwrap();
        assert_eq!(readout, 0.0);

        let (exposures, sweeps) = adapter.calculate_exposure_sweep_times(readout);
        assert_eq!(exposures.keys().collect::<Vec<_>>(), ["channel_1", "channel_2"]);
        assert!((exposures["channel_1"] - 0.02).abs() < 1e-12);
        assert!((sweeps["channel_1"] - 0.025).abs() < 1e-12);
        assert!((sweeps["channel_2"] - 0.0625).abs() < 1e-12);
    }

    #[test]
    fn readout_lengthens_the_sweep() {
        let adapter = adapter(SensorMode::Normal);
        let readout = adapter.get_readout_time().unwrap();
        assert!(readout > 0.0);

        let (_, sweeps) = adapter.calculate_exposure_sweep_times(readout);
        assert!((sweeps["channel_1"] - (0.025 + readout)).abs() < 1e-12);
    }

    #[test]
    fn camera_settings_round_trip_through_executor() {
        let adapter = adapter(SensorMode::Normal);
        adapter.set_exposure_time(35.0).unwrap();
        adapter.set_roi(1024, 512).unwrap();
        adapter.set_binning("2x2").unwrap();

        assert_eq!(adapter.exposure_time().unwrap(), 35.0);
        assert_eq!(adapter.image_size().unwrap(), (256, 512));
        assert!(adapter.set_binning("8x8").is_err());
        assert!(matches!(
            adapter.set_roi(1023, 512),
            Err(ControllerError::HardwareCommandFailure(_))
        ));
    }
}
