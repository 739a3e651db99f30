use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use synthetic::AnalogOutput;
use tracing::{debug, info, instrument, warn};
use waveform::{
    ProjectionPlanes, SweepConstants, SynthesisParams, VoltageRange, Waveform, WaveformMode,
    synthesize,
};

use super::{Stage, StageAxes};
use crate::{
    camera::CameraTimingAdapter,
    command_executor::daq::command_sender::DaqCommandSender,
    config::{
        AxisConfig, DaqConfig, ExperimentConfig, GalvoConfig, ImageMode,
        RemoteFocusConfig, WaveformTemplate,
    },
    error::ControllerError,
};

/// Timing knobs shared by the ramp and the sweep planning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalvoTiming {
    pub remote_focus_delay_percent: f64,
    pub sweep: SweepConstants,
}

impl GalvoTiming {
    pub fn new(camera_delay_percent: f64, remote_focus: &RemoteFocusConfig) -> Self {
        Self {
            remote_focus_delay_percent: remote_focus.delay_percent,
            sweep: SweepConstants {
                camera_delay_percent,
                ramp_falling_percent: remote_focus.ramp_falling_percent,
                settle_duration_ms: remote_focus.settle_duration_ms,
            },
        }
    }
}

#[derive(Debug)]
struct GalvoState {
    sweep_times: Option<BTreeMap<String, f64>>,
    waveforms: BTreeMap<String, Waveform>,
    template: WaveformTemplate,
}

/// Single-axis stage that positions a galvo by holding an analog output at
/// the voltage for the requested position.
pub struct GalvoStage {
    name: String,
    axis: String,
    axes: StageAxes,
    output_channel: String,
    board: String,
    volts_per_micron: f64,
    voltage_range: VoltageRange,
    sample_rate: f64,
    trigger_source: String,
    timing: GalvoTiming,
    daq: DaqCommandSender,
    camera: Arc<CameraTimingAdapter>,
    experiment: Arc<RwLock<ExperimentConfig>>,
    state: Mutex<GalvoState>,
}

impl GalvoStage {
    pub fn new(
        config: &GalvoConfig,
        daq_config: &DaqConfig,
        timing: GalvoTiming,
        daq: DaqCommandSender,
        camera: Arc<CameraTimingAdapter>,
        experiment: Arc<RwLock<ExperimentConfig>>,
    ) -> Result<Self, ControllerError> {
        let axes = StageAxes::new(&[AxisConfig {
            name: config.axis.clone(),
            min: config.min,
            max: config.max,
            device_channel: Some(config.output_channel.clone()),
        }]);

        Ok(Self {
            name: format!("galvo-{}", config.axis),
            axis: config.axis.clone(),
            axes,
            output_channel: config.output_channel.clone(),
            board: config.board().to_string(),
            volts_per_micron: config.volts_per_micron,
            voltage_range: VoltageRange::new(config.min_voltage, config.max_voltage)?,
            sample_rate: daq_config.sample_rate,
            trigger_source: daq_config.trigger_source.clone(),
            timing,
            daq,
            camera,
            experiment,
            state: Mutex::new(GalvoState {
                sweep_times: None,
                waveforms: BTreeMap::new(),
                template: WaveformTemplate::new(crate::config::DEFAULT_TEMPLATE, 1, 1),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GalvoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn experiment(&self) -> ExperimentConfig {
        self.experiment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn axis(&self) -> &str {
        &self.axis
    }

    pub fn output_channel(&self) -> &str {
        &self.output_channel
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn set_template(&self, template: &WaveformTemplate) {
        self.lock().template = template.clone();
    }

    pub fn waveforms(&self) -> BTreeMap<String, Waveform> {
        self.lock().waveforms.clone()
    }

    fn volts(&self, microns: f64) -> f64 {
        self.volts_per_micron * microns
    }

    /// Sweep time for `key`. When none has been computed yet it is planned
    /// from the camera readout, the same way the acquisition plans it.
    fn sweep_time_for(
        &self,
        key: &str,
        sweep_times: Option<&BTreeMap<String, f64>>,
    ) -> Result<f64, ControllerError> {
        if let Some(&sweep) = sweep_times.and_then(|times| times.get(key)) {
            return Ok(sweep);
        }

        let mismatch = || ControllerError::DeviceTimingMismatch {
            channel: key.to_string(),
        };
        let readout_time = self.camera.get_readout_time()?;
        let (_, planned) = self.camera.calculate_exposure_sweep_times(readout_time);
        let sweep = planned.get(key).copied().ok_or_else(mismatch)?;
        warn!("{}, planned {sweep} s with {readout_time} s readout", mismatch());
        Ok(sweep)
    }

    fn params_for(
        &self,
        experiment: &ExperimentConfig,
        exposure_time: f64,
        sweep_time: f64,
    ) -> SynthesisParams {
        let ramp = |amplitude: f64, offset: f64, mode: WaveformMode| SynthesisParams {
            mode,
            sample_rate: self.sample_rate,
            exposure_time,
            sweep_time,
            delay_percent: self.timing.remote_focus_delay_percent,
            falling_percent: self.timing.sweep.ramp_falling_percent,
            amplitude,
            offset,
            planes: None,
        };

        match experiment.image_mode {
            ImageMode::ZStack => {
                let (start, end) = (experiment.abs_z_start, experiment.abs_z_end);
                ramp(
                    self.volts(0.5 * (end - start)),
                    self.volts(0.5 * (end + start)),
                    WaveformMode::Ramp,
                )
            }
            ImageMode::ConfocalProjection => {
                let offset_start = self.volts(0.5 * experiment.offset_start);
                let offset_end = if experiment.n_plane > 1 {
                    self.volts(0.5 * experiment.offset_end)
                } else {
                    offset_start
                };
                SynthesisParams {
                    planes: Some(ProjectionPlanes {
                        count: experiment.n_plane,
                        offset_start,
                        offset_end,
                    }),
                    ..ramp(
                        self.volts(0.5 * experiment.scan_range),
                        offset_start,
                        WaveformMode::Projection,
                    )
                }
            }
            ImageMode::Single => {
                let position = match experiment.stage_positions.get(&self.axis) {
                    Some(&position) => position,
                    None => self.axes.get(&self.axis).map_or(0.0, |state| state.position),
                };
                SynthesisParams::dc(self.sample_rate, sweep_time, self.volts(position))
            }
        }
    }

    fn publish(
        &self,
        waveforms: &BTreeMap<String, Waveform>,
        repeat: usize,
    ) -> Result<(), ControllerError> {
        let samples = waveforms
            .values()
            .map(Waveform::sample_count)
            .max()
            .unwrap_or(0);

        self.daq.set_analog_output(
            &self.output_channel,
            AnalogOutput {
                sample_rate: self.sample_rate,
                samples,
                trigger_source: self.trigger_source.clone(),
                repeat,
                waveforms: waveforms.clone(),
            },
        )?;
        Ok(())
    }

    /// Computes the drive waveform of every selected channel for the current
    /// image mode and loads it into the analog output.
    #[instrument(skip_all, fields(stage = %self.name))]
    pub fn calculate_waveform(
        &self,
        exposure_times: &BTreeMap<String, f64>,
        sweep_times: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, Waveform>, ControllerError> {
        let experiment = self.experiment();
        let template = self.lock().template.clone();

        let mut waveforms = BTreeMap::new();
        for (key, channel) in experiment.selected_channels() {
            let exposure = exposure_times
                .get(&key)
                .copied()
                .unwrap_or(channel.exposure_time_ms / 1000.0);
            let sweep = self.sweep_time_for(&key, Some(sweep_times))?;

            let params = self.params_for(&experiment, exposure, sweep);
            let waveform = synthesize(&params, self.voltage_range)?.tile(template.expand);
            debug!(channel = %key, samples = waveform.sample_count(), "Waveform computed");
            waveforms.insert(key, waveform);
        }

        self.publish(&waveforms, template.repeat)?;

        let mut state = self.lock();
        state.sweep_times = Some(sweep_times.clone());
        state.waveforms = waveforms.clone();

        Ok(waveforms)
    }
}

impl Stage for GalvoStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn axes(&self) -> &StageAxes {
        &self.axes
    }

    #[instrument(skip(self, _wait), fields(stage = %self.name))]
    fn move_axis_absolute(
        &self,
        axis: &str,
        position: f64,
        _wait: bool,
    ) -> Result<bool, ControllerError> {
        if let Err(e) = self.axes.check(axis, position) {
            info!("Move rejected: {e}");
            return Ok(false);
        }

        let experiment = self.experiment();
        let (sweep_times, repeat) = {
            let state = self.lock();
            (state.sweep_times.clone(), state.template.repeat)
        };
        let volts = self.volts(position);

        let mut waveforms = BTreeMap::new();
        for (key, _) in experiment.selected_channels() {
            let sweep = self.sweep_time_for(&key, sweep_times.as_ref())?;
            let params = SynthesisParams::dc(self.sample_rate, sweep, volts);
            waveforms.insert(key, synthesize(&params, self.voltage_range)?);
        }

        self.publish(&waveforms, repeat)?;
        self.daq.update_analog_task(&self.board)?;

        self.axes.set_position(axis, position);
        self.lock().waveforms = waveforms;
        Ok(true)
    }

    fn stop(&self) {
        debug!(stage = %self.name, "Galvo holds its last voltage");
    }

    fn zero_axes(&self, axes: &[&str]) -> Result<(), ControllerError> {
        for axis in axes {
            if !self.axes.contains(axis) {
                return Err(ControllerError::UnknownAxis(axis.to_string()));
            }
            self.axes.set_position(axis, 0.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use synthetic::{CameraSettings, SensorMode, SyntheticCamera, SyntheticDaq};
    use utilities::command_executor::CommandExecutor;

    use super::*;
    use crate::command_executor::{
        camera::{CameraHandler, command_sender::CameraCommandSender},
        daq::DaqHandler,
    };

    struct Rig {
        galvo: GalvoStage,
        daq: DaqCommandSender,
        camera: Arc<CameraTimingAdapter>,
        experiment: Arc<RwLock<ExperimentConfig>>,
    }

    fn rig(image_mode: ImageMode) -> Rig {
        rig_with_sensor(image_mode, SensorMode::LightSheet)
    }

    fn rig_with_sensor(image_mode: ImageMode, sensor_mode: SensorMode) -> Rig {
        let executor = CommandExecutor::new(DaqHandler::new("daq", SyntheticDaq::new()));
        let daq = DaqCommandSender::new(executor.sender());
        executor.spawn().unwrap();

        let camera = SyntheticCamera::new(CameraSettings {
            sensor_mode,
            ..CameraSettings::default()
        });
        let executor = CommandExecutor::new(CameraHandler::new("camera", camera));
        let camera_sender = CameraCommandSender::new(executor.sender());
        executor.spawn().unwrap();

        let experiment = Arc::new(RwLock::new(ExperimentConfig {
            image_mode,
            n_plane: 3,
            offset_start: -100.0,
            offset_end: 100.0,
            ..ExperimentConfig::default()
        }));

        let galvo_config = GalvoConfig {
            volts_per_micron: 0.02,
            ..GalvoConfig::default()
        };
        let daq_config = DaqConfig {
            sample_rate: 10_000.0,
            ..DaqConfig::default()
        };
        let timing = GalvoTiming::new(2.0, &RemoteFocusConfig::default());
        let camera = Arc::new(CameraTimingAdapter::new(
            camera_sender,
            timing.sweep,
            Arc::clone(&experiment),
        ));

        let galvo = GalvoStage::new(
            &galvo_config,
            &daq_config,
            timing,
            daq.clone(),
            Arc::clone(&camera),
            Arc::clone(&experiment),
        )
        .unwrap();

        Rig {
            galvo,
            daq,
            camera,
            experiment,
        }
    }

    fn times(value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("channel_1".to_string(), value),
            ("channel_2".to_string(), value),
        ])
    }

    #[test]
    fn z_stack_waveforms_are_clamped_and_published() {
        let rig = rig(ImageMode::ZStack);
        {
            // 0.02 V/um over a 1 mm stack asks for far more than 5 V
            let mut experiment = rig.experiment.write().unwrap();
            experiment.abs_z_end = 1000.0;
        }

        let waveforms = rig
            .galvo
            .calculate_waveform(&times(0.02), &times(0.025))
            .unwrap();

        assert_eq!(waveforms.len(), 2);
        for waveform in waveforms.values() {
            assert_eq!(waveform.sample_count(), 250);
            assert!(waveform.min().unwrap() >= -5.0);
            assert!(waveform.max().unwrap() <= 5.0);
        }

        let output = rig.daq.get_analog_output("PXI6259/ao1").unwrap().unwrap();
        assert_eq!(output.samples, 250);
        assert_eq!(output.trigger_source, "/PXI6259/PFI0");
        assert_eq!(output.waveforms, waveforms);
    }

    #[test]
    fn projection_has_one_segment_per_plane() {
        let rig = rig(ImageMode::ConfocalProjection);
        let waveforms = rig
            .galvo
            .calculate_waveform(&times(0.02), &times(0.025))
            .unwrap();

        assert_eq!(waveforms["channel_1"].sample_count(), 3 * 250);
    }

    #[test]
    fn template_expand_tiles_the_waveform() {
        let rig = rig(ImageMode::ZStack);
        rig.galvo
            .set_template(&WaveformTemplate::new("CVACONPRO", 1, 4));

        let waveforms = rig
            .galvo
            .calculate_waveform(&times(0.02), &times(0.025))
            .unwrap();
        assert_eq!(waveforms["channel_2"].sample_count(), 4 * 250);
    }

    #[test]
    fn move_without_sweep_times_plans_them_from_the_camera() {
        let rig = rig_with_sensor(ImageMode::Single, SensorMode::Normal);
        assert!(rig.galvo.move_axis_absolute("f", 100.0, false).unwrap());

        let readout = rig.camera.get_readout_time().unwrap();
        assert!(readout > 0.0);
        let (_, planned) = rig.camera.calculate_exposure_sweep_times(readout);
        let expected = waveform::sample_count(10_000.0, planned["channel_1"]);

        let waveforms = rig.galvo.waveforms();
        assert_eq!(waveforms["channel_1"].sample_count(), expected);
        assert!(waveforms["channel_1"].values().iter().all(|&v| (v - 2.0).abs() < 1e-12));
        assert_eq!(rig.daq.task_uploads("PXI6259").unwrap(), 1);
        assert_eq!(rig.galvo.report_position().unwrap()["f"], 100.0);
    }

    #[test]
    fn move_reuses_computed_sweep_times() {
        let rig = rig(ImageMode::ZStack);
        rig.galvo
            .calculate_waveform(&times(0.02), &times(0.03))
            .unwrap();
        rig.galvo.move_axis_absolute("f", -10.0, true).unwrap();

        assert_eq!(rig.galvo.waveforms()["channel_1"].sample_count(), 300);
    }

    #[test]
    fn out_of_range_move_leaves_output_untouched() {
        let rig = rig(ImageMode::Single);
        assert!(!rig.galvo.move_axis_absolute("f", 900.0, true).unwrap());
        assert_eq!(rig.daq.task_uploads("PXI6259").unwrap(), 0);
        assert!(rig.daq.get_analog_output("PXI6259/ao1").unwrap().is_none());
    }

    #[test]
    fn voltage_is_clamped_at_the_rail() {
        let rig = rig(ImageMode::Single);
        rig.galvo.move_axis_absolute("f", 400.0, false).unwrap();
        // 400 um * 0.02 V/um = 8 V
        let waveforms = rig.galvo.waveforms();
        assert!(waveforms["channel_1"].values().iter().all(|&v| v == 5.0));
    }
}
