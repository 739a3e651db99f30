//! Everything an acquisition feature may touch, behind one handle.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::{info, instrument};

use crate::{
    camera::CameraTimingAdapter,
    command_executor::daq::command_sender::DaqCommandSender,
    config::{ChannelConfig, DaqConfig, ExperimentConfig, WaveformTemplate},
    error::ControllerError,
    stage::{GalvoStage, MotorStage, MoveRequest, ScanningStage, Stage},
};

mod builder;

pub use builder::{create_camera, create_daq, create_microscope, create_stage};

pub struct Microscope {
    motor: Arc<MotorStage>,
    galvo: Arc<GalvoStage>,
    daq: DaqCommandSender,
    daq_config: DaqConfig,
    camera: Arc<CameraTimingAdapter>,
    experiment: Arc<RwLock<ExperimentConfig>>,
    templates: Mutex<Vec<WaveformTemplate>>,
    current_channel: AtomicUsize,
    default_speed_percent: f64,
}

/// The pieces a [`Microscope`] is assembled from.
pub struct MicroscopeParts {
    pub motor: Arc<MotorStage>,
    pub galvo: Arc<GalvoStage>,
    pub daq: DaqCommandSender,
    pub daq_config: DaqConfig,
    pub camera: Arc<CameraTimingAdapter>,
    pub experiment: Arc<RwLock<ExperimentConfig>>,
    pub templates: Vec<WaveformTemplate>,
    pub default_speed_percent: f64,
}

impl Microscope {
    pub fn new(parts: MicroscopeParts) -> Self {
        Self {
            motor: parts.motor,
            galvo: parts.galvo,
            daq: parts.daq,
            daq_config: parts.daq_config,
            camera: parts.camera,
            experiment: parts.experiment,
            templates: Mutex::new(parts.templates),
            current_channel: AtomicUsize::new(0),
            default_speed_percent: parts.default_speed_percent,
        }
    }

    pub fn experiment(&self) -> ExperimentConfig {
        self.experiment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_experiment(&self, update: impl FnOnce(&mut ExperimentConfig)) {
        let mut experiment = self.experiment.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut experiment);
    }

    pub fn selected_channels(&self) -> Vec<(String, ChannelConfig)> {
        self.experiment()
            .selected_channels()
            .into_iter()
            .map(|(key, channel)| (key, channel.clone()))
            .collect()
    }

    /// Index into [`Microscope::selected_channels`] of the channel being
    /// acquired.
    pub fn current_channel(&self) -> usize {
        self.current_channel.load(Ordering::Acquire)
    }

    pub fn set_current_channel(&self, index: usize) {
        self.current_channel.store(index, Ordering::Release);
    }

    fn templates(&self) -> std::sync::MutexGuard<'_, Vec<WaveformTemplate>> {
        self.templates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn template(&self, name: &str) -> Option<WaveformTemplate> {
        self.templates().iter().find(|t| t.name == name).cloned()
    }

    pub fn active_template(&self) -> Option<WaveformTemplate> {
        self.template(&self.experiment().waveform_template)
    }

    pub fn set_waveform_template(&self, name: &str) -> Result<(), ControllerError> {
        if self.template(name).is_none() {
            return Err(ControllerError::UnknownTemplate(name.to_string()));
        }
        self.update_experiment(|experiment| experiment.waveform_template = name.to_string());
        Ok(())
    }

    pub fn configure_template(&self, name: &str, repeat: usize, expand: usize) {
        let mut templates = self.templates();
        match templates.iter_mut().find(|t| t.name == name) {
            Some(template) => {
                template.repeat = repeat;
                template.expand = expand;
            }
            None => templates.push(WaveformTemplate::new(name, repeat, expand)),
        }
    }

    /// Loads the current channel: camera exposure, galvo waveforms for the
    /// active template, then the analog task.
    #[instrument(skip(self))]
    pub fn prepare_next_channel(&self) -> Result<(), ControllerError> {
        let selected = self.selected_channels();
        if selected.is_empty() {
            return Err(ControllerError::UnknownChannel(format!(
                "selected channel {}",
                self.current_channel()
            )));
        }
        let (key, channel) = &selected[self.current_channel() % selected.len()];

        self.camera.set_exposure_time(channel.exposure_time_ms)?;

        let template = self
            .active_template()
            .ok_or_else(|| ControllerError::UnknownTemplate(self.experiment().waveform_template))?;
        self.galvo.set_template(&template);

        let readout_time = self.camera.get_readout_time()?;
        let (exposure_times, sweep_times) =
            self.camera.calculate_exposure_sweep_times(readout_time);
        self.galvo.calculate_waveform(&exposure_times, &sweep_times)?;
        self.daq.update_analog_task(self.galvo.board())?;

        info!(
            channel = %key,
            laser = %channel.laser,
            filter = %channel.filter,
            template = %template.name,
            "Channel prepared"
        );
        Ok(())
    }

    pub fn get_readout_time(&self) -> Result<f64, ControllerError> {
        self.camera.get_readout_time()
    }

    pub fn calculate_exposure_sweep_times(
        &self,
        readout_time: f64,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        self.camera.calculate_exposure_sweep_times(readout_time)
    }

    pub fn set_external_trigger(&self, source: Option<&str>) -> Result<(), ControllerError> {
        Ok(self.daq.set_external_trigger(source)?)
    }

    pub fn external_trigger(&self) -> Result<Option<String>, ControllerError> {
        Ok(self.daq.get_external_trigger()?)
    }

    /// Line the scanning stage's encoder output is wired to.
    pub fn encoder_trigger_line(&self) -> &str {
        &self.daq_config.external_trigger
    }

    pub fn default_speed_percent(&self) -> f64 {
        self.default_speed_percent
    }

    pub fn camera(&self) -> &CameraTimingAdapter {
        &self.camera
    }

    pub fn daq(&self) -> &DaqCommandSender {
        &self.daq
    }

    pub fn galvo(&self) -> &Arc<GalvoStage> {
        &self.galvo
    }

    pub fn stages(&self) -> Vec<Arc<dyn Stage>> {
        vec![self.motor.clone(), self.galvo.clone()]
    }

    pub fn stage_for(&self, axis: &str) -> Option<Arc<dyn Stage>> {
        self.stages()
            .into_iter()
            .find(|stage| stage.axes().contains(axis))
    }

    pub fn scanning_stage(&self, axis: &str) -> Option<Arc<dyn ScanningStage>> {
        if self.motor.axes().contains(axis) {
            Some(self.motor.clone())
        } else {
            None
        }
    }

    /// Splits `request` between the stages that own its axes.
    pub fn move_absolute(&self, request: &MoveRequest, wait: bool) -> Result<bool, ControllerError> {
        let mut all_moved = true;
        for stage in self.stages() {
            let own: MoveRequest = request
                .iter()
                .filter(|(axis, _)| stage.axes().contains(axis))
                .map(|(axis, position)| (axis.clone(), *position))
                .collect();
            if !own.is_empty() {
                all_moved &= stage.move_absolute(&own, wait)?;
            }
        }
        Ok(all_moved)
    }

    pub fn report_position(&self) -> Result<BTreeMap<String, f64>, ControllerError> {
        let mut positions = BTreeMap::new();
        for stage in self.stages() {
            positions.extend(stage.report_position()?);
        }
        Ok(positions)
    }

    pub fn stop_stages(&self) {
        for stage in self.stages() {
            stage.stop();
        }
    }
}
