//! Constant-velocity acquisition.
//!
//! The scan stage sweeps through the whole stack at a constant speed while
//! its encoder emits one trigger per step. Each trigger starts a galvo sweep
//! and a camera exposure, so frames arrive without per-plane moves. Channels
//! are acquired one full stack after another.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, bail};
use tracing::{debug, error, info, warn};

use crate::{
    acquisition::{
        DataHooks, EndDecision, Feature, FeatureSpec, FrameWriter, MainStatus, NodeKind, NodeSpec,
        RunContext, SignalHooks,
    },
    config::{CONSTANT_VELOCITY_TEMPLATE, DEFAULT_TEMPLATE},
    error::ControllerError,
    microscope::Microscope,
    stage::{ScanningStage, Stage},
};

pub const FEATURE_NAME: &str = "constant_velocity_acquisition";

/// Scan parameters worked out during init, plus what happened while
/// scanning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub number_z_steps: u64,
    pub channels: usize,
    pub sweep_time: f64,
    pub max_speed_mm_s: f64,
    pub min_speed_mm_s: f64,
    pub desired_speed_mm_s: f64,
    pub stage_speed_mm_s: f64,
    pub actual_step_size_um: f64,
    pub actual_number_z_steps: u64,
    pub scans_started: u64,
    /// Run frame totals at which the channel advanced.
    pub channel_switches: Vec<u64>,
    pub signal_cleanups: u32,
    pub data_cleanups: u32,
}

type SharedReport = Arc<Mutex<ScanReport>>;

fn with_report<T>(report: &SharedReport, f: impl FnOnce(&mut ScanReport) -> T) -> T {
    f(&mut report.lock().unwrap_or_else(PoisonError::into_inner))
}

pub struct ConstantVelocityAcquisition {
    microscope: Arc<Microscope>,
    axis: String,
    writer: Option<Box<dyn FrameWriter>>,
    report: SharedReport,
}

impl ConstantVelocityAcquisition {
    pub fn new(microscope: Arc<Microscope>, axis: &str) -> Self {
        Self {
            microscope,
            axis: axis.to_string(),
            writer: None,
            report: SharedReport::default(),
        }
    }

    pub fn with_writer(mut self, writer: Box<dyn FrameWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Handle to the report, readable while and after the feature runs.
    pub fn report(&self) -> Arc<Mutex<ScanReport>> {
        Arc::clone(&self.report)
    }
}

impl Feature for ConstantVelocityAcquisition {
    fn config_table(self) -> FeatureSpec {
        FeatureSpec {
            name: FEATURE_NAME.to_string(),
            signal: Box::new(ScanSignal {
                microscope: self.microscope,
                axis: self.axis,
                stage: None,
                plan: ScanPlan::default(),
                report: Arc::clone(&self.report),
            }),
            data: Box::new(ScanData {
                writer: self.writer,
                report: self.report,
            }),
            node: NodeSpec {
                kind: NodeKind::MultiStep,
                device_related: true,
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ScanPlan {
    start_um: f64,
    stop_um: f64,
    step_um: f64,
    number_z_steps: u64,
    channels: usize,
    desired_speed_mm_s: f64,
}

struct ScanSignal {
    microscope: Arc<Microscope>,
    axis: String,
    stage: Option<Arc<dyn ScanningStage>>,
    plan: ScanPlan,
    report: SharedReport,
}

impl ScanSignal {
    fn stage(&self) -> anyhow::Result<&Arc<dyn ScanningStage>> {
        self.stage
            .as_ref()
            .context("scan stage was not resolved during init")
    }

    fn current_sweep_time(&self) -> anyhow::Result<f64> {
        let readout_time = self.microscope.get_readout_time()?;
        let (_, sweep_times) = self.microscope.calculate_exposure_sweep_times(readout_time);

        let selected = self.microscope.selected_channels();
        let (key, _) = selected
            .get(self.microscope.current_channel())
            .ok_or_else(|| {
                ControllerError::UnknownChannel(self.microscope.current_channel().to_string())
            })?;
        let sweep_time = sweep_times
            .get(key)
            .copied()
            .ok_or_else(|| ControllerError::DeviceTimingMismatch {
                channel: key.clone(),
            })?;
        Ok(sweep_time)
    }

    fn advance_channel(&self, ctx: &RunContext) -> anyhow::Result<usize> {
        let next = (self.microscope.current_channel() + 1) % self.plan.channels;
        self.microscope.set_current_channel(next);
        ctx.counters().set_current_channel(next);

        let total = ctx.counters().total_received();
        with_report(&self.report, |report| report.channel_switches.push(total));
        debug!(channel = next, frames = total, "Advancing channel");

        self.microscope.prepare_next_channel()?;
        Ok(next)
    }
}

impl SignalHooks for ScanSignal {
    fn init(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        let stage = self
            .microscope
            .scanning_stage(&self.axis)
            .ok_or_else(|| ControllerError::UnknownAxis(self.axis.clone()))?;
        self.stage = Some(Arc::clone(&stage));

        let experiment = self.microscope.experiment();
        let start_um = experiment.abs_z_start;
        let stop_um = experiment.abs_z_end;
        let step_um = experiment.step_size;
        if step_um.is_nan() || step_um <= 0.0 {
            bail!("step size must be positive, got {step_um} um");
        }

        let range_um = (stop_um - start_um).abs();
        let number_z_steps = (range_um / step_um + 1e-9).floor() as u64;
        if number_z_steps == 0 {
            bail!("scan range of {range_um} um is shorter than one {step_um} um step");
        }
        debug!(start_um, stop_um, number_z_steps, "Scan range");

        // the scan itself travels to stop_um, so both ends must be reachable
        stage.axes().check(&self.axis, start_um)?;
        stage.axes().check(&self.axis, stop_um)?;

        let max_speed_mm_s = stage.set_speed_percent(100.0)?;
        let min_speed_mm_s = stage.set_speed_percent(0.01)?;
        debug!(axis = %self.axis, max_speed_mm_s, min_speed_mm_s, "Stage speed limits");

        let channels = self.microscope.selected_channels().len();
        if channels == 0 {
            bail!("no channel is selected");
        }
        self.microscope.set_current_channel(0);
        ctx.counters().set_current_channel(0);

        self.microscope
            .configure_template(CONSTANT_VELOCITY_TEMPLATE, 1, number_z_steps as usize);
        self.microscope
            .set_waveform_template(CONSTANT_VELOCITY_TEMPLATE)?;
        self.microscope.prepare_next_channel()?;
        self.microscope
            .set_external_trigger(Some(self.microscope.encoder_trigger_line()))?;

        let sweep_time = self.current_sweep_time()?;
        let desired_speed_mm_s = step_um / 1000.0 / sweep_time;
        let stage_speed_mm_s = stage.set_velocity(&self.axis, desired_speed_mm_s)?;

        // The controller only hits discrete speeds, so the real spacing of
        // the planes differs from the requested step.
        let actual_step_size_um = stage_speed_mm_s * sweep_time * 1000.0;
        let actual_number_z_steps = (range_um / actual_step_size_um + 1e-9).floor() as u64;

        ctx.counters()
            .set_total_expected(channels as u64 * number_z_steps);

        self.plan = ScanPlan {
            start_um,
            stop_um,
            step_um,
            number_z_steps,
            channels,
            desired_speed_mm_s,
        };
        with_report(&self.report, |report| {
            *report = ScanReport {
                number_z_steps,
                channels,
                sweep_time,
                max_speed_mm_s,
                min_speed_mm_s,
                desired_speed_mm_s,
                stage_speed_mm_s,
                actual_step_size_um,
                actual_number_z_steps,
                ..ScanReport::default()
            }
        });

        info!(
            axis = %self.axis,
            number_z_steps,
            channels,
            sweep_time,
            desired_speed_mm_s,
            stage_speed_mm_s,
            actual_step_size_um,
            actual_number_z_steps,
            "Constant velocity scan planned"
        );
        Ok(())
    }

    fn main(&mut self, ctx: &RunContext) -> anyhow::Result<MainStatus> {
        if ctx.stop_requested() {
            return Ok(MainStatus::Complete);
        }

        let stage = self.stage()?;
        let plan = self.plan;

        stage.set_speed_percent(self.microscope.default_speed_percent())?;
        if !stage.move_axis_absolute(&self.axis, plan.start_um, true)? {
            bail!("stage did not reach scan start {} um", plan.start_um);
        }

        stage.set_velocity(&self.axis, plan.desired_speed_mm_s)?;
        stage.scanr(
            &self.axis,
            plan.start_um / 1000.0,
            plan.stop_um / 1000.0,
            plan.step_um / 1000.0,
        )?;
        let pulses = stage.start_scan(&self.axis)?;

        with_report(&self.report, |report| report.scans_started += 1);
        debug!(
            channel = self.microscope.current_channel(),
            pulses, "Scan started"
        );
        Ok(MainStatus::Complete)
    }

    fn end(&mut self, ctx: &RunContext) -> anyhow::Result<EndDecision> {
        if ctx.stop_requested() {
            return Ok(EndDecision::Finish);
        }

        if ctx.counters().received_this_step() < self.plan.number_z_steps {
            return Ok(EndDecision::Pending);
        }

        ctx.counters().finish_step(self.plan.number_z_steps);
        match self.advance_channel(ctx)? {
            0 => Ok(EndDecision::Finish),
            _ => Ok(EndDecision::Repeat),
        }
    }

    fn cleanup(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        let default_speed = self.microscope.default_speed_percent();
        self.microscope.set_current_channel(0);
        ctx.counters().set_current_channel(0);

        let steps: [(&str, Result<(), ControllerError>); 4] = [
            (
                "restore waveform template",
                self.microscope.set_waveform_template(DEFAULT_TEMPLATE),
            ),
            (
                "release external trigger",
                self.microscope.set_external_trigger(None),
            ),
            ("reload channel", self.microscope.prepare_next_channel()),
            (
                "restore stage speed",
                match &self.stage {
                    Some(stage) => stage.set_speed_percent(default_speed).map(|_| ()),
                    None => Ok(()),
                },
            ),
        ];

        with_report(&self.report, |report| report.signal_cleanups += 1);

        let mut first_failure = None;
        for (step, result) in steps {
            if let Err(e) = result {
                error!(step, "Cleanup step failed: {}", e);
                if first_failure.is_none() {
                    first_failure = Some(anyhow::Error::new(e).context(step));
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => {
                debug!("Constant velocity settings restored");
                Ok(())
            }
        }
    }
}

struct ScanData {
    writer: Option<Box<dyn FrameWriter>>,
    report: SharedReport,
}

impl DataHooks for ScanData {
    fn init(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        debug!(
            expected = ctx.counters().total_expected(),
            "Waiting for frames"
        );
        Ok(())
    }

    fn main(&mut self, ctx: &RunContext, frame_ids: &[usize]) -> anyhow::Result<()> {
        let total = ctx.counters().record_frames(frame_ids.len() as u64);
        debug!(received = frame_ids.len(), total, "Frames received");

        if let Some(writer) = self.writer.as_mut() {
            writer.write_frames(frame_ids)?;
        }
        Ok(())
    }

    fn end(&mut self, ctx: &RunContext) -> anyhow::Result<EndDecision> {
        let expected = ctx.counters().total_expected();
        let received = ctx.counters().total_received();
        if received >= expected {
            if received > expected {
                warn!(received, expected, "More frames than planned");
            }
            return Ok(EndDecision::Finish);
        }
        Ok(EndDecision::Pending)
    }

    fn cleanup(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
        with_report(&self.report, |report| report.data_cleanups += 1);
        match self.writer.as_mut() {
            Some(writer) => writer.cleanup(),
            None => Ok(()),
        }
    }
}
