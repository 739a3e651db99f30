use std::{
    io,
    sync::{Arc, RwLock},
    time::Duration,
};

use synthetic::{
    CameraSettings, FrameStream, SensorMode, StageSettings, SyntheticCamera, SyntheticDaq,
    SyntheticStage, TriggerOutput, trigger_line,
};
use tracing::info;
use utilities::command_executor::CommandExecutor;

use super::{Microscope, MicroscopeParts};
use crate::{
    camera::CameraTimingAdapter,
    command_executor::{
        camera::{CameraHandler, command_sender::CameraCommandSender},
        daq::{DaqHandler, command_sender::DaqCommandSender},
        stage::{StageHandler, command_sender::StageCommandSender},
    },
    config::{CameraConfig, CameraSensorMode, Config, StageConfig},
    error::ControllerError,
    stage::{
        GalvoStage, MotorStage, ScanningStage,
        galvo::GalvoTiming,
    },
};

pub fn create_stage(
    config: &StageConfig,
    encoder_output: TriggerOutput,
) -> (CommandExecutor<StageHandler>, StageCommandSender) {
    let channels: Vec<String> = config
        .axes
        .iter()
        .map(|axis| axis.device_channel.clone().unwrap_or_else(|| axis.name.clone()))
        .collect();

    let stage = SyntheticStage::new(
        &channels,
        StageSettings {
            max_speed_mm_s: config.max_speed_mm_s,
            velocity_resolution_mm_s: config.velocity_resolution_mm_s,
        },
    )
    .with_trigger(encoder_output);

    let stage_command_executor = CommandExecutor::new(StageHandler::new("stage", stage));
    let stage_command_sender = StageCommandSender::new(stage_command_executor.sender());

    (stage_command_executor, stage_command_sender)
}

pub fn create_daq() -> (CommandExecutor<DaqHandler>, DaqCommandSender) {
    let daq_command_executor = CommandExecutor::new(DaqHandler::new("daq", SyntheticDaq::new()));
    let daq_command_sender = DaqCommandSender::new(daq_command_executor.sender());

    (daq_command_executor, daq_command_sender)
}

/// Returns the camera executor together with the stream its externally
/// triggered frames arrive on.
pub fn create_camera(
    config: &CameraConfig,
    trigger_input: synthetic::TriggerInput,
) -> (CommandExecutor<CameraHandler>, CameraCommandSender, FrameStream) {
    let sensor_mode = match config.sensor_mode {
        CameraSensorMode::Normal => SensorMode::Normal,
        CameraSensorMode::LightSheet => SensorMode::LightSheet,
    };
    let camera = SyntheticCamera::new(CameraSettings {
        sensor_columns: config.sensor_columns,
        sensor_rows: config.sensor_rows,
        line_interval: config.line_interval,
        sensor_mode,
        frame_buffer_size: config.frame_buffer_size,
    });
    let frames = camera.frame_stream(trigger_input);

    let camera_command_executor = CommandExecutor::new(CameraHandler::new("camera", camera));
    let camera_command_sender = CameraCommandSender::new(camera_command_executor.sender());

    (camera_command_executor, camera_command_sender, frames)
}

/// Builds the simulated instrument described by `config` and starts one
/// executor thread per device.
pub fn create_microscope(config: &Config) -> Result<(Microscope, FrameStream), ControllerError> {
    let (encoder_output, trigger_input) = trigger_line();

    let (stage_command_executor, stage_command_sender) = create_stage(&config.stage, encoder_output);
    let (daq_command_executor, daq_command_sender) = create_daq();
    let (camera_command_executor, camera_command_sender, frames) =
        create_camera(&config.camera, trigger_input);

    stage_command_executor.spawn()?;
    daq_command_executor.spawn()?;
    camera_command_executor.spawn()?;

    let experiment = Arc::new(RwLock::new(config.experiment.clone()));
    let timing = GalvoTiming::new(config.camera.delay_percent, &config.remote_focus);

    let time_limit = Duration::try_from_secs_f64(config.stage.move_time_limit_s).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Invalid move time limit {} s: {e}",
                config.stage.move_time_limit_s
            ),
        )
    })?;
    let motor = Arc::new(MotorStage::new(
        "stage",
        &config.stage.axes,
        stage_command_sender,
        time_limit,
    ));
    motor.set_speed_percent(config.stage.default_speed_percent)?;

    let camera = Arc::new(CameraTimingAdapter::new(
        camera_command_sender,
        timing.sweep,
        Arc::clone(&experiment),
    ));
    camera.set_binning(&config.camera.binning)?;

    let galvo = Arc::new(GalvoStage::new(
        &config.galvo,
        &config.daq,
        timing,
        daq_command_sender.clone(),
        Arc::clone(&camera),
        Arc::clone(&experiment),
    )?);

    info!(
        axes = ?config.stage.axes.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        galvo = %config.galvo.output_channel,
        "Microscope assembled"
    );

    let microscope = Microscope::new(MicroscopeParts {
        motor,
        galvo,
        daq: daq_command_sender,
        daq_config: config.daq.clone(),
        camera,
        experiment,
        templates: config.waveform_templates.clone(),
        default_speed_percent: config.stage.default_speed_percent,
    });

    Ok((microscope, frames))
}
