use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use lightsheet_controller::{
    acquisition::{
        FeatureEngine, FeatureList, RunSummary, TracingFrameWriter,
        features::{ConstantVelocityAcquisition, ScanReport},
    },
    config::{Config, create_default_config, init_config},
    error::ControllerError,
    logging,
    microscope::create_microscope,
};
use tracing::{info, warn};

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Builds the instrument and runs the constant velocity acquisition on it.
/// Device commands block, so this must run off the async runtime.
fn acquire(
    config: &Config,
    engine: &FeatureEngine,
) -> anyhow::Result<(Result<RunSummary, ControllerError>, ScanReport)> {
    let (microscope, mut frames) =
        create_microscope(config).context("Failed to assemble the microscope")?;
    let microscope = Arc::new(microscope);

    let mut acquisition =
        ConstantVelocityAcquisition::new(Arc::clone(&microscope), &config.experiment.scan_axis);
    if config.experiment.save_frames {
        acquisition = acquisition.with_writer(Box::new(TracingFrameWriter::new()));
    }
    let report = acquisition.report();

    let mut features = FeatureList::new();
    features.register(acquisition);

    let result = engine.run(features, &mut frames);
    let report = report.lock().map(|r| r.clone()).unwrap_or_default();
    Ok((result, report))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init().context("Failed to initialise logging")?;

    if should_create_config() {
        create_default_config(None::<PathBuf>).context("Failed to write default configuration")?;
    }

    let (_config_manager, config) = init_config().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;

    let engine = Arc::new(FeatureEngine::default());
    let stop = engine.stop_handle();

    let mut run = tokio::task::spawn_blocking({
        let engine = Arc::clone(&engine);
        move || acquire(&config, &engine)
    });

    let (result, report) = tokio::select! {
        result = &mut run => result.context("Acquisition task failed")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping acquisition");
            stop.request_stop();
            run.await.context("Acquisition task failed")??
        }
    };

    match result {
        Ok(summary) => {
            info!(
                frames = summary.total_frames,
                planes = report.number_z_steps,
                actual_planes = report.actual_number_z_steps,
                actual_step_size_um = report.actual_step_size_um,
                "Acquisition complete"
            );
            Ok(())
        }
        Err(e) if e.is_stop_request() => {
            warn!(frames = engine.counters().total_received(), "Acquisition stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
