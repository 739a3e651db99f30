use std::collections::BTreeMap;

use lightsheet_controller::{
    config::{CONSTANT_VELOCITY_TEMPLATE, Config, DEFAULT_TEMPLATE},
    error::ControllerError,
    microscope::{Microscope, create_microscope},
};

fn microscope() -> Microscope {
    let (microscope, _frames) = create_microscope(&Config::default()).unwrap();
    microscope
}

#[test]
fn selected_channels_keep_their_configured_numbers() {
    let microscope = microscope();
    microscope.update_experiment(|experiment| {
        experiment.channels[0].is_selected = false;
        experiment.channels[2].is_selected = true;
    });

    let keys: Vec<String> = microscope
        .selected_channels()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec!["channel_2", "channel_3"]);
}

#[test]
fn preparing_a_channel_loads_exposure_and_uploads_waveforms() {
    let microscope = microscope();
    let board = microscope.galvo().board().to_string();
    let uploads = microscope.daq().task_uploads(&board).unwrap();

    microscope.set_current_channel(1);
    microscope.prepare_next_channel().unwrap();

    assert_eq!(microscope.camera().exposure_time().unwrap(), 50.0);
    assert_eq!(microscope.daq().task_uploads(&board).unwrap(), uploads + 1);

    let waveforms = microscope.galvo().waveforms();
    assert!(waveforms.contains_key("channel_1"));
    assert!(waveforms.contains_key("channel_2"));

    let output = microscope
        .daq()
        .get_analog_output(microscope.galvo().output_channel())
        .unwrap()
        .unwrap();
    assert_eq!(output.waveforms.len(), 2);
}

#[test]
fn unknown_template_is_rejected() {
    let microscope = microscope();

    let err = microscope.set_waveform_template("Sawtooth").unwrap_err();
    assert!(matches!(err, ControllerError::UnknownTemplate(name) if name == "Sawtooth"));
    assert_eq!(microscope.experiment().waveform_template, DEFAULT_TEMPLATE);
}

#[test]
fn configuring_a_template_changes_expand_and_repeat() {
    let microscope = microscope();

    microscope.configure_template(CONSTANT_VELOCITY_TEMPLATE, 1, 12);
    microscope.configure_template("Bidirectional", 2, 3);

    let cva = microscope.template(CONSTANT_VELOCITY_TEMPLATE).unwrap();
    assert_eq!((cva.repeat, cva.expand), (1, 12));
    let added = microscope.template("Bidirectional").unwrap();
    assert_eq!((added.repeat, added.expand), (2, 3));

    microscope.set_waveform_template("Bidirectional").unwrap();
    assert_eq!(microscope.active_template().unwrap().name, "Bidirectional");
}

#[test]
fn moves_are_routed_to_the_stage_owning_each_axis() {
    let microscope = microscope();
    let request = BTreeMap::from([("x".to_string(), 100.0), ("f".to_string(), 50.0)]);

    assert!(microscope.move_absolute(&request, true).unwrap());

    let positions = microscope.report_position().unwrap();
    assert_eq!(positions["x"], 100.0);
    assert_eq!(positions["f"], 50.0);
    assert_eq!(positions["y"], 0.0);
}

#[test]
fn only_the_motor_stage_can_scan() {
    let microscope = microscope();

    assert!(microscope.scanning_stage("z").is_some());
    assert!(microscope.scanning_stage("f").is_none());
    assert!(microscope.stage_for("f").is_some());
    assert!(microscope.stage_for("q").is_none());
}

#[test]
fn external_trigger_can_be_armed_and_released() {
    let microscope = microscope();
    let line = microscope.encoder_trigger_line().to_string();

    microscope.set_external_trigger(Some(&line)).unwrap();
    assert_eq!(microscope.external_trigger().unwrap(), Some(line));

    microscope.set_external_trigger(None).unwrap();
    assert_eq!(microscope.external_trigger().unwrap(), None);
}

#[test]
fn negative_move_time_limit_fails_assembly() {
    let mut config = Config::default();
    config.stage.move_time_limit_s = -1.0;

    assert!(matches!(
        create_microscope(&config),
        Err(ControllerError::HardwareCommandFailure(_))
    ));
}
