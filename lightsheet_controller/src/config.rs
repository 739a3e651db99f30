use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "LIGHTSHEET";
pub const DEFAULT_TEMPLATE: &str = "Default";
pub const CONSTANT_VELOCITY_TEMPLATE: &str = "CVACONPRO";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration: {source}")]
    ReadError { source: ::config::ConfigError },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub name: String,
    /// Lower limit in micrometres.
    pub min: f64,
    /// Upper limit in micrometres.
    pub max: f64,
    /// Controller channel the axis is wired to; the axis name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_channel: Option<String>,
}

impl AxisConfig {
    pub fn new(name: &str, min: f64, max: f64, device_channel: &str) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            device_channel: Some(device_channel.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub axes: Vec<AxisConfig>,
    pub max_speed_mm_s: f64,
    pub velocity_resolution_mm_s: f64,
    /// Speed restored after scans, percent of the maximum.
    pub default_speed_percent: f64,
    pub move_time_limit_s: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            axes: vec![
                AxisConfig::new("x", -10_000.0, 10_000.0, "X"),
                AxisConfig::new("y", -10_000.0, 10_000.0, "Y"),
                AxisConfig::new("z", 0.0, 20_000.0, "Z"),
            ],
            max_speed_mm_s: 5.0,
            velocity_resolution_mm_s: 0.001,
            default_speed_percent: 70.0,
            move_time_limit_s: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalvoConfig {
    pub axis: String,
    /// Analog output as `<board>/<line>`.
    pub output_channel: String,
    pub volts_per_micron: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for GalvoConfig {
    fn default() -> Self {
        Self {
            axis: "f".to_string(),
            output_channel: "PXI6259/ao1".to_string(),
            volts_per_micron: 0.01,
            min_voltage: -5.0,
            max_voltage: 5.0,
            min: -500.0,
            max: 500.0,
        }
    }
}

impl GalvoConfig {
    /// Board part of the output channel.
    pub fn board(&self) -> &str {
        self.output_channel
            .split_once('/')
            .map(|(board, _)| board)
            .unwrap_or(&self.output_channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub sample_rate: f64,
    pub trigger_source: String,
    /// Line the encoder output of the scanning stage is wired to.
    pub external_trigger: String,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            sample_rate: 100_000.0,
            trigger_source: "/PXI6259/PFI0".to_string(),
            external_trigger: "/PXI6259/PFI1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSensorMode {
    Normal,
    LightSheet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub delay_percent: f64,
    /// Seconds per sensor row.
    pub line_interval: f64,
    pub sensor_rows: u32,
    pub sensor_columns: u32,
    pub sensor_mode: CameraSensorMode,
    pub binning: String,
    pub frame_buffer_size: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            delay_percent: 2.0,
            line_interval: 0.000_075,
            sensor_rows: 2048,
            sensor_columns: 2048,
            sensor_mode: CameraSensorMode::LightSheet,
            binning: "1x1".to_string(),
            frame_buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFocusConfig {
    pub delay_percent: f64,
    pub ramp_falling_percent: f64,
    pub settle_duration_ms: f64,
}

impl Default for RemoteFocusConfig {
    fn default() -> Self {
        Self {
            delay_percent: 7.5,
            ramp_falling_percent: 5.0,
            settle_duration_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformTemplate {
    pub name: String,
    pub repeat: usize,
    pub expand: usize,
}

impl WaveformTemplate {
    pub fn new(name: &str, repeat: usize, expand: usize) -> Self {
        Self {
            name: name.to_string(),
            repeat,
            expand,
        }
    }
}

fn default_templates() -> Vec<WaveformTemplate> {
    vec![
        WaveformTemplate::new(DEFAULT_TEMPLATE, 1, 1),
        WaveformTemplate::new(CONSTANT_VELOCITY_TEMPLATE, 1, 1),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub is_selected: bool,
    pub exposure_time_ms: f64,
    pub filter: String,
    pub laser: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageMode {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "z-stack")]
    ZStack,
    #[serde(rename = "confocal-projection")]
    ConfocalProjection,
}

/// Microscope state for one experiment. Positions are in micrometres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub channels: Vec<ChannelConfig>,
    pub image_mode: ImageMode,
    pub abs_z_start: f64,
    pub abs_z_end: f64,
    pub step_size: f64,
    pub scan_axis: String,
    pub stage_positions: BTreeMap<String, f64>,
    pub scan_range: f64,
    pub n_plane: usize,
    pub offset_start: f64,
    pub offset_end: f64,
    pub waveform_template: String,
    pub save_frames: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelConfig {
                    is_selected: true,
                    exposure_time_ms: 20.0,
                    filter: "Empty-Alignment".to_string(),
                    laser: "488nm".to_string(),
                },
                ChannelConfig {
                    is_selected: true,
                    exposure_time_ms: 50.0,
                    filter: "GFP - FF01-515/30-32".to_string(),
                    laser: "562nm".to_string(),
                },
                ChannelConfig {
                    is_selected: false,
                    exposure_time_ms: 100.0,
                    filter: "Empty".to_string(),
                    laser: "642nm".to_string(),
                },
            ],
            image_mode: ImageMode::ZStack,
            abs_z_start: 0.0,
            abs_z_end: 100.0,
            step_size: 10.0,
            scan_axis: "z".to_string(),
            stage_positions: BTreeMap::from([
                ("x".to_string(), 0.0),
                ("y".to_string(), 0.0),
                ("z".to_string(), 0.0),
                ("f".to_string(), 0.0),
            ]),
            scan_range: 200.0,
            n_plane: 1,
            offset_start: 0.0,
            offset_end: 0.0,
            waveform_template: DEFAULT_TEMPLATE.to_string(),
            save_frames: false,
        }
    }
}

impl ExperimentConfig {
    /// Selected channels in acquisition order, keyed `channel_<n>` with `n`
    /// counting every configured channel from 1.
    pub fn selected_channels(&self) -> Vec<(String, &ChannelConfig)> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| channel.is_selected)
            .map(|(index, channel)| (format!("channel_{}", index + 1), channel))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stage: StageConfig,
    pub galvo: GalvoConfig,
    pub daq: DaqConfig,
    pub camera: CameraConfig,
    pub remote_focus: RemoteFocusConfig,
    pub waveform_templates: Vec<WaveformTemplate>,
    pub experiment: ExperimentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stage: StageConfig::default(),
            galvo: GalvoConfig::default(),
            daq: DaqConfig::default(),
            camera: CameraConfig::default(),
            remote_focus: RemoteFocusConfig::default(),
            waveform_templates: default_templates(),
            experiment: ExperimentConfig::default(),
        }
    }
}

impl Config {
    pub fn template(&self, name: &str) -> Option<&WaveformTemplate> {
        self.waveform_templates.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for axis in &self.stage.axes {
            check_range(&format!("stage axis {}", axis.name), axis.min, axis.max)?;
        }
        if !(self.stage.max_speed_mm_s > 0.0 && self.stage.velocity_resolution_mm_s > 0.0) {
            return Err(invalid("stage speeds must be positive"));
        }
        let time_limit = self.stage.move_time_limit_s;
        if !(time_limit.is_finite() && time_limit > 0.0) {
            return Err(invalid(format!(
                "move time limit must be positive, got {time_limit} s"
            )));
        }

        let galvo = &self.galvo;
        check_range(&format!("galvo axis {}", galvo.axis), galvo.min, galvo.max)?;
        check_range("galvo voltage", galvo.min_voltage, galvo.max_voltage)?;
        if galvo.axis.is_empty() {
            return Err(invalid("galvo axis is not mapped"));
        }
        match galvo.output_channel.split_once('/') {
            Some((board, line)) if !board.is_empty() && !line.is_empty() => {}
            _ => {
                return Err(invalid(format!(
                    "galvo output channel {:?} is not of the form <board>/<line>",
                    galvo.output_channel
                )));
            }
        }

        if !(self.daq.sample_rate.is_finite() && self.daq.sample_rate > 0.0) {
            return Err(invalid(format!(
                "sample rate must be positive, got {}",
                self.daq.sample_rate
            )));
        }

        let experiment = &self.experiment;
        if !(experiment.step_size.is_finite() && experiment.step_size > 0.0) {
            return Err(invalid(format!(
                "step size must be positive, got {}",
                experiment.step_size
            )));
        }
        if !experiment.channels.iter().any(|c| c.is_selected) {
            return Err(invalid("experiment has no selected channel"));
        }
        if !self.stage.axes.iter().any(|a| a.name == experiment.scan_axis) {
            return Err(invalid(format!(
                "scan axis {} is not a stage axis",
                experiment.scan_axis
            )));
        }
        if self.template(DEFAULT_TEMPLATE).is_none() {
            return Err(invalid("the Default waveform template is missing"));
        }
        if self.template(&experiment.waveform_template).is_none() {
            return Err(invalid(format!(
                "unknown waveform template {}",
                experiment.waveform_template
            )));
        }

        Ok(())
    }
}

fn check_range(what: &str, min: f64, max: f64) -> Result<(), ConfigError> {
    if min.is_finite() && max.is_finite() && min <= max {
        Ok(())
    } else {
        Err(invalid(format!("{what} has inverted range [{min}, {max}]")))
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: false,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("default_config.toml"))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            options: ConfigOptions::default(),
        }
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    /// Reads the file, applies `LIGHTSHEET__SECTION__KEY` environment
    /// overrides and validates the result.
    pub fn load(&self) -> anyhow::Result<Config> {
        self.load_with_env(None)
    }

    /// Like [`ConfigManager::load`], with the environment replaced by `env`
    /// when given.
    pub fn load_with_env(
        &self,
        env: Option<::config::Map<String, String>>,
    ) -> anyhow::Result<Config> {
        let config_path = &self.options.config_path;

        if !config_path.exists() {
            if self.options.create_if_missing {
                info!(path = %config_path.display(), "Writing default configuration");
                self.save(&Config::default())
                    .context("Failed to save default config")?;
            } else {
                return Err(ConfigError::FileNotFound {
                    path: config_path.clone(),
                }
                .into());
            }
        }

        let layered = ::config::Config::builder()
            .add_source(
                ::config::File::from(config_path.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(true),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| ConfigError::ReadError { source: e })?;

        let config: Config = layered
            .try_deserialize()
            .map_err(|e| ConfigError::ReadError { source: e })?;

        config.validate()?;
        debug!(path = %config_path.display(), "Configuration loaded");

        Ok(config)
    }

    pub fn save(&self, config: &Config) -> anyhow::Result<()> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

pub fn init_config() -> anyhow::Result<(ConfigManager, Config)> {
    let manager = ConfigManager::new();
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn create_default_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<()> {
    let config_path = path
        .map(|p| p.as_ref().to_path_buf())
        .unwrap_or_else(ConfigOptions::default_config_path);

    let manager = ConfigManager::with_options(ConfigOptions {
        config_path,
        create_if_missing: true,
    });
    manager.save(&Config::default())
}
