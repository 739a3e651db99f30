//! Analog drive signals for galvo and remote-focus axes.
//!
//! Every waveform leaves this crate clamped to the voltage range of the
//! output it is meant for. Out-of-range requests are a configuration
//! problem, so they are flattened to the rail instead of failing the run.

use serde::{Deserialize, Serialize};

pub mod ramp;
pub mod sweep;

pub use ramp::{dc_value, projection, remote_focus_ramp};
pub use sweep::{SweepConstants, sweep_time};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WaveformError {
    #[error("Sample rate must be a positive number, got {0}")]
    InvalidSampleRate(f64),

    #[error("Sweep time must be a positive number, got {0}")]
    InvalidSweepTime(f64),

    #[error("Exposure time must be a non-negative number, got {0}")]
    InvalidExposureTime(f64),

    #[error("{name} must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },

    #[error("Voltage range is inverted: min {min} > max {max}")]
    InvertedRange { min: f64, max: f64 },

    #[error("Projection needs at least one plane")]
    NoPlanes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformMode {
    Dc,
    Ramp,
    Projection,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    min: f64,
    max: f64,
}

impl VoltageRange {
    pub fn new(min: f64, max: f64) -> Result<Self, WaveformError> {
        finite("min_voltage", min)?;
        finite("max_voltage", max)?;
        if min > max {
            return Err(WaveformError::InvertedRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Segment layout of a multi-plane projection sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionPlanes {
    pub count: usize,
    pub offset_start: f64,
    pub offset_end: f64,
}

impl ProjectionPlanes {
    /// Offset of each segment, linearly spaced from start to end.
    pub fn offsets(&self) -> Vec<f64> {
        if self.count <= 1 {
            return vec![self.offset_start];
        }
        let step = (self.offset_end - self.offset_start) / (self.count - 1) as f64;
        (0..self.count)
            .map(|i| self.offset_start + step * i as f64)
            .collect()
    }
}

/// Inputs to [`synthesize`]. Times are in seconds, delay and fall in percent
/// of the exposure time, amplitude and offsets in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    pub mode: WaveformMode,
    pub sample_rate: f64,
    pub exposure_time: f64,
    pub sweep_time: f64,
    pub delay_percent: f64,
    pub falling_percent: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub planes: Option<ProjectionPlanes>,
}

impl SynthesisParams {
    pub fn dc(sample_rate: f64, sweep_time: f64, amplitude: f64) -> Self {
        Self {
            mode: WaveformMode::Dc,
            sample_rate,
            exposure_time: 0.0,
            sweep_time,
            delay_percent: 0.0,
            falling_percent: 0.0,
            amplitude,
            offset: 0.0,
            planes: None,
        }
    }

    fn check(&self) -> Result<(), WaveformError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(WaveformError::InvalidSampleRate(self.sample_rate));
        }
        if !(self.sweep_time.is_finite() && self.sweep_time > 0.0) {
            return Err(WaveformError::InvalidSweepTime(self.sweep_time));
        }
        if !(self.exposure_time.is_finite() && self.exposure_time >= 0.0) {
            return Err(WaveformError::InvalidExposureTime(self.exposure_time));
        }
        finite("delay_percent", self.delay_percent)?;
        finite("falling_percent", self.falling_percent)?;
        finite("amplitude", self.amplitude)?;
        finite("offset", self.offset)?;
        if let Some(planes) = &self.planes {
            finite("offset_start", planes.offset_start)?;
            finite("offset_end", planes.offset_end)?;
        }
        Ok(())
    }
}

/// A finite sample sequence for one analog output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    sample_rate: f64,
    values: Vec<f64>,
}

impl Waveform {
    pub fn new(sample_rate: f64, values: Vec<f64>) -> Self {
        Self {
            sample_rate,
            values,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn duration(&self) -> f64 {
        self.values.len() as f64 / self.sample_rate
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn clamp(mut self, range: VoltageRange) -> Self {
        for value in &mut self.values {
            *value = value.clamp(range.min, range.max);
        }
        self
    }

    /// Concatenates `count` copies of the waveform back to back.
    pub fn tile(&self, count: usize) -> Self {
        Self {
            sample_rate: self.sample_rate,
            values: self.values.repeat(count.max(1)),
        }
    }

    pub(crate) fn concat(sample_rate: f64, segments: Vec<Waveform>) -> Self {
        let values = segments.into_iter().flat_map(|w| w.values).collect();
        Self {
            sample_rate,
            values,
        }
    }
}

pub fn sample_count(sample_rate: f64, sweep_time: f64) -> usize {
    (sample_rate * sweep_time).round() as usize
}

/// Builds the waveform described by `params` and clamps it to `range`.
pub fn synthesize(params: &SynthesisParams, range: VoltageRange) -> Result<Waveform, WaveformError> {
    params.check()?;

    let waveform = match params.mode {
        WaveformMode::Dc => dc_value(
            params.sample_rate,
            params.sweep_time,
            params.amplitude + params.offset,
        ),
        WaveformMode::Ramp => remote_focus_ramp(params, params.offset),
        WaveformMode::Projection => {
            let planes = params.planes.unwrap_or(ProjectionPlanes {
                count: 1,
                offset_start: params.offset,
                offset_end: params.offset,
            });
            if planes.count == 0 {
                return Err(WaveformError::NoPlanes);
            }
            projection(params, &planes)
        }
    };

    Ok(waveform.clamp(range))
}

fn finite(name: &'static str, value: f64) -> Result<(), WaveformError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(WaveformError::NonFinite { name, value })
    }
}
