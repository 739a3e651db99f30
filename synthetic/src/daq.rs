use std::{
    collections::BTreeMap,
    io::{Error, ErrorKind, Result},
};

use tracing::{debug, info};
use waveform::Waveform;

/// What one analog output channel is currently loaded with.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogOutput {
    pub sample_rate: f64,
    pub samples: usize,
    pub trigger_source: String,
    pub repeat: usize,
    /// Waveform per imaging channel, keyed `channel_<n>`.
    pub waveforms: BTreeMap<String, Waveform>,
}

/// Analog-output board. Output channels are named `<board>/<line>`.
#[derive(Debug, Default)]
pub struct SyntheticDaq {
    outputs: BTreeMap<String, AnalogOutput>,
    external_trigger: Option<String>,
    uploads: BTreeMap<String, u64>,
}

impl SyntheticDaq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_analog_output(&mut self, channel: &str, output: AnalogOutput) {
        debug!(channel, samples = output.samples, "Analog output loaded");
        self.outputs.insert(channel.to_string(), output);
    }

    pub fn analog_output(&self, channel: &str) -> Option<&AnalogOutput> {
        self.outputs.get(channel)
    }

    /// Writes every output that belongs to `board` to the hardware task.
    /// Returns how many outputs were written.
    pub fn update_analog_task(&mut self, board: &str) -> Result<usize> {
        let prefix = format!("{board}/");
        let written = self
            .outputs
            .keys()
            .filter(|channel| channel.starts_with(&prefix))
            .count();

        if written == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("No analog outputs configured on board {board}"),
            ));
        }

        *self.uploads.entry(board.to_string()).or_default() += 1;
        debug!(board, written, "Analog task updated");
        Ok(written)
    }

    pub fn task_uploads(&self, board: &str) -> u64 {
        self.uploads.get(board).copied().unwrap_or(0)
    }

    pub fn set_external_trigger(&mut self, source: Option<String>) {
        match &source {
            Some(line) => info!(line = %line, "External trigger armed"),
            None => info!("External trigger cleared"),
        }
        self.external_trigger = source;
    }

    pub fn external_trigger(&self) -> Option<&str> {
        self.external_trigger.as_deref()
    }
}
