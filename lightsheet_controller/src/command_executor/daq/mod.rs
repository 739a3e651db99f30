use std::io;

use commands::DaqCommand;
use synthetic::{AnalogOutput, SyntheticDaq};
use utilities::command_executor::DeviceHandler;

pub mod command_sender;
pub mod commands;

pub struct DaqHandler {
    name: String,
    daq: SyntheticDaq,
}

impl DeviceHandler for DaqHandler {
    type Command = DaqCommand;

    fn name(&self) -> &str {
        &self.name
    }
}

impl DaqHandler {
    pub fn new(name: &str, daq: SyntheticDaq) -> Self {
        Self {
            name: name.to_string(),
            daq,
        }
    }

    pub fn set_analog_output(&mut self, channel: &str, output: AnalogOutput) -> io::Result<()> {
        self.daq.set_analog_output(channel, output);
        Ok(())
    }

    pub fn get_analog_output(&mut self, channel: &str) -> io::Result<Option<AnalogOutput>> {
        Ok(self.daq.analog_output(channel).cloned())
    }

    pub fn update_analog_task(&mut self, board: &str) -> io::Result<usize> {
        self.daq.update_analog_task(board)
    }

    pub fn task_uploads(&mut self, board: &str) -> io::Result<u64> {
        Ok(self.daq.task_uploads(board))
    }

    pub fn set_external_trigger(&mut self, source: Option<String>) -> io::Result<()> {
        self.daq.set_external_trigger(source);
        Ok(())
    }

    pub fn get_external_trigger(&mut self) -> io::Result<Option<String>> {
        Ok(self.daq.external_trigger().map(str::to_string))
    }
}
