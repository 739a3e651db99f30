use std::io;

use synthetic::AnalogOutput;
use utilities::command_executor::CommandSender;

use super::commands::{DaqCommand, DaqResponse};
use crate::command_executor::unexpected_response;

#[derive(Clone)]
pub struct DaqCommandSender {
    sender: CommandSender<DaqCommand>,
}

impl DaqCommandSender {
    pub fn new(sender: CommandSender<DaqCommand>) -> Self {
        Self { sender }
    }

    pub fn set_analog_output(&self, channel: &str, output: AnalogOutput) -> io::Result<()> {
        let response = self.sender.send_command_blocking(DaqCommand::SetAnalogOutput {
            channel: channel.to_string(),
            output: Box::new(output),
        })?;

        match response {
            DaqResponse::Ok => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    pub fn get_analog_output(&self, channel: &str) -> io::Result<Option<AnalogOutput>> {
        let response = self
            .sender
            .send_command_blocking(DaqCommand::GetAnalogOutput(channel.to_string()))?;

        match response {
            DaqResponse::AnalogOutput(output) => Ok(output.map(|output| *output)),
            _ => Err(unexpected_response()),
        }
    }

    pub fn update_analog_task(&self, board: &str) -> io::Result<usize> {
        let response = self
            .sender
            .send_command_blocking(DaqCommand::UpdateAnalogTask(board.to_string()))?;

        match response {
            DaqResponse::Written(written) => Ok(written),
            _ => Err(unexpected_response()),
        }
    }

    pub fn task_uploads(&self, board: &str) -> io::Result<u64> {
        let response = self
            .sender
            .send_command_blocking(DaqCommand::TaskUploads(board.to_string()))?;

        match response {
            DaqResponse::Uploads(uploads) => Ok(uploads),
            _ => Err(unexpected_response()),
        }
    }

    pub fn set_external_trigger(&self, source: Option<&str>) -> io::Result<()> {
        let response = self
            .sender
            .send_command_blocking(DaqCommand::SetExternalTrigger(source.map(str::to_string)))?;

        match response {
            DaqResponse::Ok => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    pub fn get_external_trigger(&self) -> io::Result<Option<String>> {
        let response = self
            .sender
            .send_command_blocking(DaqCommand::GetExternalTrigger)?;

        match response {
            DaqResponse::ExternalTrigger(source) => Ok(source),
            _ => Err(unexpected_response()),
        }
    }
}
