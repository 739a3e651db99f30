use std::io;

use synthetic::AnalogOutput;
use utilities::command_executor::Command;

use crate::command_executor::daq::DaqHandler;

#[derive(Debug, Clone)]
pub enum DaqCommand {
    SetAnalogOutput {
        channel: String,
        output: Box<AnalogOutput>,
    },
    GetAnalogOutput(String),
    UpdateAnalogTask(String),
    TaskUploads(String),
    SetExternalTrigger(Option<String>),
    GetExternalTrigger,
}

#[derive(Debug)]
pub enum DaqResponse {
    Ok,
    AnalogOutput(Option<Box<AnalogOutput>>),
    Written(usize),
    Uploads(u64),
    ExternalTrigger(Option<String>),
}

impl Command for DaqCommand {
    type Response = DaqResponse;
    type Handler = DaqHandler;

    fn execute(self, handler: &mut Self::Handler) -> io::Result<Self::Response> {
        match self {
            DaqCommand::SetAnalogOutput { channel, output } => {
                handler.set_analog_output(&channel, *output)?;
                Ok(DaqResponse::Ok)
            }
            DaqCommand::GetAnalogOutput(channel) => {
                let output = handler.get_analog_output(&channel)?;
                Ok(DaqResponse::AnalogOutput(output.map(Box::new)))
            }
            DaqCommand::UpdateAnalogTask(board) => {
                let written = handler.update_analog_task(&board)?;
                Ok(DaqResponse::Written(written))
            }
            DaqCommand::TaskUploads(board) => {
                let uploads = handler.task_uploads(&board)?;
                Ok(DaqResponse::Uploads(uploads))
            }
            DaqCommand::SetExternalTrigger(source) => {
                handler.set_external_trigger(source)?;
                Ok(DaqResponse::Ok)
            }
            DaqCommand::GetExternalTrigger => {
                let source = handler.get_external_trigger()?;
                Ok(DaqResponse::ExternalTrigger(source))
            }
        }
    }
}
