use std::io;

use synthetic::{ScanConfig, StageState};
use utilities::command_executor::Command;

use crate::command_executor::stage::StageHandler;

#[derive(Debug, Clone)]
pub enum StageCommand {
    Move { channel: String, position_um: f64 },
    GetState(String),
    Stop,
    SetZero(String),
    SetSpeedPercent(f64),
    SetVelocity(f64),
    GetSpeed,
    Scanr { channel: String, scan: ScanConfig },
    StartScan(String),
}

#[derive(Debug)]
pub enum StageResponse {
    Ok,
    State(StageState),
    Speed(f64),
    Pulses(u64),
}

impl Command for StageCommand {
    type Response = StageResponse;
    type Handler = StageHandler;

    fn execute(self, handler: &mut Self::Handler) -> io::Result<Self::Response> {
        match self {
            StageCommand::Move {
                channel,
                position_um,
            } => {
                handler.move_absolute(&channel, position_um)?;
                Ok(StageResponse::Ok)
            }
            StageCommand::GetState(channel) => {
                let state = handler.get_state(&channel)?;
                Ok(StageResponse::State(state))
            }
            StageCommand::Stop => {
                handler.stop()?;
                Ok(StageResponse::Ok)
            }
            StageCommand::SetZero(channel) => {
                handler.set_zero(&channel)?;
                Ok(StageResponse::Ok)
            }
            StageCommand::SetSpeedPercent(percent) => {
                let speed = handler.set_speed_percent(percent)?;
                Ok(StageResponse::Speed(speed))
            }
            StageCommand::SetVelocity(speed) => {
                let speed = handler.set_velocity(speed)?;
                Ok(StageResponse::Speed(speed))
            }
            StageCommand::GetSpeed => {
                let speed = handler.get_speed()?;
                Ok(StageResponse::Speed(speed))
            }
            StageCommand::Scanr { channel, scan } => {
                handler.scanr(&channel, scan)?;
                Ok(StageResponse::Ok)
            }
            StageCommand::StartScan(channel) => {
                let pulses = handler.start_scan(&channel)?;
                Ok(StageResponse::Pulses(pulses))
            }
        }
    }
}
