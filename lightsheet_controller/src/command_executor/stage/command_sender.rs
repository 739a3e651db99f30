use std::io;

use synthetic::{ScanConfig, StageState};
use utilities::command_executor::CommandSender;

use super::commands::{StageCommand, StageResponse};
use crate::command_executor::unexpected_response;

/// Blocking client of a stage executor. Meant for worker threads, never for
/// async tasks.
#[derive(Clone)]
pub struct StageCommandSender {
    sender: CommandSender<StageCommand>,
}

impl StageCommandSender {
    pub fn new(sender: CommandSender<StageCommand>) -> Self {
        Self { sender }
    }

    fn send_ok(&self, command: StageCommand) -> io::Result<()> {
        match self.sender.send_command_blocking(command)? {
            StageResponse::Ok => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    fn send_speed(&self, command: StageCommand) -> io::Result<f64> {
        match self.sender.send_command_blocking(command)? {
            StageResponse::Speed(speed) => Ok(speed),
            _ => Err(unexpected_response()),
        }
    }

    pub fn move_absolute(&self, channel: &str, position_um: f64) -> io::Result<()> {
        self.send_ok(StageCommand::Move {
            channel: channel.to_string(),
            position_um,
        })
    }

    pub fn get_state(&self, channel: &str) -> io::Result<StageState> {
        match self
            .sender
            .send_command_blocking(StageCommand::GetState(channel.to_string()))?
        {
            StageResponse::State(state) => Ok(state),
            _ => Err(unexpected_response()),
        }
    }

    pub fn stop(&self) -> io::Result<()> {
        self.send_ok(StageCommand::Stop)
    }

    pub fn set_zero(&self, channel: &str) -> io::Result<()> {
        self.send_ok(StageCommand::SetZero(channel.to_string()))
    }

    pub fn set_speed_percent(&self, percent: f64) -> io::Result<f64> {
        self.send_speed(StageCommand::SetSpeedPercent(percent))
    }

    pub fn set_velocity(&self, speed_mm_s: f64) -> io::Result<f64> {
        self.send_speed(StageCommand::SetVelocity(speed_mm_s))
    }

    pub fn get_speed(&self) -> io::Result<f64> {
        self.send_speed(StageCommand::GetSpeed)
    }

    pub fn scanr(&self, channel: &str, scan: ScanConfig) -> io::Result<()> {
        self.send_ok(StageCommand::Scanr {
            channel: channel.to_string(),
            scan,
        })
    }

    pub fn start_scan(&self, channel: &str) -> io::Result<u64> {
        match self
            .sender
            .send_command_blocking(StageCommand::StartScan(channel.to_string()))?
        {
            StageResponse::Pulses(pulses) => Ok(pulses),
            _ => Err(unexpected_response()),
        }
    }
}
