use std::io;

use commands::StageCommand;
use synthetic::{ScanConfig, StageState, SyntheticStage};
use utilities::command_executor::DeviceHandler;

pub mod command_sender;
pub mod commands;

pub struct StageHandler {
    name: String,
    stage: SyntheticStage,
}

impl DeviceHandler for StageHandler {
    type Command = StageCommand;

    fn name(&self) -> &str {
        &self.name
    }
}

impl StageHandler {
    pub fn new(name: &str, stage: SyntheticStage) -> Self {
        Self {
            name: name.to_string(),
            stage,
        }
    }

    pub fn move_absolute(&mut self, channel: &str, position_um: f64) -> io::Result<()> {
        self.stage.move_absolute(channel, position_um)
    }

    pub fn get_state(&mut self, channel: &str) -> io::Result<StageState> {
        self.stage.state(channel)
    }

    pub fn stop(&mut self) -> io::Result<()> {
        self.stage.stop();
        Ok(())
    }

    pub fn set_zero(&mut self, channel: &str) -> io::Result<()> {
        self.stage.set_zero(channel)
    }

    pub fn set_speed_percent(&mut self, percent: f64) -> io::Result<f64> {
        self.stage.set_speed_percent(percent)
    }

    pub fn set_velocity(&mut self, speed_mm_s: f64) -> io::Result<f64> {
        self.stage.set_velocity(speed_mm_s)
    }

    pub fn get_speed(&mut self) -> io::Result<f64> {
        Ok(self.stage.speed())
    }

    pub fn scanr(&mut self, channel: &str, scan: ScanConfig) -> io::Result<()> {
        self.stage.scanr(channel, scan)
    }

    pub fn start_scan(&mut self, channel: &str) -> io::Result<u64> {
        self.stage.start_scan(channel)
    }
}
