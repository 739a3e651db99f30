use std::io;

use synthetic::SensorMode;
use utilities::command_executor::CommandSender;

use super::commands::{CameraCommand, CameraResponse};
use crate::command_executor::unexpected_response;

#[derive(Clone)]
pub struct CameraCommandSender {
    sender: CommandSender<CameraCommand>,
}

impl CameraCommandSender {
    pub fn new(sender: CommandSender<CameraCommand>) -> Self {
        Self { sender }
    }

    fn send_ok(&self, command: CameraCommand) -> io::Result<()> {
        match self.sender.send_command_blocking(command)? {
            CameraResponse::Ok => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    pub fn set_exposure_time(&self, exposure_ms: f64) -> io::Result<()> {
        self.send_ok(CameraCommand::SetExposure(exposure_ms))
    }

    pub fn get_exposure_time(&self) -> io::Result<f64> {
        match self.sender.send_command_blocking(CameraCommand::GetExposure)? {
            CameraResponse::Exposure(exposure) => Ok(exposure),
            _ => Err(unexpected_response()),
        }
    }

    /// Readout time in seconds and the resulting maximum frame rate.
    pub fn get_readout_time(&self) -> io::Result<(f64, f64)> {
        match self.sender.send_command_blocking(CameraCommand::GetReadoutTime)? {
            CameraResponse::Readout {
                readout_time,
                max_frame_rate,
            } => Ok((readout_time, max_frame_rate)),
            _ => Err(unexpected_response()),
        }
    }

    pub fn set_roi(&self, height: u32, width: u32) -> io::Result<()> {
        self.send_ok(CameraCommand::SetRoi { height, width })
    }

    pub fn set_binning(&self, binning: &str) -> io::Result<()> {
        self.send_ok(CameraCommand::SetBinning(binning.to_string()))
    }

    pub fn set_sensor_mode(&self, mode: SensorMode) -> io::Result<()> {
        self.send_ok(CameraCommand::SetSensorMode(mode))
    }

    pub fn get_image_size(&self) -> io::Result<(u32, u32)> {
        match self.sender.send_command_blocking(CameraCommand::GetImageSize)? {
            CameraResponse::ImageSize { width, height } => Ok((width, height)),
            _ => Err(unexpected_response()),
        }
    }
}
