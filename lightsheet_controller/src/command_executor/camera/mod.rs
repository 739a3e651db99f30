use std::io;

use commands::CameraCommand;
use synthetic::{SensorMode, SyntheticCamera};
use utilities::command_executor::DeviceHandler;

pub mod command_sender;
pub mod commands;

pub struct CameraHandler {
    name: String,
    camera: SyntheticCamera,
}

impl DeviceHandler for CameraHandler {
    type Command = CameraCommand;

    fn name(&self) -> &str {
        &self.name
    }
}

impl CameraHandler {
    pub fn new(name: &str, camera: SyntheticCamera) -> Self {
        Self {
            name: name.to_string(),
            camera,
        }
    }

    pub fn set_exposure_time(&mut self, exposure_ms: f64) -> io::Result<()> {
        self.camera.set_exposure_time(exposure_ms)
    }

    pub fn get_exposure_time(&mut self) -> io::Result<f64> {
        Ok(self.camera.exposure_time())
    }

    pub fn get_readout_time(&mut self) -> io::Result<(f64, f64)> {
        Ok((self.camera.readout_time(), self.camera.max_frame_rate()))
    }

    pub fn set_roi(&mut self, height: u32, width: u32) -> io::Result<()> {
        self.camera.set_roi(height, width)
    }

    pub fn set_binning(&mut self, binning: &str) -> io::Result<()> {
        self.camera.set_binning(binning)
    }

    pub fn set_sensor_mode(&mut self, mode: SensorMode) -> io::Result<()> {
        self.camera.set_sensor_mode(mode);
        Ok(())
    }

    pub fn image_size(&mut self) -> io::Result<(u32, u32)> {
        Ok(self.camera.image_size())
    }
}
