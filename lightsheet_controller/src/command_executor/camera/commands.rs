use std::io;

use synthetic::SensorMode;
use utilities::command_executor::Command;

use crate::command_executor::camera::CameraHandler;

#[derive(Debug, Clone)]
pub enum CameraCommand {
    SetExposure(f64),
    GetExposure,
    GetReadoutTime,
    SetRoi { height: u32, width: u32 },
    SetBinning(String),
    SetSensorMode(SensorMode),
    GetImageSize,
}

#[derive(Debug)]
pub enum CameraResponse {
    Ok,
    Exposure(f64),
    Readout { readout_time: f64, max_frame_rate: f64 },
    ImageSize { width: u32, height: u32 },
}

impl Command for CameraCommand {
    type Response = CameraResponse;
    type Handler = CameraHandler;

    fn execute(self, handler: &mut Self::Handler) -> io::Result<Self::Response> {
        match self {
            CameraCommand::SetExposure(exposure_ms) => {
                handler.set_exposure_time(exposure_ms)?;
                Ok(CameraResponse::Ok)
            }
            CameraCommand::GetExposure => {
                let exposure = handler.get_exposure_time()?;
                Ok(CameraResponse::Exposure(exposure))
            }
            CameraCommand::GetReadoutTime => {
                let (readout_time, max_frame_rate) = handler.get_readout_time()?;
                Ok(CameraResponse::Readout {
                    readout_time,
                    max_frame_rate,
                })
            }
            CameraCommand::SetRoi { height, width } => {
                handler.set_roi(height, width)?;
                Ok(CameraResponse::Ok)
            }
            CameraCommand::SetBinning(binning) => {
                handler.set_binning(&binning)?;
                Ok(CameraResponse::Ok)
            }
            CameraCommand::SetSensorMode(mode) => {
                handler.set_sensor_mode(mode)?;
                Ok(CameraResponse::Ok)
            }
            CameraCommand::GetImageSize => {
                let (width, height) = handler.image_size()?;
                Ok(CameraResponse::ImageSize { width, height })
            }
        }
    }
}
