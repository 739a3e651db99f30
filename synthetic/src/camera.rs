use std::{
    io::{Error, ErrorKind, Result},
    str::FromStr,
    time::Duration,
};

use tracing::{debug, info};

use crate::trigger::TriggerInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    Normal,
    /// Rolling shutter synchronised to the light sheet; readout overlaps
    /// the exposure.
    LightSheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binning {
    One = 1,
    Two = 2,
    Four = 4,
}

impl Binning {
    pub fn factor(&self) -> u32 {
        *self as u32
    }
}

impl FromStr for Binning {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1x1" => Ok(Binning::One),
            "2x2" => Ok(Binning::Two),
            "4x4" => Ok(Binning::Four),
            other => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Unsupported binning {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub sensor_columns: u32,
    pub sensor_rows: u32,
    /// Seconds per sensor row.
    pub line_interval: f64,
    pub sensor_mode: SensorMode,
    /// Size of the circular frame buffer frame ids index into.
    pub frame_buffer_size: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            sensor_columns: 2048,
            sensor_rows: 2048,
            line_interval: 0.000_075,
            sensor_mode: SensorMode::Normal,
            frame_buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Roi {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
}

pub struct SyntheticCamera {
    settings: CameraSettings,
    exposure_ms: f64,
    roi: Roi,
    binning: Binning,
}

impl SyntheticCamera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            roi: Roi {
                left: 0,
                top: 0,
                width: settings.sensor_columns,
                height: settings.sensor_rows,
            },
            settings,
            exposure_ms: 10.0,
            binning: Binning::One,
        }
    }

    pub fn set_exposure_time(&mut self, exposure_ms: f64) -> Result<()> {
        if !exposure_ms.is_finite() || exposure_ms <= 0.0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Exposure {exposure_ms} ms must be positive"),
            ));
        }
        self.exposure_ms = exposure_ms;
        Ok(())
    }

    pub fn exposure_time(&self) -> f64 {
        self.exposure_ms
    }

    pub fn set_sensor_mode(&mut self, mode: SensorMode) {
        self.settings.sensor_mode = mode;
    }

    pub fn sensor_mode(&self) -> SensorMode {
        self.settings.sensor_mode
    }

    pub fn set_line_interval(&mut self, line_interval: f64) -> Result<()> {
        if !line_interval.is_finite() || line_interval <= 0.0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Line interval {line_interval} s must be positive"),
            ));
        }
        self.settings.line_interval = line_interval;
        Ok(())
    }

    /// Seconds needed to read one frame out of the sensor.
    pub fn readout_time(&self) -> f64 {
        match self.settings.sensor_mode {
            SensorMode::LightSheet => 0.0,
            SensorMode::Normal => {
                let rows = self.roi.height / self.binning.factor();
                self.settings.line_interval * rows as f64
            }
        }
    }

    pub fn max_frame_rate(&self) -> f64 {
        1.0 / (self.exposure_ms / 1000.0 + self.readout_time())
    }

    /// Centres a `width` x `height` region on the sensor. Both sizes must be
    /// even and fit the sensor.
    pub fn set_roi(&mut self, height: u32, width: u32) -> Result<()> {
        let rows = self.settings.sensor_rows;
        let columns = self.settings.sensor_columns;

        if height == 0 || width == 0 || height > rows || width > columns {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ROI {width}x{height} does not fit the {columns}x{rows} sensor"),
            ));
        }
        if height % 2 == 1 || width % 2 == 1 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ROI {width}x{height} must have even dimensions"),
            ));
        }

        let top = (rows - height) / 2;
        if top % 2 != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ROI {width}x{height} would start on an odd row"),
            ));
        }

        self.roi = Roi {
            left: (columns - width) / 2,
            top,
            width,
            height,
        };
        info!(width, height, top, left = self.roi.left, "ROI set");
        Ok(())
    }

    pub fn set_binning(&mut self, binning: &str) -> Result<()> {
        self.binning = binning.parse()?;
        debug!(binning, "Binning set");
        Ok(())
    }

    pub fn binning(&self) -> Binning {
        self.binning
    }

    /// Image size in pixels as `(width, height)` after binning.
    pub fn image_size(&self) -> (u32, u32) {
        let factor = self.binning.factor();
        (self.roi.width / factor, self.roi.height / factor)
    }

    pub fn frame_stream(&self, triggers: TriggerInput) -> FrameStream {
        FrameStream::new(triggers, self.settings.frame_buffer_size)
    }
}

/// Frames produced by external triggers, identified by their slot in the
/// circular frame buffer.
#[derive(Debug)]
pub struct FrameStream {
    triggers: TriggerInput,
    buffer_size: usize,
    next_slot: usize,
    delivered: u64,
}

impl FrameStream {
    pub fn new(triggers: TriggerInput, buffer_size: usize) -> Self {
        Self {
            triggers,
            buffer_size: buffer_size.max(1),
            next_slot: 0,
            delivered: 0,
        }
    }

    /// Waits up to `timeout` for the first frame, then returns it together
    /// with every frame already waiting.
    pub fn next_frames(&mut self, timeout: Duration) -> Vec<usize> {
        let Some(first) = self.triggers.wait(timeout) else {
            return Vec::new();
        };

        let pending = std::iter::once(first).chain(std::iter::from_fn(|| self.triggers.try_next()));
        let count = pending.count();

        (0..count).map(|_| self.advance()).collect()
    }

    fn advance(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % self.buffer_size;
        self.delivered += 1;
        slot
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{TriggerPulse, trigger_line};

    #[test]
    fn readout_scales_with_active_rows() {
        let mut camera = SyntheticCamera::new(CameraSettings::default());
        let full = camera.readout_time();
        assert!((full - 0.000_075 * 2048.0).abs() < 1e-12);

        camera.set_roi(1024, 1024).unwrap();
        assert!((camera.readout_time() - full / 2.0).abs() < 1e-12);

        camera.set_binning("2x2").unwrap();
        assert!((camera.readout_time() - full / 4.0).abs() < 1e-12);
    }

    #[test]
    fn light_sheet_mode_has_no_readout() {
        let mut camera = SyntheticCamera::new(CameraSettings::default());
        camera.set_sensor_mode(SensorMode::LightSheet);
        camera.set_exposure_time(20.0).unwrap();

        assert_eq!(camera.readout_time(), 0.0);
        assert!((camera.max_frame_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn odd_or_oversized_roi_is_rejected() {
        let mut camera = SyntheticCamera::new(CameraSettings::default());
        assert!(camera.set_roi(1023, 1024).is_err());
        assert!(camera.set_roi(4096, 1024).is_err());
        // (2048 - 1022) / 2 = 513 would start on an odd row
        assert!(camera.set_roi(1022, 1024).is_err());
        assert!(camera.set_roi(512, 2048).is_ok());
        assert_eq!(camera.image_size(), (2048, 512));
    }

    #[test]
    fn unsupported_binning_is_rejected() {
        let mut camera = SyntheticCamera::new(CameraSettings::default());
        assert!(camera.set_binning("3x3").is_err());
        assert_eq!(camera.binning(), Binning::One);
        camera.set_binning("4x4").unwrap();
        assert_eq!(camera.image_size(), (512, 512));
    }

    #[test]
    fn frame_ids_wrap_around_the_buffer() {
        let (output, input) = trigger_line();
        let mut stream = FrameStream::new(input, 4);

        for index in 0..6 {
            output.fire(TriggerPulse {
                index,
                position_um: 0.0,
            });
        }

        let frames = stream.next_frames(Duration::from_millis(10));
        assert_eq!(frames, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(stream.delivered(), 6);
        assert!(stream.next_frames(Duration::from_millis(5)).is_empty());
    }
}
