//! Simulated light-sheet hardware.
//!
//! The devices here stand in for the vendor drivers: a motorised stage with
//! an encoder that can fire camera triggers, an analog-output board and a
//! camera. The stage and the camera are wired together through a
//! [`trigger_line`], the same way the physical encoder output is cabled to
//! the camera's external trigger input.

pub mod camera;
pub mod daq;
pub mod stage;
pub mod state;
pub mod trigger;

pub use camera::{Binning, CameraSettings, FrameStream, SensorMode, SyntheticCamera};
pub use daq::{AnalogOutput, SyntheticDaq};
pub use stage::{ScanConfig, StageSettings, SyntheticStage};
pub use state::{MotionStatus, StageState};
pub use trigger::{TriggerInput, TriggerOutput, TriggerPulse, trigger_line};
