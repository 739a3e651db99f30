pub mod constant_velocity;

pub use constant_velocity::{ConstantVelocityAcquisition, ScanReport};
