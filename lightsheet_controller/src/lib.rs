pub mod acquisition;
pub mod camera;
pub mod command_executor;
pub mod config;
pub mod error;
pub mod logging;
pub mod microscope;
pub mod stage;
