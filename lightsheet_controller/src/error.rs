use std::{fmt, io};

use waveform::WaveformError;

/// Which of the two worker threads a feature hook ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Signal,
    Data,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Signal => write!(f, "signal"),
            Domain::Data => write!(f, "data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    StopRequested,
    HookFailed(String),
    WorkerPanicked,
    /// The other domain failed first.
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StopRequested => write!(f, "stop requested"),
            AbortReason::HookFailed(reason) => write!(f, "{reason}"),
            AbortReason::WorkerPanicked => write!(f, "worker thread panicked"),
            AbortReason::Cancelled => write!(f, "cancelled after a failure elsewhere"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Move of axis {axis} to {position} is outside [{min}, {max}]")]
    OutOfRangeMove {
        axis: String,
        position: f64,
        min: f64,
        max: f64,
    },

    #[error("Sweep time for {channel} is not available")]
    DeviceTimingMismatch { channel: String },

    #[error("Acquisition aborted in {domain} domain of {feature}: {reason}")]
    AcquisitionAborted {
        feature: String,
        domain: Domain,
        reason: AbortReason,
    },

    #[error("Hardware command failed: {0}")]
    HardwareCommandFailure(#[from] io::Error),

    #[error(transparent)]
    Waveform(#[from] WaveformError),

    #[error("Unknown axis {0}")]
    UnknownAxis(String),

    #[error("Unknown channel {0}")]
    UnknownChannel(String),

    #[error("Unknown waveform template {0}")]
    UnknownTemplate(String),
}

impl ControllerError {
    pub fn is_stop_request(&self) -> bool {
        matches!(
            self,
            ControllerError::AcquisitionAborted {
                reason: AbortReason::StopRequested,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_become_hardware_failures() {
        let err: ControllerError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ControllerError::HardwareCommandFailure(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn abort_message_names_feature_and_domain() {
        let err = ControllerError::AcquisitionAborted {
            feature: "constant_velocity".to_string(),
            domain: Domain::Data,
            reason: AbortReason::HookFailed("writer full".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Acquisition aborted in data domain of constant_velocity: writer full"
        );
        assert!(!err.is_stop_request());
    }

    #[test]
    fn out_of_range_message_shows_limits() {
        let err = ControllerError::OutOfRangeMove {
            axis: "x".to_string(),
            position: 1200.0,
            min: 0.0,
            max: 1000.0,
        };
        assert_eq!(err.to_string(), "Move of axis x to 1200 is outside [0, 1000]");
    }
}
