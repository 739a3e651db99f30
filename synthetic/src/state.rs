use bitflags::bitflags;

bitflags!(
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MotionStatus: u8 {
        const ENABLED = 0b00000001;
        const RUNNING = 0b00000010;
        const COMMAND_COMPLETE = 0b00000100;
        const STOPPED = 0b00001000;
        const SCAN_ARMED = 0b00010000;
        const ZEROED = 0b00100000;
    }
);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageState {
    motion_status: MotionStatus,
    position_um: f64,
}

impl StageState {
    pub fn new(motion_status: MotionStatus, position_um: f64) -> Self {
        Self {
            motion_status,
            position_um,
        }
    }

    pub fn motion_status(&self) -> MotionStatus {
        self.motion_status
    }

    pub fn position(&self) -> f64 {
        self.position_um
    }

    pub fn is_moving(&self) -> bool {
        self.motion_status.contains(MotionStatus::RUNNING)
    }

    pub fn was_stopped(&self) -> bool {
        self.motion_status.contains(MotionStatus::STOPPED)
    }
}
