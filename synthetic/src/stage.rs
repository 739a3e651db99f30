use std::{
    collections::BTreeMap,
    io::{Error, ErrorKind, Result},
    time::Instant,
};

use tracing::{debug, trace};

use crate::{
    state::{MotionStatus, StageState},
    trigger::{TriggerOutput, TriggerPulse},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSettings {
    /// Fastest speed the controller accepts, mm/s.
    pub max_speed_mm_s: f64,
    /// Speed setpoints are rounded to a multiple of this, mm/s.
    pub velocity_resolution_mm_s: f64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_speed_mm_s: 5.0,
            velocity_resolution_mm_s: 0.001,
        }
    }
}

/// Encoder-triggered scan range, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    pub start_mm: f64,
    pub end_mm: f64,
    pub enc_divide_mm: f64,
}

impl ScanConfig {
    /// Number of trigger pulses the encoder emits over the range.
    pub fn pulse_count(&self) -> u64 {
        if self.enc_divide_mm <= 0.0 || !self.enc_divide_mm.is_finite() {
            return 0;
        }
        let ratio = (self.end_mm - self.start_mm).abs() / self.enc_divide_mm;
        // 0.1 / 0.01 must count as 10 pulses, not 9
        (ratio + 1e-9).floor() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from_um: f64,
    to_um: f64,
    speed_um_s: f64,
    started: Instant,
}

impl Motion {
    fn position_at(&self, now: Instant) -> (f64, bool) {
        let distance = self.to_um - self.from_um;
        let travelled = self.speed_um_s * now.duration_since(self.started).as_secs_f64();

        if travelled >= distance.abs() {
            (self.to_um, true)
        } else {
            (self.from_um + travelled.copysign(distance), false)
        }
    }
}

#[derive(Debug, Clone)]
struct Channel {
    position_um: f64,
    motion: Option<Motion>,
    status: MotionStatus,
    scan: Option<ScanConfig>,
}

impl Channel {
    fn new() -> Self {
        Self {
            position_um: 0.0,
            motion: None,
            status: MotionStatus::ENABLED | MotionStatus::COMMAND_COMPLETE,
            scan: None,
        }
    }

    fn refresh(&mut self, now: Instant) {
        if let Some(motion) = self.motion {
            let (position, done) = motion.position_at(now);
            self.position_um = position;
            if done {
                self.motion = None;
                self.status.remove(MotionStatus::RUNNING);
                self.status.insert(MotionStatus::COMMAND_COMPLETE);
            }
        }
    }
}

/// Multi-channel motor controller with an encoder trigger output.
///
/// Positions are in micrometres, speeds in millimetres per second. One speed
/// setting is shared by every channel, as on the real controller.
pub struct SyntheticStage {
    channels: BTreeMap<String, Channel>,
    settings: StageSettings,
    speed_mm_s: f64,
    trigger: Option<TriggerOutput>,
    pulses_fired: u64,
}

impl SyntheticStage {
    pub fn new<S: AsRef<str>>(channels: &[S], settings: StageSettings) -> Self {
        let channels = channels
            .iter()
            .map(|name| (name.as_ref().to_string(), Channel::new()))
            .collect();

        let mut stage = Self {
            channels,
            settings,
            speed_mm_s: 0.0,
            trigger: None,
            pulses_fired: 0,
        };
        stage.speed_mm_s = stage.quantise(settings.max_speed_mm_s);
        stage
    }

    pub fn with_trigger(mut self, trigger: TriggerOutput) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn settings(&self) -> StageSettings {
        self.settings
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    fn channel_mut(&mut self, name: &str) -> Result<&mut Channel> {
        let channel = self.channels.get_mut(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, format!("Unknown stage channel {name}"))
        })?;
        channel.refresh(Instant::now());
        Ok(channel)
    }

    fn quantise(&self, speed_mm_s: f64) -> f64 {
        let resolution = self.settings.velocity_resolution_mm_s;
        let steps = (speed_mm_s / resolution).round().max(1.0);
        (steps * resolution).min(self.settings.max_speed_mm_s)
    }

    pub fn move_absolute(&mut self, channel: &str, position_um: f64) -> Result<()> {
        if !position_um.is_finite() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Target position {position_um} is not finite"),
            ));
        }

        let speed_um_s = self.speed_mm_s * 1000.0;
        let channel = self.channel_mut(channel)?;
        channel.motion = Some(Motion {
            from_um: channel.position_um,
            to_um: position_um,
            speed_um_s,
            started: Instant::now(),
        });
        channel
            .status
            .remove(MotionStatus::COMMAND_COMPLETE | MotionStatus::STOPPED);
        channel.status.insert(MotionStatus::RUNNING);

        trace!(target_um = position_um, speed_um_s, "Move started");
        Ok(())
    }

    pub fn state(&mut self, channel: &str) -> Result<StageState> {
        let channel = self.channel_mut(channel)?;
        Ok(StageState::new(channel.status, channel.position_um))
    }

    pub fn position(&mut self, channel: &str) -> Result<f64> {
        Ok(self.channel_mut(channel)?.position_um)
    }

    /// Halts every channel where it currently is.
    pub fn stop(&mut self) {
        let now = Instant::now();
        for (name, channel) in self.channels.iter_mut() {
            channel.refresh(now);
            if channel.motion.take().is_some() {
                channel.status.remove(MotionStatus::RUNNING);
                channel.status.insert(MotionStatus::STOPPED);
                debug!(channel = %name, position_um = channel.position_um, "Motion stopped");
            }
        }
    }

    pub fn set_zero(&mut self, channel: &str) -> Result<()> {
        let channel = self.channel_mut(channel)?;
        channel.motion = None;
        channel.position_um = 0.0;
        channel.status.remove(MotionStatus::RUNNING);
        channel
            .status
            .insert(MotionStatus::ZEROED | MotionStatus::COMMAND_COMPLETE);
        Ok(())
    }

    /// Sets the speed to `percent` of the maximum; values below one
    /// resolution step select the slowest speed the controller supports.
    pub fn set_speed_percent(&mut self, percent: f64) -> Result<f64> {
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Speed percent {percent} outside (0, 100]"),
            ));
        }
        self.speed_mm_s = self.quantise(self.settings.max_speed_mm_s * percent / 100.0);
        Ok(self.speed_mm_s)
    }

    pub fn set_velocity(&mut self, speed_mm_s: f64) -> Result<f64> {
        if !speed_mm_s.is_finite() || speed_mm_s <= 0.0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Velocity {speed_mm_s} mm/s must be positive"),
            ));
        }
        self.speed_mm_s = self.quantise(speed_mm_s);
        Ok(self.speed_mm_s)
    }

    pub fn speed(&self) -> f64 {
        self.speed_mm_s
    }

    pub fn scanr(&mut self, channel: &str, scan: ScanConfig) -> Result<()> {
        if !(scan.start_mm.is_finite() && scan.end_mm.is_finite()) || scan.enc_divide_mm <= 0.0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid scan {scan:?}"),
            ));
        }

        let channel = self.channel_mut(channel)?;
        channel.scan = Some(scan);
        channel.status.insert(MotionStatus::SCAN_ARMED);
        Ok(())
    }

    /// Runs the armed scan: one trigger pulse per encoder division, after
    /// which the channel rests at the scan end. Returns the pulse count.
    pub fn start_scan(&mut self, channel: &str) -> Result<u64> {
        let name = channel.to_string();
        let channel = self.channel_mut(channel)?;
        let scan = channel.scan.take().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("No scan configured on channel {name}"),
            )
        })?;
        channel.status.remove(MotionStatus::SCAN_ARMED);
        channel.motion = None;

        let pulses = scan.pulse_count();
        let direction = (scan.end_mm - scan.start_mm).signum();
        let start_um = scan.start_mm * 1000.0;
        let step_um = scan.enc_divide_mm * 1000.0 * direction;

        channel.position_um = scan.end_mm * 1000.0;
        channel.status.remove(MotionStatus::RUNNING);
        channel.status.insert(MotionStatus::COMMAND_COMPLETE);

        let first_index = self.pulses_fired;
        if let Some(trigger) = &self.trigger {
            for i in 0..pulses {
                let delivered = trigger.fire(TriggerPulse {
                    index: first_index + i,
                    position_um: start_um + step_um * i as f64,
                });
                if !delivered {
                    debug!(channel = %name, "Trigger line has no listener");
                    break;
                }
            }
        }
        self.pulses_fired += pulses;

        debug!(channel = %name, pulses, "Scan finished");
        Ok(pulses)
    }

    pub fn pulses_fired(&self) -> u64 {
        self.pulses_fired
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::trigger::trigger_line;

    fn stage() -> SyntheticStage {
        SyntheticStage::new(
            &["X", "Y"],
            StageSettings {
                max_speed_mm_s: 5.0,
                velocity_resolution_mm_s: 0.12,
            },
        )
    }

    #[test]
    fn velocity_is_quantised_to_resolution() {
        let mut stage = stage();
        let actual = stage.set_velocity(0.1).unwrap();
        assert!((actual - 0.12).abs() < 1e-12);
        assert!((stage.speed() - 0.12).abs() < 1e-12);
    }

    #[test]
    fn tiny_speed_percent_selects_minimum_speed() {
        let mut stage = stage();
        let max = stage.set_speed_percent(100.0).unwrap();
        let min = stage.set_speed_percent(0.01).unwrap();

        assert!(max <= 5.0);
        assert!((min - 0.12).abs() < 1e-12);
        assert!(stage.set_speed_percent(0.0).is_err());
    }

    #[test]
    fn moves_take_time_and_finish_at_target() {
        let mut stage = stage();
        stage.set_velocity(1.0).unwrap();
        stage.move_absolute("X", 20.0).unwrap();
        assert!(stage.state("X").unwrap().is_moving());

        std::thread::sleep(Duration::from_millis(40));

        let state = stage.state("X").unwrap();
        assert!(!state.is_moving());
        assert_eq!(state.position(), 20.0);
        assert!(state.motion_status().contains(MotionStatus::COMMAND_COMPLETE));
    }

    #[test]
    fn stop_freezes_motion_midway() {
        let mut stage = stage();
        stage.set_velocity(0.12).unwrap();
        stage.move_absolute("Y", 10_000.0).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        stage.stop();

        let state = stage.state("Y").unwrap();
        assert!(state.was_stopped());
        assert!(!state.is_moving());
        assert!(state.position() > 0.0 && state.position() < 10_000.0);
    }

    #[test]
    fn set_zero_resets_position() {
        let mut stage = stage();
        stage.set_speed_percent(100.0).unwrap();
        stage.move_absolute("X", 1.0).unwrap();
        stage.set_zero("X").unwrap();
        assert_eq!(stage.position("X").unwrap(), 0.0);
    }

    #[test]
    fn unknown_channel_is_not_found() {
        let mut stage = stage();
        assert_eq!(
            stage.position("Q").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn scan_emits_one_pulse_per_division() {
        let (output, input) = trigger_line();
        let mut stage = stage().with_trigger(output);

        stage
            .scanr(
                "X",
                ScanConfig {
                    start_mm: 0.0,
                    end_mm: 0.1,
                    enc_divide_mm: 0.01,
                },
            )
            .unwrap();
        assert_eq!(stage.start_scan("X").unwrap(), 10);

        let pulses: Vec<TriggerPulse> = std::iter::from_fn(|| input.try_next()).collect();
        assert_eq!(pulses.len(), 10);
        assert_eq!(pulses[9].index, 9);
        assert!((pulses[1].position_um - 10.0).abs() < 1e-9);
        assert!((stage.position("X").unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn start_scan_without_scanr_fails() {
        let mut stage = stage();
        assert_eq!(
            stage.start_scan("X").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn pulse_count_floors_partial_divisions() {
        let scan = ScanConfig {
            start_mm: 0.1,
            end_mm: 0.0,
            enc_divide_mm: 0.012,
        };
        assert_eq!(scan.pulse_count(), 8);
    }
}
