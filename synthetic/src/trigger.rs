//! Point-to-point trigger wiring between simulated devices.

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerPulse {
    pub index: u64,
    pub position_um: f64,
}

/// Creates a connected pair: pulses fired on the output arrive, in order, at
/// the input.
pub fn trigger_line() -> (TriggerOutput, TriggerInput) {
    let (tx, rx) = mpsc::channel();
    (TriggerOutput { tx }, TriggerInput { rx })
}

#[derive(Debug, Clone)]
pub struct TriggerOutput {
    tx: Sender<TriggerPulse>,
}

impl TriggerOutput {
    /// Returns `false` when nothing is listening any more.
    pub fn fire(&self, pulse: TriggerPulse) -> bool {
        self.tx.send(pulse).is_ok()
    }
}

#[derive(Debug)]
pub struct TriggerInput {
    rx: Receiver<TriggerPulse>,
}

impl TriggerInput {
    pub fn wait(&self, timeout: Duration) -> Option<TriggerPulse> {
        match self.rx.recv_timeout(timeout) {
            Ok(pulse) => Some(pulse),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_next(&self) -> Option<TriggerPulse> {
        self.rx.try_recv().ok()
    }
}
