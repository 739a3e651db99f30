use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

/// Counters shared by the signal and data threads of a run.
#[derive(Debug, Default)]
pub struct RunCounters {
    received_this_step: AtomicU64,
    total_received: AtomicU64,
    total_expected: AtomicU64,
    current_channel: AtomicUsize,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.received_this_step.store(0, Ordering::Release);
        self.total_received.store(0, Ordering::Release);
        self.total_expected.store(0, Ordering::Release);
        self.current_channel.store(0, Ordering::Release);
    }

    /// Adds `count` frames to the step and run totals. Returns the new run
    /// total.
    pub fn record_frames(&self, count: u64) -> u64 {
        self.received_this_step.fetch_add(count, Ordering::AcqRel);
        self.total_received.fetch_add(count, Ordering::AcqRel) + count
    }

    pub fn received_this_step(&self) -> u64 {
        self.received_this_step.load(Ordering::Acquire)
    }

    /// Closes a step of `frames` frames. Frames that already belong to the
    /// next step are kept.
    pub fn finish_step(&self, frames: u64) {
        let _ = self
            .received_this_step
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |received| {
                Some(received.saturating_sub(frames))
            });
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Acquire)
    }

    pub fn total_expected(&self) -> u64 {
        self.total_expected.load(Ordering::Acquire)
    }

    pub fn set_total_expected(&self, frames: u64) {
        self.total_expected.store(frames, Ordering::Release);
    }

    pub fn current_channel(&self) -> usize {
        self.current_channel.load(Ordering::Acquire)
    }

    pub fn set_current_channel(&self, channel: usize) {
        self.current_channel.store(channel, Ordering::Release);
    }
}

/// Cooperative stop request. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }
}
