//! Acquisition pipeline: features with paired signal and data behaviour,
//! executed by [`FeatureEngine`] on two worker threads.
//!
//! The signal thread drives hardware (moves, waveforms, triggers). The data
//! thread consumes frames. Each thread walks the registered features in
//! order through `init`, a `main` loop, `end` and `cleanup`.

pub mod counters;
pub mod engine;
pub mod features;
pub mod writer;

pub use counters::{RunCounters, StopHandle};
pub use engine::{EngineOptions, FeatureEngine, FeatureSummary, RunSummary};
pub use writer::{FrameWriter, TracingFrameWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs its main loop once.
    SingleStep,
    /// May ask to re-enter its main loop from `end`.
    MultiStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpec {
    pub kind: NodeKind,
    /// Whether the data side consumes camera frames.
    pub device_related: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStatus {
    Continue,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDecision {
    Finish,
    /// Run the main loop again. Treated as `Finish` by single-step nodes and
    /// as "keep going" on the data side.
    Repeat,
    /// Exit condition not met yet; ask again later.
    Pending,
}

/// What a hook can see of the run it is part of.
pub struct RunContext<'a> {
    feature: &'a str,
    counters: &'a RunCounters,
    stop: &'a StopHandle,
}

impl<'a> RunContext<'a> {
    pub fn new(feature: &'a str, counters: &'a RunCounters, stop: &'a StopHandle) -> Self {
        Self {
            feature,
            counters,
            stop,
        }
    }

    pub fn feature(&self) -> &str {
        self.feature
    }

    pub fn counters(&self) -> &RunCounters {
        self.counters
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }
}

pub trait SignalHooks: Send {
    fn init(&mut self, ctx: &RunContext) -> anyhow::Result<()>;

    fn main(&mut self, ctx: &RunContext) -> anyhow::Result<MainStatus>;

    fn end(&mut self, ctx: &RunContext) -> anyhow::Result<EndDecision>;

    /// Runs exactly once after `init`, however the feature ended.
    fn cleanup(&mut self, ctx: &RunContext) -> anyhow::Result<()>;
}

pub trait DataHooks: Send {
    fn init(&mut self, ctx: &RunContext) -> anyhow::Result<()>;

    fn main(&mut self, ctx: &RunContext, frame_ids: &[usize]) -> anyhow::Result<()>;

    fn end(&mut self, ctx: &RunContext) -> anyhow::Result<EndDecision>;

    fn cleanup(&mut self, ctx: &RunContext) -> anyhow::Result<()>;
}

/// Registration record of one pipeline stage.
pub struct FeatureSpec {
    pub name: String,
    pub signal: Box<dyn SignalHooks>,
    pub data: Box<dyn DataHooks>,
    pub node: NodeSpec,
}

/// Implemented by every feature that can take part in a run, built-in or
/// supplied by a plugin.
pub trait Feature {
    fn config_table(self) -> FeatureSpec;
}

#[derive(Default)]
pub struct FeatureList {
    features: Vec<FeatureSpec>,
}

impl FeatureList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spec: FeatureSpec) -> &mut Self {
        self.features.push(spec);
        self
    }

    pub fn register<F: Feature>(&mut self, feature: F) -> &mut Self {
        self.push(feature.config_table())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    pub(crate) fn into_inner(self) -> Vec<FeatureSpec> {
        self.features
    }
}
