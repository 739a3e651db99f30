use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, info_span, warn};

use super::{
    DataHooks, EndDecision, FeatureList, MainStatus, NodeKind, NodeSpec, RunContext, SignalHooks,
    counters::{RunCounters, StopHandle},
};
use crate::{
    camera::FrameSource,
    error::{AbortReason, ControllerError, Domain},
};

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How long a waiting thread sleeps before re-checking stop and abort.
    pub poll_interval: Duration,
    /// How long the data side keeps waiting for frames once the signal side
    /// of the same feature has finished.
    pub drain_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSummary {
    pub name: String,
    pub signal_iterations: u64,
    pub data_iterations: u64,
    pub frames: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub features: Vec<FeatureSummary>,
    pub total_frames: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FeatureProgress {
    signal_mains: u64,
    signal_done: bool,
    data_done: bool,
}

/// Cross-thread view of where each domain is. Waiters park on the condvar
/// and are woken whenever either side makes progress.
struct Progress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

struct ProgressState {
    features: Vec<FeatureProgress>,
    aborted: bool,
}

impl Progress {
    fn new(features: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                features: vec![FeatureProgress::default(); features],
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // A poisoned lock only means a hook panicked; the counters are still valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    fn feature(&self, index: usize) -> FeatureProgress {
        self.lock().features[index]
    }

    fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    fn abort(&self) {
        self.update(|state| state.aborted = true);
    }

    fn notify(&self) {
        self.changed.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self.changed.wait_timeout(guard, timeout);
    }
}

/// Marks the run aborted if the owning thread unwinds, so the other domain
/// stops waiting for it.
struct PanicGuard<'a> {
    progress: &'a Progress,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.progress.abort();
        }
    }
}

struct Shared<'a> {
    names: &'a [String],
    nodes: &'a [NodeSpec],
    progress: &'a Progress,
    failure: &'a Mutex<Option<ControllerError>>,
}

impl Shared<'_> {
    /// Records why a feature stopped early. Only the first reason is kept, and
    /// a hook failure aborts the other domain as well.
    fn fail(&self, index: usize, domain: Domain, reason: AbortReason) {
        match reason {
            AbortReason::Cancelled => return,
            AbortReason::StopRequested => {}
            _ => error!(%domain, "Feature failed: {}", reason),
        }

        {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            if failure.is_none() {
                *failure = Some(ControllerError::AcquisitionAborted {
                    feature: self.names[index].clone(),
                    domain,
                    reason: reason.clone(),
                });
            }
        }

        if reason != AbortReason::StopRequested {
            self.progress.abort();
        }
    }
}

/// Runs a list of features on a signal thread and a data thread.
pub struct FeatureEngine {
    options: EngineOptions,
    counters: Arc<RunCounters>,
    stop: StopHandle,
}

impl Default for FeatureEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl FeatureEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            counters: Arc::new(RunCounters::new()),
            stop: StopHandle::new(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn counters(&self) -> Arc<RunCounters> {
        Arc::clone(&self.counters)
    }

    /// Executes every feature in order and blocks until both domains are
    /// done.
    ///
    /// Cleanup runs exactly once for every feature whose init was entered,
    /// also when a hook panics. The first hook failure aborts the whole run;
    /// a stop request ends the run at the next main boundary. Both are
    /// reported as [`ControllerError::AcquisitionAborted`]. A stop request is
    /// consumed by the run it ended, so the engine can be run again.
    pub fn run(
        &self,
        features: FeatureList,
        frames: &mut dyn FrameSource,
    ) -> Result<RunSummary, ControllerError> {
        self.counters.reset();

        let mut names = Vec::with_capacity(features.len());
        let mut nodes = Vec::with_capacity(features.len());
        let mut signals = Vec::with_capacity(features.len());
        let mut datas = Vec::with_capacity(features.len());
        for spec in features.into_inner() {
            names.push(spec.name);
            nodes.push(spec.node);
            signals.push(spec.signal);
            datas.push(spec.data);
        }

        info!(features = ?names, "Starting acquisition run");

        let progress = Progress::new(names.len());
        let failure = Mutex::new(None);
        let shared = Shared {
            names: &names,
            nodes: &nodes,
            progress: &progress,
            failure: &failure,
        };

        let joined = thread::scope(|scope| {
            let signal = thread::Builder::new()
                .name("signal".to_string())
                .spawn_scoped(scope, || self.signal_domain(&shared, signals))?;
            let data = match thread::Builder::new()
                .name("data".to_string())
                .spawn_scoped(scope, || self.data_domain(&shared, datas, frames))
            {
                Ok(data) => data,
                Err(e) => {
                    progress.abort();
                    return Err(e);
                }
            };

            Ok::<_, std::io::Error>((signal.join(), data.join()))
        });
        let stopped = self.stop.is_stop_requested();
        self.stop.clear();
        let (signal, data) = joined?;

        if let Some(error) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            error!("Acquisition run aborted: {}", error);
            return Err(error);
        }

        let (signal, data) = match (signal, data) {
            (Ok(signal), Ok(data)) => (signal, data),
            (signal, _) => {
                let domain = if signal.is_err() {
                    Domain::Signal
                } else {
                    Domain::Data
                };
                error!(%domain, "Acquisition worker panicked");
                return Err(ControllerError::AcquisitionAborted {
                    feature: names.last().cloned().unwrap_or_default(),
                    domain,
                    reason: AbortReason::WorkerPanicked,
                });
            }
        };

        if stopped {
            return Err(ControllerError::AcquisitionAborted {
                feature: names.last().cloned().unwrap_or_default(),
                domain: Domain::Signal,
                reason: AbortReason::StopRequested,
            });
        }

        let features: Vec<FeatureSummary> = names
            .into_iter()
            .zip(signal)
            .zip(data)
            .map(|((name, signal_iterations), (data_iterations, frames))| FeatureSummary {
                name,
                signal_iterations,
                data_iterations,
                frames,
            })
            .collect();
        let summary = RunSummary {
            total_frames: features.iter().map(|f| f.frames).sum(),
            features,
        };

        info!(total_frames = summary.total_frames, "Acquisition run finished");
        Ok(summary)
    }

    fn signal_domain(&self, shared: &Shared, hooks: Vec<Box<dyn SignalHooks>>) -> Vec<u64> {
        let _guard = PanicGuard {
            progress: shared.progress,
        };
        let mut iterations = vec![0; hooks.len()];

        for (index, mut hooks) in hooks.into_iter().enumerate() {
            let name = &shared.names[index];

            if self.stop.is_stop_requested() || shared.progress.is_aborted() {
                debug!(feature = %name, "Skipping signal side");
                shared.progress.update(|s| s.features[index].signal_done = true);
                continue;
            }

            let span = info_span!("signal", feature = %name);
            let _enter = span.enter();
            let ctx = RunContext::new(name, &self.counters, &self.stop);

            let outcome = contain_panic(Domain::Signal, || {
                self.run_signal_feature(
                    index,
                    shared,
                    hooks.as_mut(),
                    &ctx,
                    &mut iterations[index],
                )
            });

            if let Err(reason) = outcome {
                shared.fail(index, Domain::Signal, reason);
            }

            run_cleanup(index, Domain::Signal, shared, || hooks.cleanup(&ctx));
            shared.progress.update(|s| s.features[index].signal_done = true);
        }

        iterations
    }

    fn run_signal_feature(
        &self,
        index: usize,
        shared: &Shared,
        hooks: &mut dyn SignalHooks,
        ctx: &RunContext,
        iterations: &mut u64,
    ) -> Result<(), AbortReason> {
        hooks.init(ctx).map_err(hook_failed)?;

        'feature: loop {
            loop {
                self.check_interrupted(shared)?;

                let status = hooks.main(ctx).map_err(hook_failed)?;
                *iterations += 1;
                shared.progress.update(|s| s.features[index].signal_mains += 1);

                if status == MainStatus::Complete {
                    break;
                }
            }

            let mut drained_since = None;
            loop {
                match hooks.end(ctx).map_err(hook_failed)? {
                    EndDecision::Finish => return Ok(()),
                    EndDecision::Repeat if shared.nodes[index].kind == NodeKind::MultiStep => {
                        debug!("Repeating main loop");
                        continue 'feature;
                    }
                    EndDecision::Repeat => return Ok(()),
                    EndDecision::Pending => {
                        self.check_interrupted(shared)?;

                        if shared.progress.feature(index).data_done {
                            let since = *drained_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= self.options.drain_timeout {
                                warn!("Data side finished before the exit condition was met");
                                return Ok(());
                            }
                        }
                        shared.progress.wait(self.options.poll_interval);
                    }
                }
            }
        }
    }

    fn data_domain(
        &self,
        shared: &Shared,
        hooks: Vec<Box<dyn DataHooks>>,
        frames: &mut dyn FrameSource,
    ) -> Vec<(u64, u64)> {
        let _guard = PanicGuard {
            progress: shared.progress,
        };
        let mut counts = vec![(0, 0); hooks.len()];

        for (index, mut hooks) in hooks.into_iter().enumerate() {
            let name = &shared.names[index];

            if !self.wait_for_first_main(index, shared) {
                debug!(feature = %name, "Signal side never ran; skipping data side");
                shared.progress.update(|s| s.features[index].data_done = true);
                continue;
            }

            let span = info_span!("data", feature = %name);
            let _enter = span.enter();
            let ctx = RunContext::new(name, &self.counters, &self.stop);

            let outcome = contain_panic(Domain::Data, || {
                self.run_data_feature(
                    index,
                    shared,
                    hooks.as_mut(),
                    &ctx,
                    &mut *frames,
                    &mut counts[index],
                )
            });

            if let Err(reason) = outcome {
                shared.fail(index, Domain::Data, reason);
            }

            run_cleanup(index, Domain::Data, shared, || hooks.cleanup(&ctx));
            shared.progress.update(|s| s.features[index].data_done = true);
        }

        counts
    }

    /// Blocks until the signal side of `index` has completed at least one
    /// main iteration. Returns `false` if it never will.
    fn wait_for_first_main(&self, index: usize, shared: &Shared) -> bool {
        loop {
            let feature = shared.progress.feature(index);
            if feature.signal_mains > 0 {
                return true;
            }
            if feature.signal_done || shared.progress.is_aborted() || self.stop.is_stop_requested()
            {
                return false;
            }
            shared.progress.wait(self.options.poll_interval);
        }
    }

    fn run_data_feature(
        &self,
        index: usize,
        shared: &Shared,
        hooks: &mut dyn DataHooks,
        ctx: &RunContext,
        frames: &mut dyn FrameSource,
        counts: &mut (u64, u64),
    ) -> Result<(), AbortReason> {
        hooks.init(ctx).map_err(hook_failed)?;

        let device_related = shared.nodes[index].device_related;
        let mut seen_mains = 0;
        let mut drained_since = None;

        loop {
            self.check_interrupted(shared)?;

            let feature = shared.progress.feature(index);
            let batch = if device_related {
                let batch = frames.next_frames(self.options.poll_interval);
                if batch.is_empty() {
                    if feature.signal_done {
                        let since = *drained_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.options.drain_timeout {
                            debug!("No more frames after signal side finished");
                            return Ok(());
                        }
                    }
                    continue;
                }
                drained_since = None;
                batch
            } else {
                if feature.signal_mains == seen_mains {
                    if feature.signal_done {
                        return Ok(());
                    }
                    shared.progress.wait(self.options.poll_interval);
                    continue;
                }
                seen_mains = feature.signal_mains;
                Vec::new()
            };

            counts.0 += 1;
            counts.1 += batch.len() as u64;
            hooks.main(ctx, &batch).map_err(hook_failed)?;
            shared.progress.notify();

            if hooks.end(ctx).map_err(hook_failed)? == EndDecision::Finish {
                return Ok(());
            }
        }
    }

    fn check_interrupted(&self, shared: &Shared) -> Result<(), AbortReason> {
        if self.stop.is_stop_requested() {
            info!("Stop requested");
            return Err(AbortReason::StopRequested);
        }
        if shared.progress.is_aborted() {
            // The failing side reports the reason.
            return Err(AbortReason::Cancelled);
        }
        Ok(())
    }
}

fn hook_failed(error: anyhow::Error) -> AbortReason {
    AbortReason::HookFailed(format!("{error:#}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Turns a panicking hook into a failed feature so its cleanup still runs.
fn contain_panic(
    domain: Domain,
    f: impl FnOnce() -> Result<(), AbortReason>,
) -> Result<(), AbortReason> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        error!(%domain, "Hook panicked: {}", panic_message(payload.as_ref()));
        Err(AbortReason::WorkerPanicked)
    })
}

fn run_cleanup(
    index: usize,
    domain: Domain,
    shared: &Shared,
    cleanup: impl FnOnce() -> anyhow::Result<()>,
) {
    match panic::catch_unwind(AssertUnwindSafe(cleanup)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%domain, "Cleanup failed: {:#}", e),
        Err(payload) => {
            error!(%domain, "Cleanup panicked: {}", panic_message(payload.as_ref()));
            shared.fail(index, domain, AbortReason::WorkerPanicked);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::acquisition::{FeatureSpec, NodeKind};

    #[derive(Default)]
    struct Calls {
        signal_init: AtomicUsize,
        signal_mains: AtomicU64,
        signal_cleanup: AtomicUsize,
        data_init: AtomicUsize,
        data_mains: AtomicU64,
        data_cleanup: AtomicUsize,
        // signal mains observed by the first data main
        mains_before_data: AtomicU64,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Fail {
        Never,
        SignalInit,
        SignalMain,
        SignalMainPanic,
        DataMain,
    }

    struct MockSignal {
        calls: Arc<Calls>,
        mains: u64,
        repeats: u64,
        fail: Fail,
        delay: Duration,
    }

    impl SignalHooks for MockSignal {
        fn init(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.calls.signal_init.fetch_add(1, Ordering::SeqCst);
            if self.fail == Fail::SignalInit {
                bail!("init refused");
            }
            Ok(())
        }

        fn main(&mut self, _ctx: &RunContext) -> anyhow::Result<MainStatus> {
            thread::sleep(self.delay);
            let done = self.calls.signal_mains.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail {
                Fail::SignalMain => bail!("move failed"),
                Fail::SignalMainPanic => panic!("index out of bounds in hook"),
                _ => {}
            }
            Ok(if done % self.mains == 0 {
                MainStatus::Complete
            } else {
                MainStatus::Continue
            })
        }

        fn end(&mut self, _ctx: &RunContext) -> anyhow::Result<EndDecision> {
            if self.repeats > 0 {
                self.repeats -= 1;
                return Ok(EndDecision::Repeat);
            }
            Ok(EndDecision::Finish)
        }

        fn cleanup(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.calls.signal_cleanup.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockData {
        calls: Arc<Calls>,
        fail: Fail,
    }

    impl DataHooks for MockData {
        fn init(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.calls.data_init.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn main(&mut self, ctx: &RunContext, frame_ids: &[usize]) -> anyhow::Result<()> {
            if self.calls.data_mains.fetch_add(1, Ordering::SeqCst) == 0 {
                let seen = self.calls.signal_mains.load(Ordering::SeqCst);
                self.calls.mains_before_data.store(seen, Ordering::SeqCst);
            }
            ctx.counters().record_frames(frame_ids.len() as u64);
            if self.fail == Fail::DataMain {
                bail!("disk full");
            }
            Ok(())
        }

        fn end(&mut self, _ctx: &RunContext) -> anyhow::Result<EndDecision> {
            Ok(EndDecision::Pending)
        }

        fn cleanup(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.calls.data_cleanup.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn feature(name: &str, calls: &Arc<Calls>, fail: Fail, kind: NodeKind) -> FeatureSpec {
        FeatureSpec {
            name: name.to_string(),
            signal: Box::new(MockSignal {
                calls: Arc::clone(calls),
                mains: 2,
                repeats: if kind == NodeKind::MultiStep { 1 } else { 0 },
                fail,
                delay: Duration::from_millis(1),
            }),
            data: Box::new(MockData {
                calls: Arc::clone(calls),
                fail,
            }),
            node: NodeSpec {
                kind,
                device_related: false,
            },
        }
    }

    /// Emits a fixed number of frames, then nothing.
    struct Frames {
        remaining: usize,
        next: usize,
    }

    impl FrameSource for Frames {
        fn next_frames(&mut self, timeout: Duration) -> Vec<usize> {
            if self.remaining == 0 {
                thread::sleep(timeout);
                return Vec::new();
            }
            self.remaining -= 1;
            self.next += 1;
            vec![self.next - 1]
        }
    }

    fn no_frames() -> Frames {
        Frames {
            remaining: 0,
            next: 0,
        }
    }

    fn fast_engine() -> FeatureEngine {
        FeatureEngine::new(EngineOptions {
            poll_interval: Duration::from_millis(2),
            drain_timeout: Duration::from_millis(50),
        })
    }

    #[test]
    fn normal_run_cleans_up_each_feature_once() {
        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("first", &calls, Fail::Never, NodeKind::SingleStep));
        features.push(feature("second", &calls, Fail::Never, NodeKind::SingleStep));

        let summary = fast_engine().run(features, &mut no_frames()).unwrap();

        assert_eq!(summary.features.len(), 2);
        assert_eq!(summary.features[0].signal_iterations, 2);
        assert_eq!(calls.signal_init.load(Ordering::SeqCst), 2);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 2);
        assert_eq!(calls.data_init.load(Ordering::SeqCst), 2);
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn repeat_re_enters_main_for_multi_step_nodes() {
        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("multi", &calls, Fail::Never, NodeKind::MultiStep));

        let summary = fast_engine().run(features, &mut no_frames()).unwrap();

        assert_eq!(summary.features[0].signal_iterations, 4);
        assert_eq!(calls.signal_init.load(Ordering::SeqCst), 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn data_main_never_precedes_first_signal_main() {
        let calls = Arc::new(Calls::default());
        let mut spec = feature("camera", &calls, Fail::Never, NodeKind::SingleStep);
        spec.node.device_related = true;
        let mut features = FeatureList::new();
        features.push(spec);

        let mut frames = Frames {
            remaining: 5,
            next: 0,
        };
        let summary = fast_engine().run(features, &mut frames).unwrap();

        assert!(calls.mains_before_data.load(Ordering::SeqCst) >= 1);
        assert_eq!(summary.total_frames, 5);
    }

    #[test]
    fn failing_init_still_cleans_up_and_skips_data() {
        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("broken", &calls, Fail::SignalInit, NodeKind::SingleStep));
        features.push(feature("after", &calls, Fail::Never, NodeKind::SingleStep));

        let err = fast_engine().run(features, &mut no_frames()).unwrap_err();

        match err {
            ControllerError::AcquisitionAborted {
                feature,
                domain,
                reason,
            } => {
                assert_eq!(feature, "broken");
                assert_eq!(domain, Domain::Signal);
                assert!(matches!(reason, AbortReason::HookFailed(msg) if msg.contains("init refused")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.signal_init.load(Ordering::SeqCst), 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.data_init.load(Ordering::SeqCst), 0);
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_main_aborts_run() {
        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("move", &calls, Fail::SignalMain, NodeKind::SingleStep));

        let err = fast_engine().run(features, &mut no_frames()).unwrap_err();

        assert!(matches!(
            err,
            ControllerError::AcquisitionAborted {
                domain: Domain::Signal,
                ..
            }
        ));
        assert_eq!(calls.signal_mains.load(Ordering::SeqCst), 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn data_failure_is_reported_against_data_domain() {
        let calls = Arc::new(Calls::default());
        let mut spec = feature("writer", &calls, Fail::DataMain, NodeKind::SingleStep);
        spec.node.device_related = true;
        let mut features = FeatureList::new();
        features.push(spec);

        let mut frames = Frames {
            remaining: 3,
            next: 0,
        };
        let err = fast_engine().run(features, &mut frames).unwrap_err();

        assert!(matches!(
            err,
            ControllerError::AcquisitionAborted {
                domain: Domain::Data,
                reason: AbortReason::HookFailed(_),
                ..
            }
        ));
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_request_ends_run_at_main_boundary() {
        let calls = Arc::new(Calls::default());
        let mut spec = feature("endless", &calls, Fail::Never, NodeKind::SingleStep);
        spec.signal = Box::new(MockSignal {
            calls: Arc::clone(&calls),
            mains: u64::MAX,
            repeats: 0,
            fail: Fail::Never,
            delay: Duration::from_millis(5),
        });
        let mut features = FeatureList::new();
        features.push(spec);

        let engine = fast_engine();
        let stop = engine.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            stop.request_stop();
        });

        let err = engine.run(features, &mut no_frames()).unwrap_err();
        stopper.join().unwrap();

        assert!(err.is_stop_request());
        assert!(calls.signal_mains.load(Ordering::SeqCst) >= 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_main_still_runs_cleanup() {
        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("plugin", &calls, Fail::SignalMainPanic, NodeKind::SingleStep));
        features.push(feature("after", &calls, Fail::Never, NodeKind::SingleStep));

        let err = fast_engine().run(features, &mut no_frames()).unwrap_err();

        match err {
            ControllerError::AcquisitionAborted {
                feature,
                domain,
                reason,
            } => {
                assert_eq!(feature, "plugin");
                assert_eq!(domain, Domain::Signal);
                assert_eq!(reason, AbortReason::WorkerPanicked);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.signal_init.load(Ordering::SeqCst), 1);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
        // main never completed, so the data side was never started
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn engine_runs_again_after_a_stopped_run() {
        let engine = fast_engine();
        engine.stop_handle().request_stop();

        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("stopped", &calls, Fail::Never, NodeKind::SingleStep));
        let err = engine.run(features, &mut no_frames()).unwrap_err();
        assert!(err.is_stop_request());
        assert_eq!(calls.signal_mains.load(Ordering::SeqCst), 0);

        let calls = Arc::new(Calls::default());
        let mut features = FeatureList::new();
        features.push(feature("next", &calls, Fail::Never, NodeKind::SingleStep));
        let summary = engine.run(features, &mut no_frames()).unwrap();

        assert_eq!(summary.features[0].signal_iterations, 2);
        assert_eq!(calls.signal_cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.data_cleanup.load(Ordering::SeqCst), 1);
    }
}
