//! The virtual-user worker: one OS thread driving one `Driver` instance.
//!
//! A worker walks a monotonic state ladder and runs the workload loop
//! between the start barrier and its pacer's termination condition. With
//! a background mix configured, the same OS thread services two virtual
//! clocks, always running whichever mix's invoke time comes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_error::{DroverError, Result};
use drover_types::{CycleType, MixSelector, RunInfo, Timing};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::context::{DriverContext, SteadyJudge};
use crate::driver_api::{Driver, OperationError};
use crate::metrics::Metrics;
use crate::pacer::Pacer;
use crate::rpc::MasterHandle;
use crate::sync::{Latch, ShutdownFlag, StopSignal, WaitOutcome};
use crate::timer::Timer;

/// Worker lifecycle states, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    NotStarted = 0,
    Initializing = 1,
    PreRun = 2,
    Running = 3,
    PostRun = 4,
    Ended = 5,
}

/// Observable, monotonic state cell. Observers block in [`wait_for`]
/// until the worker reaches (or passes) the state they care about.
///
/// [`wait_for`]: StateCell::wait_for
pub struct StateCell {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::NotStarted),
            cond: Condvar::new(),
        }
    }

    /// Raise the state. Lower targets are ignored; every change is
    /// broadcast.
    pub fn set(&self, to: WorkerState) {
        let mut state = self.state.lock();
        if to > *state {
            *state = to;
            self.cond.notify_all();
        }
    }

    /// Raise to `to` only when currently exactly `expected`.
    pub fn compare_and_set(&self, expected: WorkerState, to: WorkerState) -> bool {
        let mut state = self.state.lock();
        if *state == expected {
            *state = to;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn get(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Block until the state is at least `target`.
    pub fn wait_for(&self, target: WorkerState) {
        let mut state = self.state.lock();
        while *state < target {
            self.cond.wait(&mut state);
        }
    }

    /// Like [`wait_for`](Self::wait_for), bounded; true when reached.
    pub fn wait_for_timeout(&self, target: WorkerState, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if *state >= target {
            return true;
        }
        self.cond.wait_for(&mut state, timeout);
        *state >= target
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every worker of one agent for one run: the clock,
/// the barriers, the stop signal, and the one-shot abort relay to the
/// master.
pub(crate) struct WorkerShared {
    pub timer: Arc<Timer>,
    pub master: Arc<dyn MasterHandle>,
    pub time_set_latch: Latch,
    pub pre_run_latch: Latch,
    pub post_run_latch: Latch,
    pub stop: StopSignal,
    pub shutdown: ShutdownFlag,
    abort_sent: AtomicBool,
    agent_label: String,
}

impl WorkerShared {
    pub fn new(
        timer: Arc<Timer>,
        master: Arc<dyn MasterHandle>,
        thread_count: usize,
        agent_label: impl Into<String>,
    ) -> Self {
        Self {
            timer,
            master,
            time_set_latch: Latch::new(1),
            pre_run_latch: Latch::new(1),
            post_run_latch: Latch::new(thread_count),
            stop: StopSignal::new(),
            shutdown: ShutdownFlag::new(),
            abort_sent: AtomicBool::new(false),
            agent_label: agent_label.into(),
        }
    }

    /// Relay an abort to the master, once per agent.
    pub fn abort_run(&self, who: &str) {
        if !self.abort_sent.swap(true, Ordering::SeqCst) {
            info!(agent = %self.agent_label, worker = who, "relaying abort to master");
            if let Err(error) = self.master.abort_run() {
                error!(agent = %self.agent_label, %error, "master unreachable during abort");
            }
        }
    }
}

/// Why the workload loop ended early.
enum LoopExit {
    /// Stop signal observed during a wait; clean teardown.
    Stopped,
    /// Fatal condition. `logged` is set once the site that classified
    /// the error has written it out, suppressing duplicates on unwind.
    Fatal { error: DroverError, logged: bool },
}

type LoopResult = std::result::Result<(), LoopExit>;

/// Virtual clock state for one mix.
struct MixState {
    selector: MixSelector,
    pending_op: usize,
    delay_ms: u64,
    start_ms: i64,
    end_ms: i64,
    invoke_ms: i64,
    first: bool,
}

/// One virtual user.
pub struct Worker {
    id: usize,
    name: String,
    run_info: Arc<RunInfo>,
    driver: Box<dyn Driver>,
    cx: DriverContext,
    mixes: Vec<MixState>,
    metrics: Metrics,
    pacer: Pacer,
    state: Arc<StateCell>,
    shared: Arc<WorkerShared>,
    in_ramp: bool,
    cycle_count: u64,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        run_info: Arc<RunInfo>,
        driver: Box<dyn Driver>,
        shared: Arc<WorkerShared>,
        state: Arc<StateCell>,
    ) -> Result<Self> {
        let config = &run_info.driver_config;
        let name = format!("{}[{}].{}", config.name, shared.agent_label, id);
        let seed = run_info
            .run_seed
            .wrapping_add((id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let cx = DriverContext::new(
            Arc::clone(&shared.timer),
            StdRng::seed_from_u64(seed),
            config.name.clone(),
            id,
        );
        let mixes = config
            .mix
            .iter()
            .map(|spec| {
                Ok(MixState {
                    selector: MixSelector::new(spec.clone())?,
                    pending_op: 0,
                    delay_ms: 0,
                    start_ms: 0,
                    end_ms: 0,
                    invoke_ms: 0,
                    first: true,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let op_names = config.operations.iter().map(|o| o.name.clone()).collect();
        let metrics = Metrics::new(config.name.clone(), id, op_names);
        let pacer = Pacer::from_run_info(&run_info);
        Ok(Self {
            id,
            name,
            run_info,
            driver,
            cx,
            mixes,
            metrics,
            pacer,
            state,
            shared,
            in_ramp: true,
            cycle_count: 0,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread body. Always transitions to `Ended` and releases this
    /// worker's share of the completion barrier, whatever happened to
    /// the workload loop — including a panic in driver code.
    pub fn run(mut self) -> Metrics {
        self.state.set(WorkerState::Initializing);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.do_run()));
        match outcome {
            Ok(Ok(())) => {
                debug!(worker = %self.name, cycles = self.cycle_count, "workload complete");
            }
            Ok(Err(LoopExit::Stopped)) => {
                debug!(worker = %self.name, "stopped during run");
            }
            Ok(Err(LoopExit::Fatal { error, logged })) => {
                if !logged {
                    error!(worker = %self.name, %error, "fatal error ended the workload");
                    self.shared.abort_run(&self.name);
                }
            }
            Err(_) => {
                error!(worker = %self.name, "driver panicked; aborting run");
                self.shared.abort_run(&self.name);
            }
        }
        self.finish();
        self.metrics
    }

    fn do_run(&mut self) -> LoopResult {
        if self.shared.time_set_latch.wait(&self.shared.stop) == WaitOutcome::Stopped {
            return Err(LoopExit::Stopped);
        }
        let bench_start = self.run_info.bench_start_time;
        let delay = bench_start - self.shared.timer.now_ms();
        if delay <= 0 {
            error!(
                worker = %self.name,
                shortfall_ms = -delay,
                "trigger time has expired; need {} ms more",
                -delay
            );
            self.shared.abort_run(&self.name);
            return Err(LoopExit::Fatal {
                error: DroverError::TriggerExpired { shortfall_ms: -delay },
                logged: true,
            });
        }
        if self.shared.stop.sleep_until(&self.shared.timer, bench_start) == WaitOutcome::Stopped {
            return Err(LoopExit::Stopped);
        }
        self.pre_run()?;
        self.main_loop()
    }

    /// Worker 0 alone runs the once-before hook; everyone else parks on
    /// the pre-run barrier until it is done.
    fn pre_run(&mut self) -> LoopResult {
        if self.id == 0 {
            if self.run_info.driver_config.has_pre_run {
                self.state.set(WorkerState::PreRun);
                match self.driver.once_before(&mut self.cx) {
                    Ok(()) => {}
                    Err(OperationError::Interrupted) => {
                        // The run is being killed; redoing the hook is
                        // pointless.
                    }
                    Err(error) => {
                        warn!(worker = %self.name, %error, "once-before hook failed");
                    }
                }
            }
            self.shared.pre_run_latch.count_down();
        }
        if self.shared.pre_run_latch.wait(&self.shared.stop) == WaitOutcome::Stopped {
            return Err(LoopExit::Stopped);
        }
        self.state.set(WorkerState::Running);
        Ok(())
    }

    fn main_loop(&mut self) -> LoopResult {
        // Both virtual clocks start at the trigger time (or now, when
        // the start sleep overslept slightly).
        let floor = self
            .shared
            .timer
            .now_ms()
            .max(self.run_info.bench_start_time);
        for m in 0..self.mixes.len() {
            self.mixes[m].start_ms = floor;
            self.mixes[m].end_ms = floor;
            self.schedule_next(m);
        }
        loop {
            // Earliest pending invoke; ties go to the foreground mix.
            let m = (0..self.mixes.len())
                .min_by_key(|&i| (self.mixes[i].invoke_ms, i))
                .unwrap_or(0);
            let invoke_at = self.mixes[m].invoke_ms;
            if let Pacer::Time { run_end, .. } = self.pacer {
                // Nothing left that would start before the run ends.
                if invoke_at >= run_end {
                    return Ok(());
                }
            }
            if self.shared.stop.sleep_until(&self.shared.timer, invoke_at)
                == WaitOutcome::Stopped
            {
                return Err(LoopExit::Stopped);
            }
            self.run_once(m)?;
            self.cycle_count += 1;
            if self
                .pacer
                .is_done(self.shared.timer.now_ms(), self.cycle_count)
            {
                return Ok(());
            }
            self.schedule_next(m);
        }
    }

    /// Select the next operation for a mix and compute its invoke time.
    ///
    /// Cycle time paces from the previous operation's start, think time
    /// from its end. The first scheduling round of each mix draws from
    /// the configured initial delay instead of the operation's cycle.
    fn schedule_next(&mut self, m: usize) {
        let config = &self.run_info.driver_config;
        let mix = &mut self.mixes[m];
        let op = mix.selector.select(self.cx.rng());
        let cycle = if mix.first {
            mix.first = false;
            config.initial_delay(m)
        } else {
            config.operations[op].cycle
        };
        let delay = cycle.draw(self.cx.rng());
        mix.pending_op = op;
        mix.delay_ms = delay;
        mix.invoke_ms = match cycle.cycle_type {
            CycleType::CycleTime => mix.start_ms + delay as i64,
            CycleType::ThinkTime => mix.end_ms + delay as i64,
        };
    }

    /// Invoke the pending operation of a mix and classify the outcome.
    fn run_once(&mut self, m: usize) -> LoopResult {
        let op_idx = self.mixes[m].pending_op;
        let judge = match self.pacer {
            Pacer::Time {
                steady_start,
                steady_end,
                ..
            } => SteadyJudge::Time {
                steady_start,
                steady_end,
            },
            Pacer::Cycles { .. } => SteadyJudge::Cycles {
                in_steady: self.pacer.is_steady_span(0, 0, self.cycle_count),
            },
        };
        self.cx.set_judge(judge);
        self.cx
            .set_operation(op_idx, &self.run_info.driver_config.operations[op_idx].name);
        self.cx.reset_timing();
        let start = self.shared.timer.now_ms();
        self.mixes[m].start_ms = start;

        match self.driver.operate(op_idx, &mut self.cx) {
            Ok(()) => {
                self.validate_timing(op_idx)?;
                let t = self.cx.timing();
                self.mixes[m].end_ms = t.respond_ms;
                if self
                    .pacer
                    .is_steady_span(t.invoke_ms, t.respond_ms, self.cycle_count)
                {
                    let latency = (t.respond_ms - t.invoke_ms).max(0) as u64;
                    self.metrics.record_success(op_idx, latency);
                }
                self.update_ramp(t.invoke_ms, t.respond_ms);
            }
            Err(OperationError::Fatal { detail }) => {
                let operation = self.qualified_op(op_idx);
                error!(worker = %self.name, %operation, detail = %detail, "fatal operation error");
                self.shared.abort_run(&self.name);
                return Err(LoopExit::Fatal {
                    error: DroverError::DriverFatal { operation, detail },
                    logged: true,
                });
            }
            Err(OperationError::Interrupted) => {
                if self.shared.stop.is_stopped() {
                    return Err(LoopExit::Stopped);
                }
                return Err(LoopExit::Fatal {
                    error: DroverError::Interrupted,
                    logged: false,
                });
            }
            Err(OperationError::Failed { detail }) => {
                let end = self.shared.timer.now_ms();
                self.mixes[m].end_ms = end;
                let operation = &self.run_info.driver_config.operations[op_idx].name;
                if self.pacer.is_steady_span(start, end, self.cycle_count) {
                    self.metrics.record_failure(op_idx);
                    warn!(worker = %self.name, %operation, detail = %detail, "operation failed");
                } else {
                    warn!(
                        worker = %self.name,
                        %operation,
                        detail = %detail,
                        "operation failed; error not counted in result: start or \
                         end time not within steady state"
                    );
                }
                self.update_ramp(start, end);
            }
        }
        Ok(())
    }

    /// A successful return must have both timestamps recorded; anything
    /// else means the transport or the driver broke the timing contract.
    fn validate_timing(&mut self, op_idx: usize) -> LoopResult {
        let timing = self.run_info.driver_config.operations[op_idx].timing;
        let t = self.cx.timing();
        let detail = if t.invoke_ms == -1 {
            Some(match timing {
                Timing::Auto => {
                    "transport not called; ensure transport instantiation before \
                     making any remote calls"
                }
                Timing::Manual => {
                    "cannot determine start time; record_time not called before \
                     the critical section"
                }
            })
        } else if t.respond_ms == -1 {
            Some(match timing {
                Timing::Auto => {
                    "transport incomplete; ensure the transport error is surfaced \
                     from the operation"
                }
                Timing::Manual => {
                    "cannot determine end time; record_time not called after \
                     the critical section"
                }
            })
        } else {
            None
        };
        if let Some(detail) = detail {
            let operation = self.qualified_op(op_idx);
            error!(worker = %self.name, %operation, "{detail}");
            self.shared.abort_run(&self.name);
            return Err(LoopExit::Fatal {
                error: DroverError::TimingIncomplete {
                    operation,
                    detail: detail.to_owned(),
                },
                logged: true,
            });
        }
        Ok(())
    }

    /// Phase bookkeeping: leaves ramp on the first operation starting in
    /// steady state, re-enters it on the first operation ending in
    /// ramp-down.
    fn update_ramp(&mut self, start_ms: i64, end_ms: i64) {
        match self.pacer {
            Pacer::Time {
                steady_start,
                steady_end,
                ..
            } => {
                if self.in_ramp {
                    if start_ms >= steady_start && start_ms < steady_end {
                        self.in_ramp = false;
                        debug!(worker = %self.name, "entering steady state");
                    }
                } else if end_ms >= steady_end {
                    self.in_ramp = true;
                    debug!(worker = %self.name, "entering ramp-down");
                }
            }
            Pacer::Cycles { .. } => {
                let steady = self.pacer.is_steady_span(0, 0, self.cycle_count);
                if self.in_ramp == steady {
                    self.in_ramp = !steady;
                }
            }
        }
    }

    /// Completion path, run on every exit. Each worker releases its
    /// share of the completion barrier first; worker 0 then waits out
    /// the rest of the pool before the once-after hook.
    fn finish(&mut self) {
        self.shared.post_run_latch.count_down();
        if self.id == 0
            && self.run_info.driver_config.has_post_run
            && self
                .state
                .compare_and_set(WorkerState::Running, WorkerState::PostRun)
        {
            self.shared.post_run_latch.wait_uninterruptible();
            // A terminate racing the state switch can cut the hook's
            // I/O; redo it until it completes, unless the process
            // itself is going down.
            loop {
                match self.driver.once_after(&mut self.cx) {
                    Ok(()) => break,
                    Err(OperationError::Interrupted) if !self.shared.shutdown.is_set() => {
                        debug!(worker = %self.name, "once-after hook interrupted; retrying");
                    }
                    Err(error) => {
                        warn!(worker = %self.name, %error, "once-after hook failed");
                        break;
                    }
                }
            }
        }
        self.state.set(WorkerState::Ended);
    }

    fn qualified_op(&self, op_idx: usize) -> String {
        format!(
            "{}.{}",
            self.name, self.run_info.driver_config.operations[op_idx].name
        )
    }
}

#[cfg(test)]
mod tests {
    use drover_types::{
        CycleSpec, CycleType, Delay, DriverConfig, MixSpec, OperationDef, RunControl, RunInfo,
    };

    use super::*;
    use crate::rpc::tests_support::RecordingMaster;

    fn op(name: &str, cycle_type: CycleType, ms: u64) -> OperationDef {
        OperationDef {
            name: name.to_owned(),
            timing: Timing::Manual,
            cycle: CycleSpec {
                cycle_type,
                delay: Delay::Fixed { ms },
            },
            background: false,
        }
    }

    fn run_info() -> RunInfo {
        RunInfo {
            run_id: "web.1A".parse().unwrap(),
            driver_config: DriverConfig {
                name: "web".to_owned(),
                operations: vec![
                    op("a", CycleType::CycleTime, 100),
                    op("b", CycleType::ThinkTime, 100),
                ],
                mix: vec![MixSpec::Flat(vec![1.0, 0.0])],
                initial_delay: vec![CycleSpec::IMMEDIATE],
                run_control: RunControl::Time,
                cycles: 0,
                threads_per_agent: 1,
                has_pre_run: false,
                has_post_run: false,
            },
            ramp_up: 0,
            steady_state: 60,
            ramp_down: 0,
            bench_start_time: 0,
            run_seed: 7,
        }
    }

    struct NoopDriver;
    impl Driver for NoopDriver {
        fn operate(
            &mut self,
            _op: usize,
            cx: &mut DriverContext,
        ) -> std::result::Result<(), OperationError> {
            cx.record_time();
            cx.record_time();
            Ok(())
        }
    }

    fn worker_for(info: RunInfo) -> Worker {
        let timer = Arc::new(Timer::new());
        let master = Arc::new(RecordingMaster::new(Arc::clone(&timer)));
        let shared = Arc::new(WorkerShared::new(timer, master, 1, "agent0"));
        Worker::new(
            0,
            Arc::new(info),
            Box::new(NoopDriver),
            shared,
            Arc::new(StateCell::new()),
        )
        .unwrap()
    }

    #[test]
    fn cycle_time_paces_from_operation_start() {
        // Operation a: CYCLETIME 100. Previous op started at t=0 and
        // ended at t=30: the next invoke lands at 100.
        let mut w = worker_for(run_info());
        w.mixes[0].first = false;
        w.mixes[0].start_ms = 0;
        w.mixes[0].end_ms = 30;
        // The flat mix always selects op 0 (weight 1.0 vs 0.0).
        w.schedule_next(0);
        assert_eq!(w.mixes[0].pending_op, 0);
        assert_eq!(w.mixes[0].invoke_ms, 100);
    }

    #[test]
    fn think_time_paces_from_operation_end() {
        let mut info = run_info();
        info.driver_config.mix = vec![MixSpec::Flat(vec![0.0, 1.0])];
        let mut w = worker_for(info);
        w.mixes[0].first = false;
        w.mixes[0].start_ms = 0;
        w.mixes[0].end_ms = 30;
        w.schedule_next(0);
        assert_eq!(w.mixes[0].pending_op, 1);
        assert_eq!(w.mixes[0].invoke_ms, 130);
    }

    #[test]
    fn first_round_uses_the_initial_delay() {
        let mut info = run_info();
        info.driver_config.initial_delay = vec![CycleSpec {
            cycle_type: CycleType::CycleTime,
            delay: Delay::Fixed { ms: 250 },
        }];
        let mut w = worker_for(info);
        w.mixes[0].start_ms = 1000;
        w.mixes[0].end_ms = 1000;
        w.schedule_next(0);
        assert_eq!(w.mixes[0].invoke_ms, 1250);
        // Second round: back to the operation's own cycle.
        w.mixes[0].start_ms = 1250;
        w.schedule_next(0);
        assert_eq!(w.mixes[0].invoke_ms, 1350);
    }

    #[test]
    fn state_cell_is_monotonic() {
        let cell = StateCell::new();
        cell.set(WorkerState::Running);
        cell.set(WorkerState::Initializing);
        assert_eq!(cell.get(), WorkerState::Running);
        assert!(cell.wait_for_timeout(WorkerState::Running, Duration::from_millis(1)));
        assert!(!cell.wait_for_timeout(WorkerState::Ended, Duration::from_millis(1)));
    }

    #[test]
    fn compare_and_set_requires_exact_state() {
        let cell = StateCell::new();
        assert!(!cell.compare_and_set(WorkerState::Running, WorkerState::PostRun));
        cell.set(WorkerState::Running);
        assert!(cell.compare_and_set(WorkerState::Running, WorkerState::PostRun));
        assert_eq!(cell.get(), WorkerState::PostRun);
    }
}
