//! The run controller.
//!
//! One master drives one run at a time: it folds every agent's ready
//! time into the trigger time, broadcasts the configured `RunInfo`,
//! releases the start barriers, and collects metrics when the pool
//! drains. Agents reach back through the [`MasterHandle`] surface for
//! clock samples and abort requests.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drover_driver::agent::Agent;
use drover_driver::driver_api::DriverRegistry;
use drover_driver::metrics::RunMetrics;
use drover_driver::rpc::{self, AgentHandle, LocalAgent, MasterHandle, MasterRequest, MasterResponse, ServerHandle};
use drover_driver::timer::Timer;
use drover_error::{DroverError, Result};
use drover_types::{RunId, RunInfo, RunParams};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::run_daemon::RunExecutor;

/// Default head start granted to agents between broadcast and trigger.
pub const DEFAULT_STARTUP_SLACK_MS: i64 = 2_000;

/// An agent enrolled for a run: its handle plus the master-timeline
/// instant at which it reported ready.
pub struct AgentSlot {
    pub handle: Arc<dyn AgentHandle>,
    pub ready_time_ms: i64,
}

/// Run controller; also the clock and abort sink for agents.
pub struct Master {
    timer: Arc<Timer>,
    startup_slack_ms: i64,
    aborting: AtomicBool,
    agents: Mutex<Vec<Arc<dyn AgentHandle>>>,
    running: Mutex<Option<RunId>>,
}

impl Master {
    #[must_use]
    pub fn new(startup_slack_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            timer: Arc::new(Timer::new()),
            startup_slack_ms,
            aborting: AtomicBool::new(false),
            agents: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        })
    }

    /// The master's clock.
    #[must_use]
    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// Whether the current run is being aborted.
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    /// Run the start protocol: compute the trigger time from the
    /// agents' ready times, broadcast the configuration, and release
    /// every agent's start barrier.
    pub fn start_run(&self, slots: Vec<AgentSlot>, mut run_info: RunInfo) -> Result<()> {
        {
            let mut running = self.running.lock();
            if let Some(current) = &*running {
                return Err(DroverError::RunInProgress {
                    run_id: current.to_string(),
                });
            }
            *running = Some(run_info.run_id.clone());
        }
        self.aborting.store(false, Ordering::SeqCst);

        let latest_ready = slots
            .iter()
            .map(|s| s.ready_time_ms)
            .max()
            .unwrap_or_else(|| self.timer.now_ms())
            .max(self.timer.now_ms());
        run_info.bench_start_time = latest_ready + self.startup_slack_ms;
        info!(
            run = %run_info.run_id,
            bench_start_time = run_info.bench_start_time,
            agents = slots.len(),
            "starting run"
        );

        let handles: Vec<Arc<dyn AgentHandle>> = slots.into_iter().map(|s| s.handle).collect();
        *self.agents.lock() = handles.clone();

        for handle in &handles {
            if let Err(error) = handle.configure(&run_info) {
                error!(agent = handle.agent_id(), %error, "configure failed");
                self.abort();
                self.clear_run();
                return Err(error);
            }
        }
        for handle in &handles {
            if let Err(error) = handle.start() {
                error!(agent = handle.agent_id(), %error, "start failed");
                self.abort();
                self.clear_run();
                return Err(error);
            }
        }
        Ok(())
    }

    /// Wait out the run and aggregate every agent's metrics. Partial
    /// results from an aborted run come back with `aborted` set.
    ///
    /// The agent list stays registered until the join completes, so an
    /// abort arriving mid-join still fans out to every agent.
    pub fn join_run(&self) -> Result<RunMetrics> {
        let handles = self.agents.lock().clone();
        if handles.is_empty() {
            return Err(DroverError::internal("join_run without a started run"));
        }
        let mut parts = Vec::new();
        for handle in &handles {
            match handle.get_results() {
                Ok(metrics) => parts.extend(metrics),
                Err(error) => {
                    error!(agent = handle.agent_id(), %error, "agent lost; aborting run");
                    self.abort_handles(&handles);
                }
            }
        }
        let aborted = self.is_aborting();
        let report = RunMetrics::aggregate(parts.iter(), aborted);
        info!(
            operations = report.total_count(),
            threads = report.thread_count,
            aborted,
            "run joined"
        );
        self.clear_run();
        Ok(report)
    }

    /// Abort the run: idempotent; the first call fans `stop_all` out to
    /// every agent.
    pub fn abort(&self) {
        let handles = self.agents.lock().clone();
        self.abort_handles(&handles);
    }

    fn abort_handles(&self, handles: &[Arc<dyn AgentHandle>]) {
        if self.aborting.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("aborting run");
        for handle in handles {
            if let Err(error) = handle.stop_all() {
                error!(agent = handle.agent_id(), %error, "stop_all failed");
            }
        }
    }

    /// Abort and wait for the partial results.
    pub fn kill(&self) -> Result<RunMetrics> {
        self.abort();
        self.join_run()
    }

    fn clear_run(&self) {
        *self.running.lock() = None;
        self.agents.lock().clear();
    }

    /// Serve the master side of the wire protocol for remote agents.
    pub fn serve(master: &Arc<Self>, listener: std::net::TcpListener) -> Result<ServerHandle> {
        let master = Arc::clone(master);
        rpc::serve(listener, move |request: MasterRequest| match request {
            MasterRequest::CurrentTimeMillis => MasterResponse::Time {
                ms: master.timer.now_ms(),
            },
            MasterRequest::AbortRun => {
                master.abort();
                MasterResponse::Ok
            }
        })
    }
}

impl MasterHandle for Master {
    fn current_time_millis(&self) -> Result<i64> {
        Ok(self.timer.now_ms())
    }

    fn abort_run(&self) -> Result<()> {
        self.abort();
        Ok(())
    }
}

/// Production executor for single-process deployments: builds a master
/// and N in-process agents per run, executes, and writes the aggregated
/// report into the run directory.
pub struct LocalRunExecutor {
    registry: DriverRegistry,
    agent_count: usize,
    startup_slack_ms: i64,
    active: Mutex<Option<Arc<Master>>>,
}

impl LocalRunExecutor {
    #[must_use]
    pub fn new(registry: DriverRegistry, agent_count: usize, startup_slack_ms: i64) -> Self {
        Self {
            registry,
            agent_count: agent_count.max(1),
            startup_slack_ms,
            active: Mutex::new(None),
        }
    }

    fn load_params(run_dir: &Path) -> Result<RunParams> {
        for entry in fs::read_dir(run_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                let raw = fs::read_to_string(&path)?;
                if let Ok(params) = serde_json::from_str::<RunParams>(&raw) {
                    return Ok(params);
                }
            }
        }
        Err(DroverError::ParamsNotFound {
            path: run_dir.to_path_buf(),
        })
    }
}

impl RunExecutor for LocalRunExecutor {
    fn execute(&self, run_id: &RunId, run_dir: &Path) -> Result<()> {
        let params = Self::load_params(run_dir)?;
        let run_info = params.into_run_info(run_id.clone());
        run_info.driver_config.validate()?;

        let master = Master::new(self.startup_slack_ms);
        *self.active.lock() = Some(Arc::clone(&master));

        let mut slots = Vec::with_capacity(self.agent_count);
        for i in 0..self.agent_count {
            let agent = Agent::new(
                i.to_string(),
                Arc::clone(&master) as Arc<dyn MasterHandle>,
                self.registry.clone(),
            )?;
            slots.push(AgentSlot {
                ready_time_ms: agent.ready_time_ms(),
                handle: Arc::new(LocalAgent::new(agent)),
            });
        }

        let outcome = master
            .start_run(slots, run_info)
            .and_then(|()| master.join_run());
        *self.active.lock() = None;

        let report = outcome?;
        fs::write(
            run_dir.join("summary.json"),
            serde_json::to_vec_pretty(&report)?,
        )?;
        if report.aborted {
            return Err(DroverError::RunAborted {
                reason: "run ended in the aborting state".to_owned(),
            });
        }
        Ok(())
    }

    fn kill(&self) {
        if let Some(master) = self.active.lock().clone() {
            master.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use drover_driver::context::DriverContext;
    use drover_driver::driver_api::{Driver, OperationError};
    use drover_types::{
        CycleSpec, CycleType, Delay, DriverConfig, MixSpec, OperationDef, RunControl, Timing,
    };

    use super::*;

    struct SleeperDriver {
        ms: u64,
        invocations: Arc<AtomicUsize>,
        fatal_at: Option<usize>,
    }

    impl Driver for SleeperDriver {
        fn operate(
            &mut self,
            _op: usize,
            cx: &mut DriverContext,
        ) -> std::result::Result<(), OperationError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fatal_at {
                return Err(OperationError::fatal("injected failure"));
            }
            cx.record_time();
            std::thread::sleep(Duration::from_millis(self.ms));
            cx.record_time();
            Ok(())
        }
    }

    fn registry(invocations: &Arc<AtomicUsize>, fatal_at: Option<usize>) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        let invocations = Arc::clone(invocations);
        registry.register("web", move || {
            Box::new(SleeperDriver {
                ms: 2,
                invocations: Arc::clone(&invocations),
                fatal_at,
            })
        });
        registry
    }

    fn run_info(steady_secs: u64, threads: usize) -> RunInfo {
        RunInfo {
            run_id: "web.1A".parse().unwrap(),
            driver_config: DriverConfig {
                name: "web".to_owned(),
                operations: vec![OperationDef {
                    name: "browse".to_owned(),
                    timing: Timing::Manual,
                    cycle: CycleSpec {
                        cycle_type: CycleType::CycleTime,
                        delay: Delay::Fixed { ms: 10 },
                    },
                    background: false,
                }],
                mix: vec![MixSpec::Flat(vec![1.0])],
                initial_delay: vec![CycleSpec::IMMEDIATE],
                run_control: RunControl::Time,
                cycles: 0,
                threads_per_agent: threads,
                has_pre_run: false,
                has_post_run: false,
            },
            ramp_up: 0,
            steady_state: steady_secs,
            ramp_down: 0,
            bench_start_time: -1,
            run_seed: 11,
        }
    }

    fn slots_for(master: &Arc<Master>, registry: &DriverRegistry, n: usize) -> Vec<AgentSlot> {
        (0..n)
            .map(|i| {
                let agent = Agent::new(
                    i.to_string(),
                    Arc::clone(master) as Arc<dyn MasterHandle>,
                    registry.clone(),
                )
                .unwrap();
                AgentSlot {
                    ready_time_ms: agent.ready_time_ms(),
                    handle: Arc::new(LocalAgent::new(agent)) as Arc<dyn AgentHandle>,
                }
            })
            .collect()
    }

    #[test]
    fn a_short_run_completes_and_aggregates() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = registry(&invocations, None);
        let master = Master::new(100);
        let slots = slots_for(&master, &registry, 2);
        master.start_run(slots, run_info(1, 2)).unwrap();
        let report = master.join_run().unwrap();
        assert!(!report.aborted);
        assert_eq!(report.thread_count, 4);
        // Four workers pacing 10 ms cycles over a 1 s steady state.
        assert!(report.total_count() > 0);
        assert!(report.ops[0].failure_count == 0);
    }

    #[test]
    fn fatal_on_one_agent_aborts_every_agent() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = registry(&invocations, Some(10));
        let master = Master::new(100);
        let slots = slots_for(&master, &registry, 2);
        // A long steady state the abort must cut short.
        master.start_run(slots, run_info(60, 2)).unwrap();
        let report = master.join_run().unwrap();
        assert!(report.aborted);
        assert!(master.is_aborting());
        // Nowhere near the full minute of operations.
        assert!(report.total_count() < 1000);
    }

    #[test]
    fn abort_is_idempotent() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = registry(&invocations, None);
        let master = Master::new(100);
        let slots = slots_for(&master, &registry, 1);
        master.start_run(slots, run_info(30, 1)).unwrap();
        master.abort();
        master.abort();
        let report = master.join_run().unwrap();
        assert!(report.aborted);
    }

    #[test]
    fn second_concurrent_run_is_rejected() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = registry(&invocations, None);
        let master = Master::new(100);
        let slots = slots_for(&master, &registry, 1);
        master.start_run(slots, run_info(5, 1)).unwrap();
        let err = master
            .start_run(Vec::new(), run_info(5, 1))
            .unwrap_err();
        assert!(matches!(err, DroverError::RunInProgress { .. }));
        master.kill().unwrap();
    }

    #[test]
    fn executor_runs_from_a_run_directory() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = registry(&invocations, None);
        let dir = tempfile::tempdir().unwrap();
        let params = RunParams {
            description: "smoke".to_owned(),
            driver_config: run_info(1, 1).driver_config,
            ramp_up: 0,
            steady_state: 1,
            ramp_down: 0,
            run_seed: 5,
        };
        fs::write(
            dir.path().join("run.params.json"),
            serde_json::to_vec(&params).unwrap(),
        )
        .unwrap();
        let executor = LocalRunExecutor::new(registry, 1, 100);
        let run_id: RunId = "web.1A".parse().unwrap();
        executor.execute(&run_id, dir.path()).unwrap();
        let summary = fs::read_to_string(dir.path().join("summary.json")).unwrap();
        let report: RunMetrics = serde_json::from_str(&summary).unwrap();
        assert!(!report.aborted);
        assert!(report.total_count() > 0);
    }
}
