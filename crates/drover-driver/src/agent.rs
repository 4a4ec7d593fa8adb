//! The per-host agent: owns the worker pool for one driver type.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use drover_error::{DroverError, Result};
use drover_types::RunInfo;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::driver_api::DriverRegistry;
use crate::metrics::Metrics;
use crate::rpc::MasterHandle;
use crate::timer::Timer;
use crate::worker::{StateCell, Worker, WorkerShared, WorkerState};

/// Round trips used to estimate the master clock offset.
const TIME_SYNC_SAMPLES: usize = 5;

struct Inner {
    shared: Option<Arc<WorkerShared>>,
    pending: Vec<Worker>,
    states: Vec<Arc<StateCell>>,
    handles: Vec<JoinHandle<Metrics>>,
    collected: Option<Vec<Metrics>>,
}

/// A process-level agent hosting N virtual-user workers.
///
/// Created once per host per driver type. The master drives it through
/// `configure` → `start_workers` → `collect_metrics`, with `stop_all`
/// cutting a run short. The clock offset against the master is sampled
/// once, at construction.
pub struct Agent {
    label: String,
    timer: Arc<Timer>,
    master: Arc<dyn MasterHandle>,
    registry: DriverRegistry,
    inner: Mutex<Inner>,
}

impl Agent {
    /// Create an agent and synchronize its clock with the master.
    pub fn new(
        label: impl Into<String>,
        master: Arc<dyn MasterHandle>,
        registry: DriverRegistry,
    ) -> Result<Arc<Self>> {
        let label = label.into();
        let timer = Arc::new(Timer::new());
        timer.sync_with(|| master.current_time_millis(), TIME_SYNC_SAMPLES)?;
        info!(agent = %label, offset_ms = timer.offset_ms(), "agent online");
        Ok(Arc::new(Self {
            label,
            timer,
            master,
            registry,
            inner: Mutex::new(Inner {
                shared: None,
                pending: Vec::new(),
                states: Vec::new(),
                handles: Vec::new(),
                collected: None,
            }),
        }))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// This agent's view of master time; the master folds it into the
    /// trigger-time computation.
    #[must_use]
    pub fn ready_time_ms(&self) -> i64 {
        self.timer.now_ms()
    }

    /// Store the run configuration and instantiate the worker pool in
    /// `NotStarted`. Rejected while a previous run is still in flight.
    pub fn configure(&self, run_info: RunInfo) -> Result<()> {
        run_info.driver_config.validate()?;
        if !self.registry.contains(&run_info.driver_config.name) {
            return Err(DroverError::DriverNotFound {
                name: run_info.driver_config.name.clone(),
            });
        }
        let mut inner = self.inner.lock();
        if !inner.handles.is_empty() || !inner.pending.is_empty() {
            return Err(DroverError::RunInProgress {
                run_id: run_info.run_id.to_string(),
            });
        }
        let info = Arc::new(run_info);
        let threads = info.driver_config.threads_per_agent;
        let shared = Arc::new(WorkerShared::new(
            Arc::clone(&self.timer),
            Arc::clone(&self.master),
            threads,
            self.label.clone(),
        ));
        let mut pending = Vec::with_capacity(threads);
        let mut states = Vec::with_capacity(threads);
        for id in 0..threads {
            let driver = self.registry.create(&info.driver_config.name)?;
            let state = Arc::new(StateCell::new());
            let worker = Worker::new(
                id,
                Arc::clone(&info),
                driver,
                Arc::clone(&shared),
                Arc::clone(&state),
            )?;
            pending.push(worker);
            states.push(state);
        }
        inner.pending = pending;
        inner.states = states;
        inner.collected = None;
        inner.shared = Some(shared);
        info!(
            agent = %self.label,
            run = %info.run_id,
            threads,
            "agent configured"
        );
        Ok(())
    }

    /// Spawn every configured worker and release the start barrier.
    pub fn start_workers(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            return Err(DroverError::internal("start before configure"));
        }
        let workers = std::mem::take(&mut inner.pending);
        for worker in workers {
            let name = worker.name().to_owned();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())?;
            inner.handles.push(handle);
        }
        let shared = inner
            .shared
            .as_ref()
            .ok_or_else(|| DroverError::internal("no shared state after configure"))?;
        shared.time_set_latch.count_down();
        info!(agent = %self.label, "workers released");
        Ok(())
    }

    /// Stop every worker. Idempotent; safe at any point of a run.
    pub fn stop_all(&self) {
        let inner = self.inner.lock();
        if let Some(shared) = &inner.shared {
            info!(agent = %self.label, "stopping all workers");
            shared.stop.stop();
        }
    }

    /// Flag that the whole process is exiting, bounding the post-run
    /// retry loop.
    pub fn mark_shutdown(&self) {
        let inner = self.inner.lock();
        if let Some(shared) = &inner.shared {
            shared.shutdown.set();
            shared.stop.stop();
        }
    }

    /// Join every worker and return the per-thread metrics. Blocks until
    /// the pool has ended; repeated calls return the collected copy.
    pub fn collect_metrics(&self) -> Result<Vec<Metrics>> {
        let handles = {
            let mut inner = self.inner.lock();
            if let Some(collected) = &inner.collected {
                return Ok(collected.clone());
            }
            if inner.handles.is_empty() {
                return Err(DroverError::internal("no workers to collect"));
            }
            std::mem::take(&mut inner.handles)
        };
        let mut metrics = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(m) => metrics.push(m),
                Err(_) => error!(agent = %self.label, "worker thread panicked"),
            }
        }
        let mut inner = self.inner.lock();
        inner.collected = Some(metrics.clone());
        Ok(metrics)
    }

    /// Whether every worker of the current run has ended.
    #[must_use]
    pub fn all_ended(&self) -> bool {
        let inner = self.inner.lock();
        !inner.states.is_empty()
            && inner
                .states
                .iter()
                .all(|s| s.get() == WorkerState::Ended)
    }
}
