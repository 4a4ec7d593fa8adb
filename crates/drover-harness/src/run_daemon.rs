//! The single long-running worker that drains the run queue.
//!
//! The daemon sleeps on a condvar until a submission signals it (with a
//! poll interval as a backstop for cross-process submissions), picks the
//! pending run whose sequence suffix sorts smallest, moves its directory
//! out of the queue, and hands it to the [`RunExecutor`]. At most one
//! run executes at a time, process-wide; the queue lock is never held
//! across an execution.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use drover_error::{DroverError, Result};
use drover_types::RunId;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::queue_store::QueueStore;
use crate::run_queue::scan_pending;

/// Backstop poll interval when no signal arrives.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Executes one admitted run; the production implementation drives the
/// master, tests stub it.
pub trait RunExecutor: Send + Sync {
    /// Run to completion. The run directory has already been moved to
    /// the output tree.
    fn execute(&self, run_id: &RunId, run_dir: &Path) -> Result<()>;

    /// Best-effort abort of the in-flight `execute`.
    fn kill(&self);
}

struct DaemonInner {
    store: Arc<QueueStore>,
    executor: Arc<dyn RunExecutor>,
    wakeups: Mutex<bool>,
    signal: Condvar,
    current: Mutex<Option<RunId>>,
    suspended: AtomicBool,
    exiting: AtomicBool,
}

impl DaemonInner {
    fn wait_for_signal(&self) {
        let mut pending = self.wakeups.lock();
        if !*pending {
            self.signal.wait_for(&mut pending, POLL_INTERVAL);
        }
        *pending = false;
    }

    fn notify(&self) {
        let mut pending = self.wakeups.lock();
        *pending = true;
        self.signal.notify_all();
    }

    /// Pick the smallest-suffix pending run and move it out of the
    /// queue. The lock is released before the caller executes the run.
    fn pick_next(&self) -> Result<Option<(RunId, std::path::PathBuf)>> {
        self.store.with_lock(|store| {
            let pending = scan_pending(store)?;
            let Some(next) = pending.into_iter().next() else {
                return Ok(None);
            };
            let dir = store.move_to_out(&next.run_id)?;
            Ok(Some((next.run_id, dir)))
        })
    }

    fn run_loop(&self) {
        info!("run daemon started");
        while !self.exiting.load(Ordering::SeqCst) {
            if self.suspended.load(Ordering::SeqCst) {
                self.wait_for_signal();
                continue;
            }
            match self.pick_next() {
                Ok(Some((run_id, dir))) => {
                    *self.current.lock() = Some(run_id.clone());
                    info!(run = %run_id, "run started");
                    match self.executor.execute(&run_id, &dir) {
                        Ok(()) => info!(run = %run_id, "run complete"),
                        Err(error) => error!(run = %run_id, %error, "run failed"),
                    }
                    *self.current.lock() = None;
                }
                Ok(None) => self.wait_for_signal(),
                Err(error) => {
                    error!(%error, "queue scan failed");
                    self.wait_for_signal();
                }
            }
        }
        info!("run daemon exited");
    }
}

/// Handle to the daemon thread.
pub struct RunDaemon {
    inner: Arc<DaemonInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RunDaemon {
    /// Spawn the daemon over a store.
    pub fn spawn(store: Arc<QueueStore>, executor: Arc<dyn RunExecutor>) -> Result<Self> {
        let inner = Arc::new(DaemonInner {
            store,
            executor,
            wakeups: Mutex::new(false),
            signal: Condvar::new(),
            current: Mutex::new(None),
            suspended: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
        });
        let run_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("run-daemon".to_owned())
            .spawn(move || run_inner.run_loop())?;
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Wake the daemon; called after a submission.
    pub fn notify(&self) {
        self.inner.notify();
    }

    /// The run currently executing, if any.
    #[must_use]
    pub fn current_run_id(&self) -> Option<RunId> {
        self.inner.current.lock().clone()
    }

    /// Abort the current run iff `run_id` names it.
    pub fn kill_current_run(&self, run_id: &RunId) -> Result<RunId> {
        let current = self.inner.current.lock().clone();
        match current {
            Some(current) if &current == run_id => {
                warn!(run = %current, "killing current run");
                self.inner.executor.kill();
                Ok(current)
            }
            Some(current) => Err(DroverError::KillMismatch {
                requested: run_id.to_string(),
                current: current.to_string(),
            }),
            None => Err(DroverError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    /// Stop picking new runs.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
        self.inner.notify();
    }

    /// Resume picking runs.
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.notify();
    }

    /// Status string for the administration surface.
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.thread.lock().is_none() {
            "stopped"
        } else if self.inner.suspended.load(Ordering::SeqCst) {
            "suspended"
        } else {
            "alive"
        }
    }

    /// Stop the daemon after the in-flight run (if any) and join it.
    pub fn exit(&self) {
        self.inner.exiting.store(true, Ordering::SeqCst);
        self.inner.executor.kill();
        self.inner.notify();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RunDaemon {
    fn drop(&mut self) {
        self.exit();
    }
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Instant;

    use drover_types::BenchmarkDesc;

    use super::tests_support::NullExecutor;
    use super::*;
    use crate::run_queue::RunQueue;

    fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if probe() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn daemon_drains_submissions_in_suffix_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(QueueStore::open(dir.path().join("harness")).unwrap());
        let executor = Arc::new(NullExecutor::default());
        let queue = RunQueue::with_daemon(Arc::clone(&store), executor.clone()).unwrap();
        queue.register_benchmark(BenchmarkDesc {
            short_name: "X".to_owned(),
            config_file_name: "run.params.json".to_owned(),
            description: String::new(),
        });
        let params = dir.path().join("p.json");
        fs::write(&params, "{}").unwrap();

        // Hold the daemon while three runs queue up.
        queue.suspend_daemon();
        queue.add("u", "X", &params).unwrap();
        queue.add("u", "X", &params).unwrap();
        queue.add("u", "X", &params).unwrap();
        queue.resume_daemon();

        assert!(wait_until(Duration::from_secs(5), || {
            executor.executed.lock().len() == 3
        }));
        assert_eq!(
            *executor.executed.lock(),
            vec!["X.1A", "X.1B", "X.1C"]
        );
        // Executed runs left the queue and landed in the output tree.
        assert!(queue.list().unwrap().is_empty());
        assert!(store
            .out_run_dir(&"X.1A".parse().unwrap())
            .join("run.params.json")
            .exists());
        queue.exit();
        assert_eq!(queue.daemon_status(), "run daemon is stopped");
    }

    #[test]
    fn kill_requires_a_matching_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(QueueStore::open(dir.path().join("harness")).unwrap());
        let daemon = RunDaemon::spawn(store, Arc::new(NullExecutor::default())).unwrap();
        let ghost: RunId = "X.1A".parse().unwrap();
        let err = daemon.kill_current_run(&ghost).unwrap_err();
        assert!(matches!(err, DroverError::RunNotFound { .. }));
        daemon.exit();
    }
}
