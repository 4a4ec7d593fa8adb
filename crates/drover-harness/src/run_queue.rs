//! Admission and administration of benchmark runs.
//!
//! The queue is a value type constructed by the harness: it owns the
//! store, the benchmark descriptor table, and the single [`RunDaemon`]
//! worker that drains it. All structural mutations happen under the
//! store's advisory lock; reads are optimistic.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use drover_error::{DroverError, Result};
use drover_types::{BenchmarkDesc, RunId, RunParams};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue_store::QueueStore;
use crate::run_daemon::{RunDaemon, RunExecutor};

/// Sidecar metadata written next to the parameter repository at
/// submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionMeta {
    pub run_id: String,
    pub bench: String,
    pub submitter: String,
    pub submit_time_ms: u64,
}

/// File name of the submission sidecar inside a run directory.
pub const SUBMISSION_META_FILE: &str = "run.json";

/// One row of the queue listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub run_id: RunId,
    pub bench: String,
    pub description: String,
}

/// A pending run as scanned from the queue directory.
pub(crate) struct PendingRun {
    pub run_id: RunId,
    pub dir: PathBuf,
    pub submit_time_ms: u64,
}

/// Scan the pending runs, sorted by sequence suffix; equal suffixes
/// keep submission order.
pub(crate) fn scan_pending(store: &QueueStore) -> Result<Vec<PendingRun>> {
    let mut runs = Vec::new();
    for name in store.pending_run_names()? {
        let Ok(run_id) = name.parse::<RunId>() else {
            warn!(name = %name, "ignoring non-run directory in the queue");
            continue;
        };
        let dir = store.pending_run_dir(&run_id);
        let submit_time_ms = read_submission_meta(&dir)
            .map(|m| m.submit_time_ms)
            .unwrap_or(0);
        runs.push(PendingRun {
            run_id,
            dir,
            submit_time_ms,
        });
    }
    runs.sort_by_key(|r| (r.run_id.suffix_key(), r.submit_time_ms));
    Ok(runs)
}

fn read_submission_meta(dir: &Path) -> Option<SubmissionMeta> {
    let raw = fs::read_to_string(dir.join(SUBMISSION_META_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The run queue: admission, listing, deletion, and daemon control.
pub struct RunQueue {
    store: Arc<QueueStore>,
    benchmarks: Mutex<HashMap<String, BenchmarkDesc>>,
    daemon: Option<RunDaemon>,
}

impl RunQueue {
    /// Build a queue over `store` for administration only: submissions
    /// land in the queue for a daemon elsewhere (or later) to drain.
    #[must_use]
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self {
            store,
            benchmarks: Mutex::new(HashMap::new()),
            daemon: None,
        }
    }

    /// Build a queue over `store`, spawning the run daemon with the
    /// given executor.
    pub fn with_daemon(store: Arc<QueueStore>, executor: Arc<dyn RunExecutor>) -> Result<Self> {
        let daemon = RunDaemon::spawn(Arc::clone(&store), executor)?;
        Ok(Self {
            store,
            benchmarks: Mutex::new(HashMap::new()),
            daemon: Some(daemon),
        })
    }

    /// Make a benchmark submittable.
    pub fn register_benchmark(&self, desc: BenchmarkDesc) {
        self.benchmarks.lock().insert(desc.short_name.clone(), desc);
    }

    fn benchmark(&self, bench: &str) -> Result<BenchmarkDesc> {
        self.benchmarks
            .lock()
            .get(bench)
            .cloned()
            .ok_or_else(|| DroverError::config(format!("unknown benchmark: {bench}")))
    }

    /// Admit a run: mint an id from the sequence token, create the run
    /// directory, copy the submitter's parameter repository into it, and
    /// advance the token — all inside the queue lock, so concurrent
    /// submissions cannot mint the same id.
    pub fn add(&self, user: &str, bench: &str, param_source: &Path) -> Result<RunId> {
        let desc = self.benchmark(bench)?;
        if !param_source.exists() {
            return Err(DroverError::ParamsNotFound {
                path: param_source.to_path_buf(),
            });
        }
        let run_id = self.store.with_lock(|store| {
            let mut token = store.read_token();
            let run_id = loop {
                let candidate = RunId::new(&desc.short_name, token);
                if !store.pending_run_dir(&candidate).exists()
                    && !store.out_run_dir(&candidate).exists()
                {
                    break candidate;
                }
                // A directory already carries this id: a submission died
                // between creating it and advancing the token. Skip past.
                warn!(run = %candidate, "minted id collides with a stale directory; re-minting");
                token = token.successor();
            };
            let dir = store.pending_run_dir(&run_id);
            fs::create_dir_all(&dir)?;
            fs::copy(param_source, dir.join(&desc.config_file_name))?;
            let meta = SubmissionMeta {
                run_id: run_id.to_string(),
                bench: desc.short_name.clone(),
                submitter: user.to_owned(),
                submit_time_ms: now_epoch_ms(),
            };
            fs::write(
                dir.join(SUBMISSION_META_FILE),
                serde_json::to_vec_pretty(&meta)?,
            )?;
            store.write_token(token.successor())?;
            Ok(run_id)
        })?;
        info!(run = %run_id, submitter = user, "run queued");
        if let Some(daemon) = &self.daemon {
            daemon.notify();
        }
        Ok(run_id)
    }

    /// Delete a not-yet-started run. False when it was not in the queue
    /// (already picked, or never there).
    pub fn delete(&self, run_id: &RunId) -> Result<bool> {
        let deleted = self
            .store
            .with_lock(|store| store.delete_pending(run_id))?;
        if deleted {
            info!(run = %run_id, "run removed from the queue");
        } else {
            warn!(run = %run_id, "delete requested for a run not in the queue");
        }
        Ok(deleted)
    }

    /// List pending runs in pick order. The description comes from each
    /// run's parameter repository when it parses, else "UNAVAILABLE".
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let pending = scan_pending(&self.store)?;
        let mut entries = Vec::with_capacity(pending.len());
        for run in pending {
            let desc = self.benchmarks.lock().get(&run.run_id.bench).cloned();
            let description = desc
                .and_then(|d| {
                    let raw = fs::read_to_string(run.dir.join(&d.config_file_name)).ok()?;
                    let params: RunParams = serde_json::from_str(&raw).ok()?;
                    if params.description.is_empty() {
                        None
                    } else {
                        Some(params.description)
                    }
                })
                .unwrap_or_else(|| "UNAVAILABLE".to_owned());
            entries.push(QueueEntry {
                bench: run.run_id.bench.clone(),
                run_id: run.run_id,
                description,
            });
        }
        Ok(entries)
    }

    /// The most recent previously-minted run that still has a parameter
    /// repository on disk, in the queue or in the output tree. None when
    /// the sequence is at its origin.
    pub fn get_valid_prev_run(&self, bench: &str) -> Result<Option<RunId>> {
        let desc = self.benchmark(bench)?;
        let token = self.store.read_token();
        let Some(prev) = token.predecessor() else {
            return Ok(None);
        };
        let run_id = RunId::new(&desc.short_name, prev);
        let in_queue = self
            .store
            .pending_run_dir(&run_id)
            .join(&desc.config_file_name);
        let in_out = self.store.out_run_dir(&run_id).join(&desc.config_file_name);
        if in_queue.exists() || in_out.exists() {
            Ok(Some(run_id))
        } else {
            Ok(None)
        }
    }

    /// The run currently executing, if any.
    #[must_use]
    pub fn current_run_id(&self) -> Option<RunId> {
        self.daemon.as_ref().and_then(|d| d.current_run_id())
    }

    /// Abort the currently executing run. The id is required so a stale
    /// kill cannot take down the wrong run.
    pub fn kill_current_run(&self, run_id: &RunId) -> Result<RunId> {
        match &self.daemon {
            Some(daemon) => daemon.kill_current_run(run_id),
            None => Err(DroverError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    /// Human-readable daemon status.
    #[must_use]
    pub fn daemon_status(&self) -> String {
        match &self.daemon {
            Some(daemon) => format!("run daemon is {}", daemon.status()),
            None => "run daemon is not attached".to_owned(),
        }
    }

    /// Pause picking new runs; the in-flight run is unaffected.
    pub fn suspend_daemon(&self) {
        if let Some(daemon) = &self.daemon {
            daemon.suspend();
        }
    }

    /// Resume picking runs.
    pub fn resume_daemon(&self) {
        if let Some(daemon) = &self.daemon {
            daemon.resume();
        }
    }

    /// Stop the daemon and wait for it to exit.
    pub fn exit(&self) {
        if let Some(daemon) = &self.daemon {
            daemon.exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use drover_types::SeqToken;

    use super::*;

    fn desc(bench: &str) -> BenchmarkDesc {
        BenchmarkDesc {
            short_name: bench.to_owned(),
            config_file_name: "run.params.json".to_owned(),
            description: String::new(),
        }
    }

    fn queue() -> (tempfile::TempDir, RunQueue, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(QueueStore::open(dir.path().join("harness")).unwrap());
        // No daemon: submissions stay in the queue for inspection.
        let queue = RunQueue::new(store);
        queue.register_benchmark(desc("X"));
        queue.register_benchmark(desc("Y"));
        let params = dir.path().join("source.params.json");
        fs::write(
            &params,
            r#"{"description":"two-op web mix","driver_config":{"name":"web","operations":[{"name":"browse","timing":"Manual","cycle":{"cycle_type":"CycleTime","delay":{"Fixed":{"ms":10}}},"background":false}],"mix":[{"Flat":[1.0]}],"initial_delay":[],"run_control":"Time","cycles":0,"threads_per_agent":1,"has_pre_run":false,"has_post_run":false},"ramp_up":1,"steady_state":2,"ramp_down":1}"#,
        )
        .unwrap();
        (dir, queue, params)
    }

    #[test]
    fn sequence_rolls_across_adds() {
        let (_dir, queue, params) = queue();
        queue
            .store
            .write_token(SeqToken { num: 1, letter: 'z' })
            .unwrap();
        let first = queue.add("alice", "X", &params).unwrap();
        assert_eq!(first.to_string(), "X.1z");
        assert_eq!(queue.store.read_token(), SeqToken { num: 2, letter: 'A' });
        let second = queue.add("alice", "X", &params).unwrap();
        assert_eq!(second.to_string(), "X.2A");
        assert_eq!(queue.store.read_token(), SeqToken { num: 2, letter: 'B' });
    }

    #[test]
    fn valid_prev_run_follows_the_predecessor() {
        let (_dir, queue, params) = queue();
        queue
            .store
            .write_token(SeqToken { num: 1, letter: 'z' })
            .unwrap();
        queue.add("alice", "X", &params).unwrap();
        queue.add("alice", "X", &params).unwrap();
        // Token is now 2:B; its predecessor 2:A is queued with a
        // parameter repository.
        let prev = queue.get_valid_prev_run("X").unwrap();
        assert_eq!(prev.unwrap().to_string(), "X.2A");
    }

    #[test]
    fn valid_prev_run_is_none_at_origin() {
        let (_dir, queue, _params) = queue();
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), None);
    }

    #[test]
    fn valid_prev_run_is_none_without_params_on_disk() {
        let (_dir, queue, _params) = queue();
        queue
            .store
            .write_token(SeqToken { num: 3, letter: 'C' })
            .unwrap();
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), None);
    }

    #[test]
    fn list_sorts_by_suffix_preserving_ties() {
        let (_dir, queue, params) = queue();
        // Y.1A, then X.1B, then X.1A — suffix order with a stable tie.
        queue
            .store
            .write_token(SeqToken { num: 1, letter: 'A' })
            .unwrap();
        let y1a = queue.add("u", "Y", &params).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue
            .store
            .write_token(SeqToken { num: 1, letter: 'B' })
            .unwrap();
        let x1b = queue.add("u", "X", &params).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue
            .store
            .write_token(SeqToken { num: 1, letter: 'A' })
            .unwrap();
        let x1a = queue.add("u", "X", &params).unwrap();

        assert_eq!(y1a.to_string(), "Y.1A");
        assert_eq!(x1b.to_string(), "X.1B");
        assert_eq!(x1a.to_string(), "X.1A");

        let listing = queue.list().unwrap();
        let ids: Vec<String> = listing.iter().map(|e| e.run_id.to_string()).collect();
        assert_eq!(ids, vec!["Y.1A", "X.1A", "X.1B"]);
        assert!(listing.iter().all(|e| e.description == "two-op web mix"));
    }

    #[test]
    fn add_skips_stale_directories() {
        let (_dir, queue, params) = queue();
        // Leave a half-submitted directory for 1A without advancing the
        // token, the legacy failure mode.
        let stale: RunId = "X.1A".parse().unwrap();
        fs::create_dir_all(queue.store.pending_run_dir(&stale)).unwrap();
        let minted = queue.add("u", "X", &params).unwrap();
        assert_eq!(minted.to_string(), "X.1B");
        assert_eq!(queue.store.read_token(), SeqToken { num: 1, letter: 'C' });
    }

    #[test]
    fn delete_removes_only_pending_runs() {
        let (_dir, queue, params) = queue();
        let run_id = queue.add("u", "X", &params).unwrap();
        assert!(queue.delete(&run_id).unwrap());
        assert!(!queue.delete(&run_id).unwrap());
        assert!(queue.list().unwrap().is_empty());
    }

    #[test]
    fn missing_param_source_fails_cleanly() {
        let (dir, queue, _params) = queue();
        let err = queue
            .add("u", "X", &dir.path().join("nope.json"))
            .unwrap_err();
        assert!(matches!(err, DroverError::ParamsNotFound { .. }));
        // The queue stays consistent: nothing was admitted.
        assert!(queue.list().unwrap().is_empty());
    }

    #[test]
    fn unknown_benchmark_is_rejected() {
        let (_dir, queue, params) = queue();
        assert!(queue.add("u", "Z", &params).is_err());
    }
}
