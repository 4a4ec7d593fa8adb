//! On-disk representation of the run queue.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/runq/<bench>.<num><letter>/   one directory per pending run
//! <root>/out/<runId>/                  active and completed runs
//! <root>/sequence                      one line, "<num>:<letter>"
//! <root>/runq.lock                     advisory lock file
//! ```
//!
//! Structural mutations go through [`QueueStore::with_lock`], an OS
//! advisory file lock that also serializes against other harness
//! processes sharing the same root. The lock is released on every exit
//! path, error or not.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use advisory_lock::{AdvisoryFileLock, FileLockMode};
use drover_error::{DroverError, Result};
use drover_types::{RunId, SeqToken};
use tracing::{debug, warn};

/// Typed access to the queue directory tree.
pub struct QueueStore {
    runq_dir: PathBuf,
    out_dir: PathBuf,
    sequence_file: PathBuf,
    lock_file: PathBuf,
}

impl QueueStore {
    /// Open (creating if needed) a queue store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            runq_dir: root.join("runq"),
            out_dir: root.join("out"),
            sequence_file: root.join("sequence"),
            lock_file: root.join("runq.lock"),
        };
        fs::create_dir_all(&store.runq_dir)?;
        fs::create_dir_all(&store.out_dir)?;
        Ok(store)
    }

    /// Run `f` with the queue lock held. The lock is dropped on every
    /// exit path, including when `f` fails.
    pub fn with_lock<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let file = self.open_lock_file()?;
        AdvisoryFileLock::lock(&file, FileLockMode::Exclusive).map_err(|e| {
            DroverError::QueueLock {
                path: self.lock_file.clone(),
                detail: e.to_string(),
            }
        })?;
        let result = f(self);
        if let Err(error) = AdvisoryFileLock::unlock(&file) {
            warn!(path = %self.lock_file.display(), %error, "queue unlock failed");
        }
        result
    }

    fn open_lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_file)
            .map_err(|e| DroverError::QueueLock {
                path: self.lock_file.clone(),
                detail: e.to_string(),
            })
    }

    /// Read the sequence token. A missing file yields the reset token;
    /// a corrupt file is deleted with a warning and also resets.
    #[must_use]
    pub fn read_token(&self) -> SeqToken {
        let raw = match fs::read_to_string(&self.sequence_file) {
            Ok(raw) => raw,
            Err(_) => return SeqToken::FIRST,
        };
        match raw.trim().parse::<SeqToken>() {
            Ok(token) => token,
            Err(error) => {
                warn!(
                    path = %self.sequence_file.display(),
                    %error,
                    "sequence file is corrupt; resetting to 1:A"
                );
                let _ = fs::remove_file(&self.sequence_file);
                SeqToken::FIRST
            }
        }
    }

    /// Rewrite the sequence file.
    pub fn write_token(&self, token: SeqToken) -> Result<()> {
        fs::write(&self.sequence_file, format!("{token}\n"))?;
        Ok(())
    }

    /// Directory of a pending run.
    #[must_use]
    pub fn pending_run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runq_dir.join(run_id.to_string())
    }

    /// Directory of an active or completed run.
    #[must_use]
    pub fn out_run_dir(&self, run_id: &RunId) -> PathBuf {
        self.out_dir.join(run_id.to_string())
    }

    /// Names of the pending run directories, in directory order.
    pub fn pending_run_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.runq_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Move a pending run into the output tree, making it active.
    pub fn move_to_out(&self, run_id: &RunId) -> Result<PathBuf> {
        let from = self.pending_run_dir(run_id);
        let to = self.out_run_dir(run_id);
        fs::rename(&from, &to)?;
        debug!(run = %run_id, to = %to.display(), "run moved out of the queue");
        Ok(to)
    }

    /// Recursively delete a pending run. False when it was not there.
    pub fn delete_pending(&self, run_id: &RunId) -> Result<bool> {
        let dir = self.pending_run_dir(run_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }
}
