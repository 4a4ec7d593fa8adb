//! The drover coordination plane: run queue, run daemon, and master.
//!
//! A harness process opens a [`QueueStore`] over a shared directory,
//! builds a [`RunQueue`] with a [`RunExecutor`], and registers the
//! benchmarks it can run. Submissions mint sequence-ordered run ids;
//! the daemon drains them one at a time through the [`Master`].

pub mod master;
pub mod queue_store;
pub mod run_daemon;
pub mod run_queue;

pub use master::{AgentSlot, LocalRunExecutor, Master, DEFAULT_STARTUP_SLACK_MS};
pub use queue_store::QueueStore;
pub use run_daemon::{RunDaemon, RunExecutor};
pub use run_queue::{QueueEntry, RunQueue, SubmissionMeta};
