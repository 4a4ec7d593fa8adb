//! The drover workload engine.
//!
//! An [`Agent`] hosts a pool of virtual-user workers, each an OS thread
//! driving user-supplied [`Driver`] code against a target system under a
//! prescribed operation mix, cycle discipline, and phase schedule. The
//! master coordinates agents through the handles in [`rpc`]: it
//! broadcasts the run configuration, releases the start barrier, and
//! collects per-thread [`Metrics`] when every worker has ended.
//!
//! All time arithmetic uses master-adjusted milliseconds from [`Timer`];
//! agents estimate their offset against the master clock once at startup.

pub mod agent;
pub mod context;
pub mod driver_api;
pub mod metrics;
pub mod pacer;
pub mod rpc;
pub mod sync;
pub mod timer;
pub mod worker;

pub use agent::Agent;
pub use context::{DriverContext, TimingInfo};
pub use driver_api::{Driver, DriverFactory, DriverRegistry, OperationError};
pub use metrics::{Metrics, OpStats, RunMetrics};
pub use pacer::Pacer;
pub use rpc::{AgentHandle, LocalAgent, MasterHandle, RemoteAgent, RemoteMaster};
pub use timer::Timer;
pub use worker::{Worker, WorkerState};
