//! Drover: a distributed load-generation harness.
//!
//! A master coordinator accepts benchmark run requests into a
//! file-backed queue; a single daemon drains them one at a time. Each
//! run launches agents hosting pools of virtual-user threads that drive
//! user [`Driver`] code against a target system under a prescribed
//! operation mix, pacing discipline, and ramp-up / steady-state /
//! ramp-down schedule. Per-operation latencies and counts aggregate
//! into a final [`RunMetrics`] report.
//!
//! This crate is the umbrella: it re-exports the public surface of the
//! engine ([`drover_driver`]), the coordination plane
//! ([`drover_harness`]), and the data model ([`drover_types`]).

pub use drover_driver::{
    Agent, AgentHandle, Driver, DriverContext, DriverRegistry, LocalAgent, MasterHandle,
    Metrics, OperationError, RemoteAgent, RemoteMaster, RunMetrics, Timer,
};
pub use drover_error::{DroverError, Result};
pub use drover_harness::{
    AgentSlot, LocalRunExecutor, Master, QueueEntry, QueueStore, RunDaemon, RunExecutor,
    RunQueue, DEFAULT_STARTUP_SLACK_MS,
};
pub use drover_types::{
    BenchmarkDesc, CycleSpec, CycleType, Delay, DriverConfig, MixSelector, MixSpec,
    OperationDef, RunControl, RunId, RunInfo, RunParams, SeqToken, Timing,
};
