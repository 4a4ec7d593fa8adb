//! Run configuration: the snapshot broadcast to every agent at start.

use drover_error::{DroverError, Result};
use serde::{Deserialize, Serialize};

use crate::cycle::CycleSpec;
use crate::mix::MixSpec;
use crate::seq::RunId;

/// How a run decides it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunControl {
    /// Wall-clock phases: ramp-up, steady state, ramp-down in seconds.
    Time,
    /// A fixed number of operation cycles per worker.
    Cycles,
}

/// Who stamps the operation's invoke/respond times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timing {
    /// The transport layer calls `record_time` around the request.
    Auto,
    /// The driver code calls `record_time` around its critical section.
    Manual,
}

/// One entry of the operation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDef {
    /// Operation name, used in logs and reports.
    pub name: String,
    pub timing: Timing,
    pub cycle: CycleSpec,
    /// Whether this operation belongs to the background mix.
    pub background: bool,
}

/// Per-driver-type configuration.
///
/// `mix[0]` is the foreground mix; an optional `mix[1]` enables the
/// background mix, serviced by the same OS thread under its own virtual
/// clock. `initial_delay` is parallel to `mix` and paces each mix's first
/// invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver name; agents resolve it against their driver registry.
    pub name: String,
    pub operations: Vec<OperationDef>,
    pub mix: Vec<MixSpec>,
    pub initial_delay: Vec<CycleSpec>,
    pub run_control: RunControl,
    /// Target cycles per worker when `run_control` is `Cycles`.
    pub cycles: u64,
    /// Virtual users per agent.
    pub threads_per_agent: usize,
    /// Whether the driver has a once-before hook (worker 0 only).
    pub has_pre_run: bool,
    /// Whether the driver has a once-after hook (worker 0 only).
    pub has_post_run: bool,
}

impl DriverConfig {
    /// Whether this config drives a background mix alongside the
    /// foreground one.
    #[must_use]
    pub fn has_background(&self) -> bool {
        self.mix.len() > 1
    }

    /// The initial-delay cycle for a mix, defaulting to immediate.
    #[must_use]
    pub fn initial_delay(&self, mix_id: usize) -> CycleSpec {
        self.initial_delay
            .get(mix_id)
            .copied()
            .unwrap_or(CycleSpec::IMMEDIATE)
    }

    /// Validate the cross-field constraints the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.operations.is_empty() {
            return Err(DroverError::config("operation table is empty"));
        }
        if self.mix.is_empty() || self.mix.len() > 2 {
            return Err(DroverError::config(format!(
                "expected 1 or 2 mixes, got {}",
                self.mix.len()
            )));
        }
        for (mix_id, mix) in self.mix.iter().enumerate() {
            mix.validate()?;
            if mix.len() != self.operations.len() {
                return Err(DroverError::config(format!(
                    "mix {mix_id} spans {} operations but the table has {}",
                    mix.len(),
                    self.operations.len()
                )));
            }
        }
        for op in &self.operations {
            op.cycle.validate()?;
        }
        for delay in &self.initial_delay {
            delay.validate()?;
        }
        if self.threads_per_agent == 0 {
            return Err(DroverError::config("threads_per_agent is zero"));
        }
        if self.run_control == RunControl::Cycles && self.cycles == 0 {
            return Err(DroverError::config("cycle-controlled run with zero cycles"));
        }
        if self.has_background() && self.run_control == RunControl::Cycles {
            return Err(DroverError::config(
                "a background mix requires time-based run control",
            ));
        }
        Ok(())
    }
}

/// The per-run configuration snapshot passed to all agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub driver_config: DriverConfig,
    /// Ramp-up in seconds (cycles under `RunControl::Cycles`).
    pub ramp_up: u64,
    /// Steady state in seconds (cycles under `RunControl::Cycles`).
    pub steady_state: u64,
    /// Ramp-down in seconds (cycles under `RunControl::Cycles`).
    pub ramp_down: u64,
    /// Absolute master-clock ms at which workload timing begins.
    /// Stamped by the master during the start protocol; `-1` until then.
    pub bench_start_time: i64,
    /// Seed from which per-worker RNGs derive; makes runs reproducible.
    pub run_seed: u64,
}

impl RunInfo {
    /// End of ramp-up in master ms.
    #[must_use]
    pub fn steady_start_ms(&self) -> i64 {
        self.bench_start_time + (self.ramp_up * 1000) as i64
    }

    /// End of steady state in master ms (exclusive).
    #[must_use]
    pub fn steady_end_ms(&self) -> i64 {
        self.steady_start_ms() + (self.steady_state * 1000) as i64
    }

    /// End of the whole run in master ms.
    #[must_use]
    pub fn run_end_ms(&self) -> i64 {
        self.steady_end_ms() + (self.ramp_down * 1000) as i64
    }
}

/// The parameter repository as written to a run directory: everything a
/// run needs except the identity and trigger time the harness assigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Free-form description shown by the queue listing.
    #[serde(default)]
    pub description: String,
    pub driver_config: DriverConfig,
    pub ramp_up: u64,
    pub steady_state: u64,
    pub ramp_down: u64,
    #[serde(default)]
    pub run_seed: u64,
}

impl RunParams {
    /// Bind these parameters to a minted run id. The trigger time stays
    /// unset until the master runs its start protocol.
    #[must_use]
    pub fn into_run_info(self, run_id: RunId) -> RunInfo {
        RunInfo {
            run_id,
            driver_config: self.driver_config,
            ramp_up: self.ramp_up,
            steady_state: self.steady_state,
            ramp_down: self.ramp_down,
            bench_start_time: -1,
            run_seed: self.run_seed,
        }
    }
}

/// Static description of a deployed benchmark, as the queue sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkDesc {
    /// Short name, the `<bench>` part of run ids.
    pub short_name: String,
    /// File name of the parameter repository inside a run directory.
    pub config_file_name: String,
    /// Free-form description shown by `list`.
    pub description: String,
}
