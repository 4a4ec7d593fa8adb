//! Pure data model for the drover harness.
//!
//! Everything in this crate is deliberately **pure computation** (no I/O,
//! no clocks, no threads) so it can be shared between the queue, the
//! master, the agents, and unit tests. Values that cross a process
//! boundary are serde-serializable.

pub mod cycle;
pub mod mix;
pub mod run;
pub mod seq;

pub use cycle::{CycleSpec, CycleType, Delay};
pub use mix::{MixSelector, MixSpec};
pub use run::{
    BenchmarkDesc, DriverConfig, OperationDef, RunControl, RunInfo, RunParams, Timing,
};
pub use seq::{RunId, SeqToken};
