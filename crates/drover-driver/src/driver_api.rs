//! The seam between the engine and user benchmark code.
//!
//! A [`Driver`] is one virtual user's view of the benchmark: the engine
//! creates one instance per worker from a registered factory and calls
//! `operate` once per cycle with the selected operation index. Drivers
//! are resolved by name through the [`DriverRegistry`], so an agent
//! process can reconstruct a workload from a `RunInfo` alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use drover_error::{DroverError, Result};

use crate::context::DriverContext;

/// How an operation invocation went wrong.
#[derive(Debug)]
pub enum OperationError {
    /// The run cannot continue. Logged once, aborts the whole run.
    Fatal { detail: String },
    /// This invocation failed; the run continues and the failure is
    /// counted if it fell in steady state.
    Failed { detail: String },
    /// The operation's I/O was cut by run teardown. Graceful when the
    /// worker is stopping, fatal otherwise.
    Interrupted,
}

impl OperationError {
    /// Create a fatal error.
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal {
            detail: detail.into(),
        }
    }

    /// Create an ordinary failure.
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal { detail } => write!(f, "fatal: {detail}"),
            Self::Failed { detail } => write!(f, "failed: {detail}"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

impl std::error::Error for OperationError {}

/// User benchmark code driven by one worker.
pub trait Driver: Send {
    /// Invoke the operation at `op` in the driver's operation table.
    fn operate(&mut self, op: usize, cx: &mut DriverContext)
        -> std::result::Result<(), OperationError>;

    /// Once-before hook; run by worker 0 alone before the pool enters
    /// the workload.
    fn once_before(
        &mut self,
        _cx: &mut DriverContext,
    ) -> std::result::Result<(), OperationError> {
        Ok(())
    }

    /// Once-after hook; run by worker 0 alone after every worker has
    /// finished its workload.
    fn once_after(&mut self, _cx: &mut DriverContext) -> std::result::Result<(), OperationError> {
        Ok(())
    }
}

/// Factory producing one fresh [`Driver`] per worker.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Name → factory table an agent consults when configured.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory under a name. Replaces any previous
    /// registration of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate a driver by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DroverError::DriverNotFound {
                name: name.to_owned(),
            })?;
        Ok(factory())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;

    impl Driver for NoopDriver {
        fn operate(
            &mut self,
            _op: usize,
            cx: &mut DriverContext,
        ) -> std::result::Result<(), OperationError> {
            cx.record_time();
            cx.record_time();
            Ok(())
        }
    }

    #[test]
    fn registry_creates_registered_drivers() {
        let mut registry = DriverRegistry::new();
        registry.register("noop", || Box::new(NoopDriver));
        assert!(registry.contains("noop"));
        assert!(registry.create("noop").is_ok());
    }

    #[test]
    fn unknown_driver_is_an_error() {
        let registry = DriverRegistry::new();
        let err = match registry.create("ghost") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, DroverError::DriverNotFound { name } if name == "ghost"));
    }
}
