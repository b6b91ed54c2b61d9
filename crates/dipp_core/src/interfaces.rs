//! External collaborators this core depends on but does not implement:
//! durable batch storage/upload, the real telemetry channel, and dynamic
//! module loading. Kept at the interface only, as the data flow and
//! scheduling logic only ever need to call through these traits.

use crate::error::DippResult;
use crate::model::{ImageBatch, ModuleOutcome, ModuleParameterList};

/// Durable storage and release path for batch pixel data. `setup` binds an
/// incoming descriptor to its local storage handle; `read` materializes the
/// pixel payload into `batch.data`; `upload` ships a completed batch out;
/// `release` frees whatever local resources `setup` acquired.
pub trait BatchStore: Send + Sync {
    fn setup(&self, batch: &mut ImageBatch) -> DippResult<()>;
    fn read(&self, batch: &mut ImageBatch) -> DippResult<()>;
    fn upload(&self, batch: &ImageBatch) -> DippResult<()>;
    fn release(&self, batch: &ImageBatch) -> DippResult<()>;
}

/// The real telemetry channel for measuring actual energy draw. Not every
/// deployment has one wired up; the scheduler falls back to a module's
/// static `energy_cost_uwh` hint whenever this returns `None`.
pub trait EnergyProbe: Send + Sync {
    fn sample_uwh(&self) -> Option<f32>;
}

/// Resolves an implementation's `entry_point` name to a callable. Lookups
/// happen both in the scheduler process (to know a callable exists before
/// spawning a subordinate) and inside the subordinate itself (to actually
/// run it).
pub trait ModuleRegistry: Send + Sync {
    fn lookup(&self, entry_point: &str) -> Option<ProcessFunction>;
}

/// A single module implementation's entry point. Returns the processed batch
/// on success, or a module-defined error code on failure — the Rust
/// replacement for an out-parameter error channel, since a `Result` already
/// carries which of the two happened.
pub type ProcessFunction = fn(&ImageBatch, &ModuleParameterList) -> ModuleOutcome;
