//! Data model shared by every component: the batch descriptor, the pipeline
//! table, and the effort-level parameter lists that implementations are
//! selected from.

use serde::{Deserialize, Serialize};

/// Where the pixel payload referenced by a batch actually lives. Orthogonal
/// to whether the *core's own* bookkeeping (queues, cache) is mmap- or
/// RAM-backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    Mmap,
    Mem,
}

/// The portable, persistable half of a batch descriptor: everything that is
/// safe to copy into a queue slot and write back out to a backing file.
/// Never carries the pixel payload itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchIdentity {
    pub uuid: String,
    pub pipeline_id: i32,
    pub num_images: i32,
    pub batch_size: i32,
    /// Absolute deadline, seconds since epoch.
    pub priority: i64,
    /// Index of the last module executed; -1 before any module has run.
    pub progress: i32,
    pub storage_mode: StorageMode,
    pub filename: String,
    pub shmid: i32,
}

impl BatchIdentity {
    pub fn is_complete(&self, pipeline_len: usize) -> bool {
        self.progress + 1 == pipeline_len as i32
    }
}

/// A full batch descriptor as it travels through the scheduler: the portable
/// identity plus whatever local binding to pixel data this process currently
/// holds. `data` is reset to `None` every time a batch is enqueued — it is
/// never valid to persist or carry across a process boundary.
#[derive(Clone, Debug)]
pub struct ImageBatch {
    pub identity: BatchIdentity,
    pub data: Option<Vec<u8>>,
}

impl ImageBatch {
    pub fn new(identity: BatchIdentity) -> Self {
        Self {
            identity,
            data: None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.identity.uuid
    }
}

/// Deadline/energy effort tier. `Default` is mutually exclusive with the
/// other three: a module offers either exactly a default implementation, or
/// one-or-more of `Low`/`Medium`/`High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffortLevel {
    Default,
    Low,
    Medium,
    High,
}

/// Named module input, forwarded verbatim to the subordinate that executes
/// an implementation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleParameter {
    pub key: String,
    pub value: ParamValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// One effort-level implementation of a module: the fingerprint seed, static
/// cost hints used when the cache has nothing for this fingerprint, and the
/// name the module registry resolves to an actual callable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleParameterList {
    /// Registry key the subordinate looks up to find the callable.
    pub entry_point: String,
    /// Fingerprint seed for this implementation.
    pub hash: u32,
    /// Static latency cost hint, microseconds. 0 means "use the default".
    pub latency_cost_us: u32,
    /// Static energy cost hint, microwatt-hours. 0.0 means "use the default".
    pub energy_cost_uwh: f32,
    pub parameters: Vec<ModuleParameter>,
}

pub const DEFAULT_EFFORT_LATENCY_US: u32 = 3000;
pub const DEFAULT_EFFORT_ENERGY_UWH: f32 = 3.0;

impl ModuleParameterList {
    pub fn latency_cost(&self) -> u32 {
        if self.latency_cost_us == 0 {
            DEFAULT_EFFORT_LATENCY_US
        } else {
            self.latency_cost_us
        }
    }

    pub fn energy_cost(&self) -> f32 {
        if self.energy_cost_uwh == 0.0 {
            DEFAULT_EFFORT_ENERGY_UWH
        } else {
            self.energy_cost_uwh
        }
    }
}

/// A pipeline stage. Carries either a single `default` implementation, or one
/// or more of `low`/`medium`/`high`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub default: Option<ModuleParameterList>,
    pub low: Option<ModuleParameterList>,
    pub medium: Option<ModuleParameterList>,
    pub high: Option<ModuleParameterList>,
}

impl Module {
    /// A module with only a default implementation skips the heuristic
    /// descent entirely and goes through energy-only admission.
    pub fn is_default_only(&self) -> bool {
        self.default.is_some()
    }

    pub fn implementation(&self, effort: EffortLevel) -> Option<&ModuleParameterList> {
        match effort {
            EffortLevel::Default => self.default.as_ref(),
            EffortLevel::Low => self.low.as_ref(),
            EffortLevel::Medium => self.medium.as_ref(),
            EffortLevel::High => self.high.as_ref(),
        }
    }

    /// The cheapest effort level this module offers among `{High, Medium,
    /// Low}`, preferring High if present, falling back to Medium, then Low.
    /// Only meaningful for non-default-only modules.
    pub fn lowest_available_effort(&self) -> Option<EffortLevel> {
        if self.low.is_some() {
            Some(EffortLevel::Low)
        } else if self.medium.is_some() {
            Some(EffortLevel::Medium)
        } else if self.high.is_some() {
            Some(EffortLevel::High)
        } else {
            None
        }
    }
}

/// An ordered list of modules a batch is processed through. `pipeline_id`
/// selects the pipeline a batch was admitted under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pipeline {
    pub pipeline_id: i32,
    pub modules: Vec<Module>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Result of running a single module implementation inside its subordinate
/// process. A module-defined failure code below 100 is reserved for the
/// module itself; the executor remaps it, codes at or above 100 are passed
/// through verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ModuleOutcome {
    Success(BatchIdentity),
    Failure(u16),
}

/// 32-bit fingerprint input: shape of the batch plus the pipeline it is
/// running under. Hashed together with an implementation's `hash` seed to
/// produce a cache key.
#[derive(Clone, Copy, Debug)]
pub struct BatchShape {
    pub num_images: i32,
    pub batch_size: i32,
    pub pipeline_id: i32,
}

impl From<&BatchIdentity> for BatchShape {
    fn from(identity: &BatchIdentity) -> Self {
        Self {
            num_images: identity.num_images,
            batch_size: identity.batch_size,
            pipeline_id: identity.pipeline_id,
        }
    }
}
