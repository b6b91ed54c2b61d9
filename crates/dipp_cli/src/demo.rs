//! Reference stand-ins for the external collaborators the scheduling core
//! treats as pluggable: an in-memory `BatchStore`, a synthetic
//! `EnergyProbe`, a `ModuleRegistry` backed by a handful of toy module
//! implementations, and a small pipeline table to run them through. None of
//! this is meant to be production storage or telemetry; it exists so `dipp
//! run` has something to exercise the scheduler against.

use std::collections::HashMap;
use std::sync::Mutex;

use dipp_core::interfaces::{BatchStore, EnergyProbe, ModuleRegistry, ProcessFunction};
use dipp_core::model::{ImageBatch, ModuleOutcome, ModuleParameterList};
use dipp_core::{DippError, DippResult};

/// Holds the pixel payload for batches admitted through `setup`, keyed by
/// uuid, standing in for real shared-memory/mmap-backed storage.
pub struct DemoBatchStore {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
}

impl DemoBatchStore {
    pub fn new() -> Self {
        Self {
            payloads: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for DemoBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStore for DemoBatchStore {
    fn setup(&self, batch: &mut ImageBatch) -> DippResult<()> {
        let size = batch.identity.batch_size.max(0) as usize;
        self.payloads
            .lock()
            .unwrap()
            .insert(batch.identity.uuid.clone(), vec![0u8; size]);
        batch.data = None;
        Ok(())
    }

    fn read(&self, batch: &mut ImageBatch) -> DippResult<()> {
        let payloads = self.payloads.lock().unwrap();
        let data = payloads
            .get(&batch.identity.uuid)
            .cloned()
            .ok_or_else(|| DippError::Storage(format!("no payload for {}", batch.identity.uuid)))?;
        batch.data = Some(data);
        Ok(())
    }

    fn upload(&self, batch: &ImageBatch) -> DippResult<()> {
        tracing::info!(uuid = batch.uuid(), bytes = batch.data.as_ref().map(|d| d.len()).unwrap_or(0), "uploading batch");
        Ok(())
    }

    fn release(&self, batch: &ImageBatch) -> DippResult<()> {
        self.payloads.lock().unwrap().remove(&batch.identity.uuid);
        Ok(())
    }
}

/// A fixed synthetic reading, standing in for a real telemetry channel.
pub struct DemoEnergyProbe {
    pub reading_uwh: f32,
}

impl EnergyProbe for DemoEnergyProbe {
    fn sample_uwh(&self) -> Option<f32> {
        Some(self.reading_uwh)
    }
}

fn noop_module(batch: &ImageBatch, _config: &ModuleParameterList) -> ModuleOutcome {
    ModuleOutcome::Success(batch.identity.clone())
}

fn flaky_module(batch: &ImageBatch, _config: &ModuleParameterList) -> ModuleOutcome {
    // Deterministic based on uuid length so tests/demo runs are repeatable.
    if batch.identity.uuid.len() % 7 == 0 {
        ModuleOutcome::Failure(3)
    } else {
        ModuleOutcome::Success(batch.identity.clone())
    }
}

pub struct DemoModuleRegistry {
    entries: HashMap<&'static str, ProcessFunction>,
}

impl DemoModuleRegistry {
    pub fn new() -> Self {
        let mut entries: HashMap<&'static str, ProcessFunction> = HashMap::new();
        entries.insert("denoise.default", noop_module as ProcessFunction);
        entries.insert("denoise.low", noop_module as ProcessFunction);
        entries.insert("denoise.medium", noop_module as ProcessFunction);
        entries.insert("denoise.high", noop_module as ProcessFunction);
        entries.insert("compress.low", noop_module as ProcessFunction);
        entries.insert("compress.medium", noop_module as ProcessFunction);
        entries.insert("compress.high", flaky_module as ProcessFunction);
        Self { entries }
    }
}

impl Default for DemoModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry for DemoModuleRegistry {
    fn lookup(&self, entry_point: &str) -> Option<ProcessFunction> {
        self.entries.get(entry_point).copied()
    }
}

/// A small two-module pipeline: a denoise stage with three effort levels,
/// and a compress stage with three effort levels, enough to exercise the
/// best-effort descent and the lowest-effort shortcut.
pub fn demo_pipelines() -> Vec<dipp_core::model::Pipeline> {
    use dipp_core::model::{Module, ModuleParameterList as Params, Pipeline};

    let implementation = |entry_point: &str, hash: u32, latency_us: u32, energy_uwh: f32| Params {
        entry_point: entry_point.to_string(),
        hash,
        latency_cost_us: latency_us,
        energy_cost_uwh: energy_uwh,
        parameters: vec![],
    };

    let denoise = Module {
        name: "denoise".to_string(),
        default: None,
        low: Some(implementation("denoise.low", 1, 500, 0.5)),
        medium: Some(implementation("denoise.medium", 2, 2_000_000, 1.5)),
        high: Some(implementation("denoise.high", 3, 5_000_000, 3.0)),
    };

    let compress = Module {
        name: "compress".to_string(),
        default: None,
        low: Some(implementation("compress.low", 11, 400, 0.3)),
        medium: Some(implementation("compress.medium", 12, 1_500_000, 1.0)),
        high: Some(implementation("compress.high", 13, 4_000_000, 2.0)),
    };

    vec![Pipeline {
        pipeline_id: 0,
        modules: vec![denoise, compress],
    }]
}
