//! End-to-end scenarios exercising the scheduler against an in-memory fake
//! executor, covering the admission/partial/failure/timeout paths and
//! mmap-backed cache durability across a restart.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use dipp_core::battery::{BatteryParams, BatterySim};
use dipp_core::cost_cache::{CostCache, MmapCostCache, RamCostCache};
use dipp_core::error::DippError;
use dipp_core::executor::{ModuleExecutor, SubordinateSpawner};
use dipp_core::interfaces::{BatchStore, EnergyProbe};
use dipp_core::model::{BatchIdentity, ImageBatch, Module, ModuleParameterList, Pipeline, StorageMode};
use dipp_core::pqueue::{PQueue, RamPQueue, MAX_PARTIAL_QUEUE_SIZE, MAX_QUEUE_SIZE};
use dipp_core::scheduler::Scheduler;

struct NullBatchStore;

impl BatchStore for NullBatchStore {
    fn setup(&self, _batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        Ok(())
    }
    fn read(&self, batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        batch.data = Some(vec![]);
        Ok(())
    }
    fn upload(&self, _batch: &ImageBatch) -> dipp_core::DippResult<()> {
        Ok(())
    }
    fn release(&self, _batch: &ImageBatch) -> dipp_core::DippResult<()> {
        Ok(())
    }
}

/// Mirrors `DemoBatchStore`'s shape: `read` fails unless `setup` ran first,
/// so a test can catch an inbox-sourced batch that skipped it.
struct RequireSetupBatchStore {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    uploaded: Mutex<Vec<String>>,
}

impl RequireSetupBatchStore {
    fn new() -> Self {
        Self {
            payloads: Mutex::new(HashMap::new()),
            uploaded: Mutex::new(Vec::new()),
        }
    }
}

impl BatchStore for RequireSetupBatchStore {
    fn setup(&self, batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        self.payloads.lock().unwrap().insert(batch.identity.uuid.clone(), vec![]);
        Ok(())
    }
    fn read(&self, batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        let payloads = self.payloads.lock().unwrap();
        let data = payloads
            .get(&batch.identity.uuid)
            .cloned()
            .ok_or_else(|| DippError::Storage(format!("no payload for {}", batch.identity.uuid)))?;
        batch.data = Some(data);
        Ok(())
    }
    fn upload(&self, batch: &ImageBatch) -> dipp_core::DippResult<()> {
        self.uploaded.lock().unwrap().push(batch.identity.uuid.clone());
        Ok(())
    }
    fn release(&self, _batch: &ImageBatch) -> dipp_core::DippResult<()> {
        Ok(())
    }
}

struct FixedProbe(f32);
impl EnergyProbe for FixedProbe {
    fn sample_uwh(&self) -> Option<f32> {
        Some(self.0)
    }
}

/// A spawner whose subordinate just runs an inline shell script, letting
/// tests script success/failure/timeout without a real module binary.
struct ScriptSpawner {
    script: String,
}

impl SubordinateSpawner for ScriptSpawner {
    fn spawn(&self, _exe_args: &[String]) -> std::io::Result<Child> {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

fn identity(priority: i64) -> BatchIdentity {
    BatchIdentity {
        uuid: "11111111-1111-1111-1111-111111111111".into(),
        pipeline_id: 0,
        num_images: 2,
        batch_size: 512,
        priority,
        progress: -1,
        storage_mode: StorageMode::Mem,
        filename: "f".into(),
        shmid: 0,
    }
}

fn implementation(entry_point: &str, hash: u32, latency_us: u32, energy_uwh: f32) -> ModuleParameterList {
    ModuleParameterList {
        entry_point: entry_point.to_string(),
        hash,
        latency_cost_us: latency_us,
        energy_cost_uwh: energy_uwh,
        parameters: vec![],
    }
}

fn single_default_module_pipeline() -> Pipeline {
    Pipeline {
        pipeline_id: 0,
        modules: vec![Module {
            name: "only".into(),
            default: Some(implementation("only.default", 1, 100, 0.5)),
            low: None,
            medium: None,
            high: None,
        }],
    }
}

fn scheduler_with_script(script: &str, battery_soc: f32) -> Scheduler<ScriptSpawner> {
    Scheduler::new(
        Box::new(RamPQueue::new(MAX_QUEUE_SIZE)),
        Box::new(RamPQueue::new(MAX_PARTIAL_QUEUE_SIZE)),
        Box::new(RamCostCache::new()),
        Arc::new(BatterySim::new(BatteryParams::default(), battery_soc)),
        ModuleExecutor::new(ScriptSpawner {
            script: script.to_string(),
        }),
        Box::new(NullBatchStore),
        Some(Box::new(FixedProbe(0.01))),
        Duration::from_secs(5),
        false,
    )
}

#[test]
fn default_only_module_under_tight_energy_completes() {
    let script = "cat >/dev/null; cat <<'EOF'
{\"uuid\":\"11111111-1111-1111-1111-111111111111\",\"pipeline_id\":0,\"num_images\":2,\"batch_size\":512,\"priority\":0,\"progress\":0,\"storage_mode\":\"Mem\",\"filename\":\"f\",\"shmid\":0}
EOF";
    let mut scheduler = scheduler_with_script(script, 0.9);
    let pipeline = single_default_module_pipeline();
    let batch = ImageBatch::new(identity(9_999_999_999));

    let outcome = scheduler.process(batch, &pipeline);
    assert!(matches!(outcome, dipp_core::scheduler::ProcessOutcome::Complete(_)));
}

#[test]
fn low_battery_prevents_admission_and_batch_stays_partial() {
    let script = "exit 0";
    let mut scheduler = scheduler_with_script(script, 0.0);
    let pipeline = single_default_module_pipeline();
    let batch = ImageBatch::new(identity(9_999_999_999));

    let outcome = scheduler.process(batch, &pipeline);
    assert!(matches!(outcome, dipp_core::scheduler::ProcessOutcome::Partial(_)));
}

#[test]
fn module_failure_is_reported_and_batch_is_dropped() {
    let script = "cat >/dev/null; echo -n 5 >&2; exit 1";
    let mut scheduler = scheduler_with_script(script, 0.9);
    let pipeline = single_default_module_pipeline();
    let batch = ImageBatch::new(identity(9_999_999_999));

    let outcome = scheduler.process(batch, &pipeline);
    match outcome {
        dipp_core::scheduler::ProcessOutcome::Failure(DippError::ModuleExit { code }) => {
            assert_eq!(code, dipp_core::executor::MODULE_EXIT_CUSTOM + 5);
        }
        other => panic!("expected Failure(ModuleExit), got {other:?}"),
    }
}

#[test]
fn module_timeout_is_reported_as_timeout() {
    let script = format!(
        "cat >/dev/null; echo -n {} >&2; exit 1",
        dipp_core::executor::MODULE_EXIT_TIMEOUT
    );
    let mut scheduler = scheduler_with_script(&script, 0.9);
    let pipeline = single_default_module_pipeline();
    let batch = ImageBatch::new(identity(9_999_999_999));

    let outcome = scheduler.process(batch, &pipeline);
    assert!(matches!(
        outcome,
        dipp_core::scheduler::ProcessOutcome::Failure(DippError::ModuleTimeout)
    ));
}

#[test]
fn mmap_cost_cache_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cost.cache");

    {
        let mut cache = MmapCostCache::open(&path).unwrap();
        cache.insert(123, 777, 1.25).unwrap();
    }

    let mut reopened = MmapCostCache::open(&path).unwrap();
    let entry = reopened.lookup(123).unwrap();
    assert_eq!(entry.latency_us, 777);
    assert!((entry.energy_uwh - 1.25).abs() < f32::EPSILON);
}

#[test]
fn inbox_batches_are_set_up_before_they_reach_the_store() {
    let script = "cat >/dev/null; cat <<'EOF'
{\"uuid\":\"11111111-1111-1111-1111-111111111111\",\"pipeline_id\":0,\"num_images\":2,\"batch_size\":512,\"priority\":0,\"progress\":0,\"storage_mode\":\"Mem\",\"filename\":\"f\",\"shmid\":0}
EOF";
    let store = Arc::new(RequireSetupBatchStore::new());
    let mut scheduler = Scheduler::new(
        Box::new(RamPQueue::new(MAX_QUEUE_SIZE)),
        Box::new(RamPQueue::new(MAX_PARTIAL_QUEUE_SIZE)),
        Box::new(RamCostCache::new()),
        Arc::new(BatterySim::new(BatteryParams::default(), 0.9)),
        ModuleExecutor::new(ScriptSpawner {
            script: script.to_string(),
        }),
        Box::new(RequireSetupBatchStoreHandle(Arc::clone(&store))),
        Some(Box::new(FixedProbe(0.01))),
        Duration::from_secs(5),
        false,
    );

    let pipeline = single_default_module_pipeline();
    let (tx, rx) = mpsc::channel();
    tx.send(identity(9_999_999_999)).unwrap();

    scheduler.run_iteration(&rx, std::slice::from_ref(&pipeline));

    assert_eq!(
        store.uploaded.lock().unwrap().as_slice(),
        ["11111111-1111-1111-1111-111111111111"]
    );
}

/// `BatchStore` needs `&self`, so the test shares one `RequireSetupBatchStore`
/// between the assertion and the `Box<dyn BatchStore>` the scheduler owns.
struct RequireSetupBatchStoreHandle(Arc<RequireSetupBatchStore>);

impl BatchStore for RequireSetupBatchStoreHandle {
    fn setup(&self, batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        self.0.setup(batch)
    }
    fn read(&self, batch: &mut ImageBatch) -> dipp_core::DippResult<()> {
        self.0.read(batch)
    }
    fn upload(&self, batch: &ImageBatch) -> dipp_core::DippResult<()> {
        self.0.upload(batch)
    }
    fn release(&self, batch: &ImageBatch) -> dipp_core::DippResult<()> {
        self.0.release(batch)
    }
}

#[test]
fn queue_switches_to_lowest_effort_under_pressure() {
    use dipp_core::heuristic::HeuristicKind;
    let mut ingest = RamPQueue::new(MAX_QUEUE_SIZE);
    for i in 0..30 {
        ingest.enqueue(identity(i as i64)).unwrap();
    }
    let total_depth = ingest.size();
    assert_eq!(HeuristicKind::from_queue_depth(total_depth), HeuristicKind::LowestEffort);
}
