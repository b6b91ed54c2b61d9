mod demo;

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};

use dipp_core::battery::BatterySim;
use dipp_core::config::DippConfig;
use dipp_core::cost_cache::{CostCache, MmapCostCache, RamCostCache};
use dipp_core::executor::{run_subordinate, ModuleExecutor, ProcessSpawner, SUBORDINATE_ARG};
use dipp_core::interfaces::ModuleRegistry;
use dipp_core::model::StorageMode;
use dipp_core::pqueue::{MmapPQueue, PQueue, RamPQueue, MAX_PARTIAL_QUEUE_SIZE, MAX_QUEUE_SIZE};
use dipp_core::scheduler::Scheduler;

use demo::{demo_pipelines, DemoBatchStore, DemoEnergyProbe, DemoModuleRegistry};

#[derive(Parser)]
#[command(name = "dipp", about = "Deadline- and energy-aware batch scheduling core")]
struct Cli {
    #[command(flatten)]
    config: DippConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop against the demo collaborators and a synthetic pipeline table.
    Run {
        /// Stop after this many iterations (0 means run forever).
        #[arg(long, default_value_t = 0)]
        iterations: u64,
        /// Wall-clock timeout given to each module subordinate.
        #[arg(long, default_value_t = 2000)]
        module_timeout_ms: u64,
    },
    /// Report current battery SoC, queue depths, and the active heuristic.
    Status,
}

fn local_data_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".dipp");
    if let Err(e) = std::fs::create_dir_all(&path) {
        tracing::warn!(error = %e, "could not create local data dir, falling back to current directory");
        return PathBuf::from(".");
    }
    path
}

fn resolve_data_paths(config: &mut DippConfig) {
    if config.queue_dir == "/usr/share/dipp" && !PathBuf::from(&config.queue_dir).exists() {
        let dir = local_data_dir();
        config.queue_dir = dir.to_string_lossy().into_owned();
        config.cache_path = dir.join("cost.cache").to_string_lossy().into_owned();
    }
}

fn open_ingest_queue(config: &DippConfig) -> Box<dyn PQueue> {
    match config.storage_mode() {
        StorageMode::Mem => Box::new(RamPQueue::new(MAX_QUEUE_SIZE)),
        StorageMode::Mmap => {
            Box::new(MmapPQueue::open(&PathBuf::from(config.ingest_queue_path()), MAX_QUEUE_SIZE).expect("open ingest queue"))
        }
    }
}

fn open_partial_queue(config: &DippConfig) -> Box<dyn PQueue> {
    match config.storage_mode() {
        StorageMode::Mem => Box::new(RamPQueue::new(MAX_PARTIAL_QUEUE_SIZE)),
        StorageMode::Mmap => Box::new(
            MmapPQueue::open(&PathBuf::from(config.partial_queue_path()), MAX_PARTIAL_QUEUE_SIZE)
                .expect("open partial queue"),
        ),
    }
}

fn open_cost_cache(config: &DippConfig) -> Box<dyn CostCache> {
    match config.storage_mode() {
        StorageMode::Mem => Box::new(RamCostCache::new()),
        StorageMode::Mmap => Box::new(MmapCostCache::open(&PathBuf::from(&config.cache_path)).expect("open cost cache")),
    }
}

/// Spawns the battery's own cooperative unit: a background thread that
/// advances the simulated orbit clock on `battery::UPDATE_PERIOD` cadence,
/// independent of the scheduler loop.
fn spawn_battery_tick(battery: Arc<BatterySim>) {
    std::thread::spawn(move || loop {
        std::thread::sleep(dipp_core::battery::UPDATE_PERIOD);
        battery.step();
    });
}

fn run(mut config: DippConfig, iterations: u64, module_timeout_ms: u64) {
    config.apply_env_overrides();
    resolve_data_paths(&mut config);

    let ingest = open_ingest_queue(&config);
    let partial = open_partial_queue(&config);
    let cache = open_cost_cache(&config);
    let battery = Arc::new(BatterySim::new(config.battery_params(), 0.7));
    spawn_battery_tick(Arc::clone(&battery));
    let executor = ModuleExecutor::new(ProcessSpawner);
    let batch_store = Box::new(DemoBatchStore::new());
    let energy_probe: Option<Box<dyn dipp_core::interfaces::EnergyProbe>> =
        Some(Box::new(DemoEnergyProbe { reading_uwh: 2.0 }));

    let mut scheduler = Scheduler::new(
        ingest,
        partial,
        cache,
        battery,
        executor,
        batch_store,
        energy_probe,
        Duration::from_millis(module_timeout_ms),
        config.cleanup_after_upload,
    );

    let (tx, rx) = mpsc::channel();
    let pipelines = demo_pipelines();
    seed_demo_batches(&tx, &pipelines);

    info!(storage_mode = ?config.storage_mode(), "scheduler starting");

    if iterations == 0 {
        scheduler.run_forever(&rx, &pipelines);
    } else {
        for _ in 0..iterations {
            scheduler.run_iteration(&rx, &pipelines);
        }
    }
}

fn seed_demo_batches(tx: &mpsc::Sender<dipp_core::model::BatchIdentity>, pipelines: &[dipp_core::model::Pipeline]) {
    use dipp_core::model::BatchIdentity;
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let pipeline_id = pipelines.first().map(|p| p.pipeline_id).unwrap_or(0);

    for i in 0..4 {
        let identity = BatchIdentity {
            uuid: format!("00000000-0000-0000-0000-{i:012}"),
            pipeline_id,
            num_images: 4,
            batch_size: 4096,
            priority: now + 5,
            progress: -1,
            storage_mode: StorageMode::Mem,
            filename: format!("demo-batch-{i}.bin"),
            shmid: 0,
        };
        let _ = tx.send(identity);
    }
}

fn status(mut config: DippConfig) {
    config.apply_env_overrides();
    resolve_data_paths(&mut config);

    match config.storage_mode() {
        StorageMode::Mem => {
            info!(status = "NO_PERSISTED_STATE", "RAM storage mode keeps no state across runs");
        }
        StorageMode::Mmap => {
            let ingest = MmapPQueue::open(&PathBuf::from(config.ingest_queue_path()), MAX_QUEUE_SIZE);
            let partial = MmapPQueue::open(&PathBuf::from(config.partial_queue_path()), MAX_PARTIAL_QUEUE_SIZE);
            match (ingest, partial) {
                (Ok(ingest), Ok(partial)) => {
                    info!(
                        ingest_depth = ingest.size(),
                        partial_depth = partial.size(),
                        heuristic = ?config.heuristic_kind(),
                        "scheduler status"
                    );
                }
                _ => info!(status = "NOT_INITIALIZED", "no persisted queue files found yet"),
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some(SUBORDINATE_ARG) {
        let registry = DemoModuleRegistry::new();
        run_subordinate(&registry as &dyn ModuleRegistry);
    }

    tracing_subscriber::fmt()
        .json()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            iterations,
            module_timeout_ms,
        } => run(cli.config, iterations, module_timeout_ms),
        Commands::Status => status(cli.config),
    }
}
