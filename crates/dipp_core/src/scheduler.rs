//! The cooperative scheduling loop: drains the inbox, pulls a batch from
//! whichever queue has work, runs it as far through its pipeline as the
//! current heuristic allows, and either uploads it or re-enqueues it.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::battery::BatterySim;
use crate::cost_cache::CostCache;
use crate::error::DippError;
use crate::executor::{ModuleExecutor, SubordinateSpawner};
use crate::heuristic::{Budget, HeuristicKind, HeuristicResult};
use crate::interfaces::{BatchStore, EnergyProbe};
use crate::model::{BatchIdentity, BatchShape, ImageBatch, Pipeline};
use crate::pqueue::{PQueue, MAX_PARTIAL_QUEUE_SIZE};

fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Outcome of running a batch as far as it can currently go.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Ran to the end of its pipeline; the caller should upload and release.
    Complete(ImageBatch),
    /// Stopped partway through; the caller should re-enqueue onto `partial`.
    Partial(BatchIdentity),
    /// A module execution failed; the attempt is dropped.
    Failure(DippError),
}

pub struct Scheduler<S: SubordinateSpawner> {
    pub ingest: Box<dyn PQueue>,
    pub partial: Box<dyn PQueue>,
    pub cache: Box<dyn CostCache>,
    pub battery: Arc<BatterySim>,
    pub executor: ModuleExecutor<S>,
    pub batch_store: Box<dyn BatchStore>,
    pub energy_probe: Option<Box<dyn EnergyProbe>>,
    pub module_timeout: Duration,
    pub cleanup_after_upload: bool,
    heuristic: HeuristicKind,
    /// Mirrors `dipp_config.c`'s `is_setup` flag: flipped false whenever a
    /// module execution fails, flipped back true the next time
    /// `ensure_config_loaded` runs.
    config_loaded: bool,
}

impl<S: SubordinateSpawner> Scheduler<S> {
    pub fn new(
        ingest: Box<dyn PQueue>,
        partial: Box<dyn PQueue>,
        cache: Box<dyn CostCache>,
        battery: Arc<BatterySim>,
        executor: ModuleExecutor<S>,
        batch_store: Box<dyn BatchStore>,
        energy_probe: Option<Box<dyn EnergyProbe>>,
        module_timeout: Duration,
        cleanup_after_upload: bool,
    ) -> Self {
        Self {
            ingest,
            partial,
            cache,
            battery,
            executor,
            batch_store,
            energy_probe,
            module_timeout,
            cleanup_after_upload,
            heuristic: HeuristicKind::BestEffort,
            config_loaded: true,
        }
    }

    fn queue_depth(&self) -> usize {
        self.ingest.size() + self.partial.size()
    }

    /// Re-derives the active heuristic from current queue depths, logging
    /// whenever it changes.
    pub fn update_heuristic(&mut self) {
        let previous = self.heuristic;
        self.heuristic = HeuristicKind::from_queue_depth(self.queue_depth());
        if previous != self.heuristic {
            info!(heuristic = ?self.heuristic, "heuristic changed");
        }
    }

    /// Marks the pipeline/module configuration cache stale. Called whenever
    /// a module execution fails, since the failure may mean the config that
    /// drove it is broken or out of date.
    fn invalidate_config(&mut self) {
        self.config_loaded = false;
    }

    /// Idempotent rebuild, run once per iteration before dispatch. Pipeline
    /// and module tables are supplied by the caller rather than loaded from
    /// disk here, so the rebuild itself is a no-op; the flag's
    /// invalidate-then-rebuild contract is what downstream config-ingestion
    /// hooks into.
    fn ensure_config_loaded(&mut self) {
        if !self.config_loaded {
            debug!("rebuilding pipeline/module configuration cache");
            self.config_loaded = true;
        }
    }

    /// Drains the inbox non-blockingly: materializes each batch's storage via
    /// `BatchStore::setup`, then enqueues it onto the ingest queue.
    pub fn drain_inbox(&mut self, inbox: &Receiver<BatchIdentity>) {
        while let Ok(identity) = inbox.try_recv() {
            let mut batch = ImageBatch::new(identity);
            if let Err(e) = self.batch_store.setup(&mut batch) {
                warn!(error = %e, uuid = batch.uuid(), "failed to set up storage for inbound batch");
                continue;
            }
            match self.ingest.enqueue(batch.identity) {
                Ok(()) => {}
                Err(DippError::QueueFull) => {
                    warn!("ingest queue full, dropping inbound batch");
                    break;
                }
                Err(e) => warn!(error = %e, "failed to enqueue inbound batch"),
            }
        }
    }

    fn energy_cost_for(&self, static_cost_uwh: f32) -> f32 {
        self.energy_probe
            .as_ref()
            .and_then(|probe| probe.sample_uwh())
            .unwrap_or(static_cost_uwh)
    }

    /// Runs a batch as far through `pipeline` as the current heuristic
    /// allows, starting from `batch.identity.progress + 1`.
    pub fn process(&mut self, mut batch: ImageBatch, pipeline: &Pipeline) -> ProcessOutcome {
        debug!(uuid = batch.uuid(), progress = batch.identity.progress, "processing batch");

        loop {
            let next_index = (batch.identity.progress + 1) as usize;
            if next_index >= pipeline.len() {
                break;
            }
            let module = &pipeline.modules[next_index];
            let modules_left = pipeline.len() - next_index;
            let budget = Budget::from_batch(
                batch.identity.priority,
                now_s(),
                modules_left,
                self.battery.current_energy_wh(),
                self.battery.safety_margin(),
            );
            let shape = BatchShape::from(&batch.identity);

            let judged = self.heuristic.select(self.cache.as_mut(), module, shape, budget);
            let Some(judged) = judged else {
                debug!(module = module.name, "no affordable implementation, stopping partway");
                return ProcessOutcome::Partial(batch.identity);
            };
            if judged.result == HeuristicResult::NotFound {
                return ProcessOutcome::Partial(batch.identity);
            }

            let implementation = match module.implementation(judged.effort) {
                Some(i) => i,
                None => return ProcessOutcome::Partial(batch.identity),
            };

            let start = Instant::now();
            let outcome = self.executor.execute(
                &implementation.entry_point,
                &batch.identity,
                implementation,
                self.module_timeout,
            );

            let updated_identity = match outcome {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(error = %e, module = module.name, "module execution failed, invalidating cache config");
                    self.invalidate_config();
                    // TODO(retry): requeue with a bounded retry counter instead of dropping.
                    return ProcessOutcome::Failure(e);
                }
            };

            if judged.result == HeuristicResult::FoundNotCached {
                let elapsed_us = start.elapsed().as_micros().min(u32::MAX as u128) as u32;
                let energy_uwh = self.energy_cost_for(implementation.energy_cost());
                if let Err(e) = self.cache.insert(judged.fingerprint, elapsed_us, energy_uwh) {
                    warn!(error = %e, "failed to insert cost cache entry");
                }
                self.battery
                    .apply_load(energy_uwh * crate::battery::STEPS_PER_UPDATE as f32);
            }

            batch.identity = updated_identity;
            batch.identity.progress = next_index as i32;
        }

        if batch.identity.is_complete(pipeline.len()) {
            ProcessOutcome::Complete(batch)
        } else {
            ProcessOutcome::Partial(batch.identity)
        }
    }

    /// Runs the full per-batch bookkeeping `process_images_loop` does around
    /// a single `process()` call: cache/heuristic refresh, dispatch, then
    /// either upload-and-release or re-enqueue onto `partial`.
    pub fn handle_batch(&mut self, batch: ImageBatch, pipeline: &Pipeline) {
        self.ensure_config_loaded();
        self.update_heuristic();

        match self.process(batch, pipeline) {
            ProcessOutcome::Complete(mut batch) => {
                if let Err(e) = self.batch_store.read(&mut batch) {
                    warn!(error = %e, "failed to read completed batch data");
                    return;
                }
                if let Err(e) = self.batch_store.upload(&batch) {
                    warn!(error = %e, "failed to upload completed batch");
                    return;
                }
                if let Err(e) = self.batch_store.release(&batch) {
                    warn!(error = %e, "failed to release completed batch");
                }
                if self.cleanup_after_upload {
                    debug!(uuid = batch.uuid(), "cleanup_after_upload: best-effort delete requested");
                }
                info!(uuid = batch.uuid(), "batch fully processed and uploaded");
            }
            ProcessOutcome::Partial(identity) => {
                info!(uuid = identity.uuid, progress = identity.progress, "batch partially processed");
                if let Err(e) = self.partial.enqueue(identity) {
                    warn!(error = %e, "failed to enqueue onto partial queue");
                }
            }
            ProcessOutcome::Failure(e) => {
                warn!(error = %e, "batch dropped after module failure");
            }
        }
    }

    /// One iteration of the main loop: drain the inbox, then process up to
    /// two batches (partial preferred, then ingest), matching the reference
    /// process's exact two-batches-per-iteration shape including its
    /// early-continue when the second `ingest.dequeue()` comes up empty.
    pub fn run_iteration(&mut self, inbox: &Receiver<BatchIdentity>, pipelines: &[Pipeline]) {
        self.drain_inbox(inbox);

        let first = self.partial.dequeue().or_else(|| self.ingest.dequeue());
        let Some(identity) = first else {
            std::thread::sleep(Duration::from_millis(1));
            return;
        };

        if let Some(pipeline) = pipelines.iter().find(|p| p.pipeline_id == identity.pipeline_id) {
            self.handle_batch(ImageBatch::new(identity), pipeline);
        } else {
            warn!(pipeline_id = identity.pipeline_id, "unknown pipeline id, dropping batch");
        }

        if self.partial.size() < MAX_PARTIAL_QUEUE_SIZE {
            let Some(second) = self.ingest.dequeue() else {
                std::thread::sleep(Duration::from_millis(1));
                return;
            };
            if let Some(pipeline) = pipelines.iter().find(|p| p.pipeline_id == second.pipeline_id) {
                self.handle_batch(ImageBatch::new(second), pipeline);
            } else {
                warn!(pipeline_id = second.pipeline_id, "unknown pipeline id, dropping batch");
            }
        }
    }

    pub fn run_forever(&mut self, inbox: &Receiver<BatchIdentity>, pipelines: &[Pipeline]) -> ! {
        loop {
            self.run_iteration(inbox, pipelines);
        }
    }
}
