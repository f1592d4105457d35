//! The buffering and forwarding pipeline.
//!
//! Two workers share one state:
//!
//! - **ingestion** drains the queue into the store, running the overflow
//!   chain whenever the quota blocks an insert;
//! - **transmission** paces itself with the rate controller, packages a batch
//!   of stored samples into an archive and uploads it, deleting the shipped
//!   records only after the upload succeeded.
//!
//! The host drives the pipeline through [`Pipeline`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::archive::{Archive, ArchiveError};
use crate::config::Config;
use crate::connection::Connectivity;
use crate::events::{EventBus, PipelineEvent};
use crate::overflow::{
    insert_with_overflow, InsertError, InsertOutcome, OverflowChain, OverflowChainSpec,
    OverflowContext,
};
use crate::protocol::{ProtocolError, UploadProtocol};
use crate::queue::{EventQueue, QueueError};
use crate::rate::{RateBounds, RateController};
use crate::sample::{DeviceMetadata, Sample};
use crate::store::{OrderingPolicy, SampleStore, StoreError, StoreQuota};
use crate::transport::{Transport, TransportConfig, TransportError};
use crate::worker::{Interrupted, Shutdown, StopOutcome, WorkError, WorkOutcome, WorkUnit, Worker};

/// Grace period for workers to stop on [`Pipeline::pause`].
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Most samples moved from the queue into the store in one insert.
const INGEST_CHUNK: usize = 100;

/// Fill ratio at which the "nearly full" event fires.
const NEARLY_FULL_RATIO: f64 = 0.9;

/// Lower bound on the spacing between two transmission attempts.
const MIN_ATTEMPT_SPACING: Duration = Duration::from_secs(1);

/// Errors raised while assembling a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to open sample store: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A batch submission rejected part way through.
#[derive(Debug, thiserror::Error)]
#[error("{source} after accepting {accepted} samples")]
pub struct SubmitError {
    pub accepted: usize,
    #[source]
    pub source: QueueError,
}

/// Snapshot of pipeline state for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub record_count: u64,
    /// Records inserted since the last resume
    pub saved_record_count: u64,
    /// Records uploaded and removed since the last resume
    pub transmitted_record_count: u64,
    pub store_size_bytes: u64,
    pub quota_bytes: u64,
    /// Samples waiting in the ingestion queue
    pub queued: usize,
    pub ingestion_halted: bool,
    pub has_pending_archive: bool,
    pub last_error: Option<String>,
}

/// An archive whose upload failed, kept for the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingArchive {
    pub archive: Archive,
    /// Store ids of the records inside the archive
    pub ids: Vec<u64>,
    /// Samples actually packaged
    pub samples: usize,
}

/// Configuration-derived parts, swapped as a whole on reconfigure.
struct Runtime {
    overflow: OverflowChain,
    transport: Arc<Transport>,
    settings: TransportConfig,
}

impl Runtime {
    fn build(
        overflow: &OverflowChainSpec,
        settings: TransportConfig,
        protocol: Option<&Arc<dyn UploadProtocol>>,
    ) -> Self {
        let transport = match protocol {
            Some(protocol) => Transport::with_protocol(&settings, protocol.clone()),
            None => Transport::new(&settings),
        };
        Self {
            overflow: OverflowChain::from_spec(overflow),
            transport: Arc::new(transport),
            settings,
        }
    }
}

struct Shared {
    queue: EventQueue<Sample>,
    store: Mutex<SampleStore>,
    runtime: RwLock<Arc<Runtime>>,
    rate: Mutex<RateController>,
    events: EventBus,
    connectivity: Arc<dyn Connectivity>,
    protocol_override: Option<Arc<dyn UploadProtocol>>,
    device: DeviceMetadata,

    halted: AtomicBool,
    transmit_now: AtomicBool,
    /// Set while pausing; no new transmission attempt starts
    draining: AtomicBool,
    uploading: watch::Sender<bool>,
    wake: Notify,
    nearly_full: AtomicBool,

    pending_batch: Mutex<Option<Vec<Sample>>>,
    pending_archive: Mutex<Option<PendingArchive>>,
    last_attempt: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,

    saved: AtomicU64,
    transmitted: AtomicU64,
}

impl Shared {
    fn runtime(&self) -> Arc<Runtime> {
        self.runtime.read().clone()
    }

    fn build_runtime(&self, overflow: &OverflowChainSpec, settings: TransportConfig) -> Runtime {
        Runtime::build(overflow, settings, self.protocol_override.as_ref())
    }

    /// Publish the "nearly full" event on the rising edge of the threshold.
    fn check_fill_level(&self) {
        let (size_bytes, max_bytes, ratio) = {
            let store = self.store.lock();
            (store.size_bytes(), store.quota().max_bytes, store.fill_ratio())
        };

        if ratio >= NEARLY_FULL_RATIO {
            if !self.nearly_full.swap(true, Ordering::SeqCst) {
                self.events.publish(PipelineEvent::DatabaseNearlyFull {
                    size_bytes,
                    max_bytes,
                });
            }
        } else {
            self.nearly_full.store(false, Ordering::SeqCst);
        }
    }

    fn halt_ingestion(&self, parked: Vec<Sample>) {
        let pending_samples = parked.len();
        *self.pending_batch.lock() = Some(parked);
        self.halted.store(true, Ordering::SeqCst);
        self.events
            .publish(PipelineEvent::IngestionHalted { pending_samples });
    }

    fn record_failure(&self, reason: String) {
        *self.last_error.lock() = Some(reason.clone());
        self.events
            .publish(PipelineEvent::TransmissionFailed { reason });
    }

    fn mark_attempt(&self) {
        *self.last_attempt.lock() = Some(Instant::now());
    }

    /// Time left before the next attempt may start.
    fn cooldown(&self, min_interval: Duration) -> Option<Duration> {
        let spacing = min_interval.max(MIN_ATTEMPT_SPACING);
        let last = (*self.last_attempt.lock())?;
        let remaining = spacing.saturating_sub(last.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Sleep for `duration`, returning early when woken.
    async fn idle(&self, duration: Duration, shutdown: &Shutdown) -> Result<(), Interrupted> {
        tokio::select! {
            _ = shutdown.triggered() => Err(Interrupted),
            _ = self.wake.notified() => Ok(()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Moves queued samples into the store.
#[derive(Clone)]
struct IngestionWork {
    shared: Arc<Shared>,
}

impl IngestionWork {
    /// Insert one sample at a time; used when a batch exceeds the whole quota.
    async fn store_individually(
        &self,
        chain: &OverflowChain,
        ctx: &OverflowContext<'_>,
        batch: Vec<Sample>,
    ) -> Result<WorkOutcome, WorkError> {
        let shared = &self.shared;

        for (i, sample) in batch.iter().enumerate() {
            let outcome = match insert_with_overflow(chain, ctx, std::slice::from_ref(sample)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    *shared.pending_batch.lock() = Some(batch[i..].to_vec());
                    return Err(insert_error(e));
                }
            };

            match outcome {
                InsertOutcome::Stored => {
                    shared.saved.fetch_add(1, Ordering::SeqCst);
                }
                InsertOutcome::Oversized => {
                    error!(
                        device_id = %sample.device_id,
                        timestamp = sample.timestamp,
                        "Sample larger than the whole store quota, dropping"
                    );
                }
                InsertOutcome::Unresolved => {
                    shared.halt_ingestion(batch[i..].to_vec());
                    return Ok(WorkOutcome::Terminate);
                }
            }
        }

        shared.check_fill_level();
        Ok(WorkOutcome::Continue)
    }
}

fn insert_error(e: InsertError) -> WorkError {
    match e {
        InsertError::Interrupted => WorkError::Interrupted,
        InsertError::Store(e) => WorkError::Failed(Box::new(e)),
    }
}

#[async_trait]
impl WorkUnit for IngestionWork {
    fn name(&self) -> &'static str {
        "ingestion"
    }

    async fn do_work(&mut self, shutdown: &Shutdown) -> Result<WorkOutcome, WorkError> {
        let shared = &self.shared;

        let parked = shared.pending_batch.lock().take();
        let batch = match parked {
            Some(batch) => {
                debug!(samples = batch.len(), "Retrying parked batch");
                batch
            }
            None => shared.queue.dequeue_many(INGEST_CHUNK, shutdown).await?,
        };
        if batch.is_empty() {
            return Ok(WorkOutcome::Continue);
        }

        let runtime = shared.runtime();
        let ctx = OverflowContext {
            store: &shared.store,
            events: &shared.events,
            halted: &shared.halted,
            shutdown,
        };

        match insert_with_overflow(&runtime.overflow, &ctx, &batch).await {
            Ok(InsertOutcome::Stored) => {
                shared.saved.fetch_add(batch.len() as u64, Ordering::SeqCst);
                debug!(samples = batch.len(), "Samples stored");
                shared.check_fill_level();
                Ok(WorkOutcome::Continue)
            }
            Ok(InsertOutcome::Oversized) => {
                warn!(
                    samples = batch.len(),
                    "Batch exceeds the store quota, inserting samples one by one"
                );
                self.store_individually(&runtime.overflow, &ctx, batch).await
            }
            Ok(InsertOutcome::Unresolved) => {
                shared.halt_ingestion(batch);
                Ok(WorkOutcome::Terminate)
            }
            Err(e) => {
                *shared.pending_batch.lock() = Some(batch);
                Err(insert_error(e))
            }
        }
    }
}

/// Marks an upload as in flight until dropped.
struct InFlight<'a>(&'a watch::Sender<bool>);

impl<'a> InFlight<'a> {
    fn start(flag: &'a watch::Sender<bool>) -> Self {
        flag.send_replace(true);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Packages and uploads stored samples.
#[derive(Clone)]
struct TransmissionWork {
    shared: Arc<Shared>,
}

impl TransmissionWork {
    async fn upload(
        &self,
        runtime: &Runtime,
        pending: PendingArchive,
        shutdown: &Shutdown,
    ) -> Result<(), Interrupted> {
        let shared = &self.shared;
        shared.mark_attempt();

        let result = {
            let _in_flight = InFlight::start(&shared.uploading);
            runtime
                .transport
                .upload(shared.connectivity.as_ref(), &pending.archive, shutdown)
                .await
        };

        match result {
            Ok(link) => {
                if let Err(e) = pending.archive.delete() {
                    warn!(archive = %pending.archive.file_name(), error = %e, "Failed to delete uploaded archive");
                }

                let removed = shared.store.lock().remove_ids(&pending.ids);
                match removed {
                    Ok(removed) => {
                        shared
                            .transmitted
                            .fetch_add(removed as u64, Ordering::SeqCst);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to remove uploaded samples, they will be sent again");
                    }
                }

                *shared.last_error.lock() = None;
                debug!(link = link.name(), "Upload finished");
                shared.events.publish(PipelineEvent::TransmissionSucceeded {
                    samples: pending.samples,
                    archive: pending.archive.file_name(),
                });
                shared.check_fill_level();
                Ok(())
            }
            Err(TransportError::Protocol(ProtocolError::Interrupted)) => {
                *shared.pending_archive.lock() = Some(pending);
                Err(Interrupted)
            }
            Err(e) => {
                *shared.pending_archive.lock() = Some(pending);
                shared.record_failure(e.to_string());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WorkUnit for TransmissionWork {
    fn name(&self) -> &'static str {
        "transmission"
    }

    async fn do_work(&mut self, shutdown: &Shutdown) -> Result<WorkOutcome, WorkError> {
        let shared = &self.shared;
        if shared.draining.load(Ordering::SeqCst) {
            shutdown.triggered().await;
            return Err(WorkError::Interrupted);
        }

        let runtime = shared.runtime();
        let forced = shared.transmit_now.swap(false, Ordering::SeqCst);

        if !forced {
            if let Some(remaining) = shared.cooldown(runtime.settings.min_transfer_interval) {
                shared.idle(remaining, shutdown).await?;
                return Ok(WorkOutcome::Continue);
            }
        }

        let pending = shared.pending_archive.lock().take();
        if let Some(pending) = pending {
            debug!(archive = %pending.archive.file_name(), "Retrying pending archive");
            self.upload(&runtime, pending, shutdown).await?;
            return Ok(WorkOutcome::Continue);
        }

        let record_count = shared.store.lock().record_count();
        let (wait, available, max_count) = {
            let mut rate = shared.rate.lock();
            let wait = if forced {
                Duration::ZERO
            } else {
                rate.calculate_wait_time(record_count)
            };
            (wait, rate.available_count(), rate.max_count())
        };

        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, record_count, "Waiting for more samples");
            shared.idle(wait, shutdown).await?;
            return Ok(WorkOutcome::Continue);
        }

        let count = if forced {
            record_count.min(max_count)
        } else {
            available
        };

        if count == 0 {
            shared
                .idle(runtime.settings.min_transfer_interval.max(MIN_ATTEMPT_SPACING), shutdown)
                .await?;
            return Ok(WorkOutcome::Continue);
        }

        let stored = shared
            .store
            .lock()
            .peek_ordered(count as usize, OrderingPolicy::HighestPriorityFirst);
        let ids: Vec<u64> = stored.iter().map(|s| s.id).collect();
        let samples: Vec<Sample> = stored.into_iter().map(|s| s.sample).collect();

        debug!(samples = samples.len(), forced, "Packaging transmission batch");

        let transport = runtime.transport.clone();
        let device = shared.device.refreshed();
        let packaged = tokio::task::spawn_blocking(move || transport.package(samples, &device))
            .await
            .map_err(|e| WorkError::Failed(Box::new(e)))?;

        shared.mark_attempt();
        shared.rate.lock().consume_available_samples();

        match packaged {
            Ok(packaged) => {
                if packaged.dropped > 0 {
                    warn!(dropped = packaged.dropped, "Samples dropped for missing related files");
                }
                let pending = PendingArchive {
                    archive: packaged.archive,
                    ids,
                    samples: packaged.packaged,
                };
                self.upload(&runtime, pending, shutdown).await?;
            }
            Err(TransportError::ArchiveBuild(ArchiveError::NothingToPackage { dropped })) => {
                warn!(dropped, "No sample of the batch could be packaged, discarding it");
                if let Err(e) = shared.store.lock().remove_ids(&ids) {
                    error!(error = %e, "Failed to discard unsendable samples");
                }
            }
            Err(e) => shared.record_failure(e.to_string()),
        }

        Ok(WorkOutcome::Continue)
    }
}

/// Host-facing handle of the pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    ingestion: tokio::sync::Mutex<Worker<IngestionWork>>,
    transmission: tokio::sync::Mutex<Worker<TransmissionWork>>,
}

impl Pipeline {
    /// Open the store under `config.store_dir` and assemble the pipeline.
    ///
    /// Archives left in the work directory by a previous run are deleted;
    /// their samples are still in the store and will be sent again.
    pub fn new(config: &Config, connectivity: Arc<dyn Connectivity>) -> Result<Self, PipelineError> {
        let store = SampleStore::open(&config.store_dir, config.quota)?;
        Self::assemble(store, config, connectivity, None)
    }

    /// Assemble the pipeline around an existing store and upload protocol.
    pub fn with_protocol(
        store: SampleStore,
        config: &Config,
        connectivity: Arc<dyn Connectivity>,
        protocol: Arc<dyn UploadProtocol>,
    ) -> Result<Self, PipelineError> {
        Self::assemble(store, config, connectivity, Some(protocol))
    }

    fn assemble(
        store: SampleStore,
        config: &Config,
        connectivity: Arc<dyn Connectivity>,
        protocol_override: Option<Arc<dyn UploadProtocol>>,
    ) -> Result<Self, PipelineError> {
        let settings = config.transport.clone();
        let rate = RateController::new(settings.min_batch_size, settings.max_batch_size, config.rate);

        let runtime = Runtime::build(&config.overflow, settings, protocol_override.as_ref());
        runtime.transport.builder().cleanup_orphans()?;

        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.queue_capacity),
            store: Mutex::new(store),
            runtime: RwLock::new(Arc::new(runtime)),
            rate: Mutex::new(rate),
            events: EventBus::new(),
            connectivity,
            protocol_override,
            device: DeviceMetadata::collect(config.device_id.clone()),
            halted: AtomicBool::new(false),
            transmit_now: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            uploading: watch::channel(false).0,
            wake: Notify::new(),
            nearly_full: AtomicBool::new(false),
            pending_batch: Mutex::new(None),
            pending_archive: Mutex::new(None),
            last_attempt: Mutex::new(None),
            last_error: Mutex::new(None),
            saved: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
        });

        info!(
            device_id = %config.device_id,
            records = shared.store.lock().record_count(),
            quota_bytes = config.quota.max_bytes,
            "Pipeline assembled"
        );

        Ok(Self {
            ingestion: tokio::sync::Mutex::new(Worker::new(IngestionWork {
                shared: shared.clone(),
            })),
            transmission: tokio::sync::Mutex::new(Worker::new(TransmissionWork {
                shared: shared.clone(),
            })),
            shared,
        })
    }

    /// Enqueue one sample without blocking.
    pub fn submit(&self, sample: Sample) -> Result<(), QueueError> {
        self.shared.queue.enqueue(sample)
    }

    /// Enqueue several samples; stops at the first rejected one.
    pub fn submit_batch(&self, samples: Vec<Sample>) -> Result<usize, SubmitError> {
        let mut accepted = 0;
        for sample in samples {
            self.shared
                .queue
                .enqueue(sample)
                .map_err(|source| SubmitError { accepted, source })?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Apply a new configuration snapshot.
    ///
    /// The quota applies to the next insert, the overflow chain and
    /// transport to the next work unit, and a change of batch size bounds
    /// triggers the rate-change delay.
    pub fn configure(
        &self,
        quota: StoreQuota,
        overflow: OverflowChainSpec,
        rate: RateBounds,
        transport: TransportConfig,
    ) {
        let shared = &self.shared;

        let previous = shared.store.lock().set_quota(quota.max_bytes);
        {
            let mut controller = shared.rate.lock();
            controller.set_bounds(rate);
            controller.set_sample_bounds(transport.min_batch_size, transport.max_batch_size);
        }

        let runtime = shared.build_runtime(&overflow, transport);
        info!(
            previous_quota = previous.max_bytes,
            quota = quota.max_bytes,
            overflow = %runtime.overflow,
            connections = %runtime.transport.connections(),
            protocol = runtime.transport.protocol_name(),
            encrypted = runtime.transport.encryption().is_enabled(),
            "Pipeline reconfigured"
        );
        *shared.runtime.write() = Arc::new(runtime);

        shared.check_fill_level();
        shared.wake.notify_one();
    }

    /// Start a transmission now, regardless of pacing.
    pub fn trigger_transmission(&self) {
        self.shared.transmit_now.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Tell the rate controller the target rate changed.
    pub fn on_rate_changed(&self) {
        self.shared.rate.lock().on_rate_changed();
        self.shared.wake.notify_one();
    }

    pub fn record_count(&self) -> u64 {
        self.shared.store.lock().record_count()
    }

    /// Records inserted since the last [`resume`](Self::resume).
    pub fn saved_record_count(&self) -> u64 {
        self.shared.saved.load(Ordering::SeqCst)
    }

    pub fn has_pending_archive(&self) -> bool {
        self.shared.pending_archive.lock().is_some()
    }

    pub fn is_ingestion_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PipelineStatus {
        let shared = &self.shared;
        let (record_count, store_size_bytes, quota_bytes) = {
            let store = shared.store.lock();
            (store.record_count(), store.size_bytes(), store.quota().max_bytes)
        };

        PipelineStatus {
            record_count,
            saved_record_count: shared.saved.load(Ordering::SeqCst),
            transmitted_record_count: shared.transmitted.load(Ordering::SeqCst),
            store_size_bytes,
            quota_bytes,
            queued: shared.queue.len(),
            ingestion_halted: shared.halted.load(Ordering::SeqCst),
            has_pending_archive: shared.pending_archive.lock().is_some(),
            last_error: shared.last_error.lock().clone(),
        }
    }

    /// Register an event observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Directory where archives are built.
    pub fn work_dir(&self) -> std::path::PathBuf {
        self.shared.runtime().settings.work_dir.clone()
    }

    /// Reset statistics, clear a halt and start both workers.
    pub async fn resume(&self) {
        let shared = &self.shared;

        shared.halted.store(false, Ordering::SeqCst);
        shared.draining.store(false, Ordering::SeqCst);
        shared.saved.store(0, Ordering::SeqCst);
        shared.transmitted.store(0, Ordering::SeqCst);

        let record_count = shared.store.lock().record_count();
        shared.rate.lock().reset(record_count);
        shared.check_fill_level();

        let started_ingestion = self.ingestion.lock().await.start_work();
        let started_transmission = self.transmission.lock().await.start_work();
        info!(
            record_count,
            started_ingestion, started_transmission, "Pipeline resumed"
        );
    }

    /// Stop both workers, waiting up to `grace` for each.
    ///
    /// An upload already in flight gets up to `grace` to finish before the
    /// transmission worker is signalled; no new attempt starts meanwhile. An
    /// upload cut short stays pending and is retried after [`resume`](Self::resume).
    pub async fn pause_within(&self, grace: Duration) -> (StopOutcome, StopOutcome) {
        let shared = &self.shared;
        let ingestion = self.ingestion.lock().await.stop_work(grace).await;

        shared.draining.store(true, Ordering::SeqCst);
        let mut uploading = shared.uploading.subscribe();
        if *uploading.borrow() {
            info!(grace_ms = grace.as_millis() as u64, "Waiting for in-flight upload");
        }
        if tokio::time::timeout(grace, uploading.wait_for(|busy| !*busy))
            .await
            .is_err()
        {
            warn!("In-flight upload did not finish in time, interrupting it");
        }

        let transmission = self.transmission.lock().await.stop_work(grace).await;
        shared.draining.store(false, Ordering::SeqCst);

        let queued = shared.queue.len();
        if queued > 0 {
            warn!(queued, "Pipeline paused with samples still queued");
        }
        info!(?ingestion, ?transmission, "Pipeline paused");
        (ingestion, transmission)
    }

    /// Stop both workers within [`DEFAULT_STOP_GRACE`].
    pub async fn pause(&self) -> (StopOutcome, StopOutcome) {
        self.pause_within(DEFAULT_STOP_GRACE).await
    }

    /// Whether the ingestion and transmission workers are alive.
    pub async fn is_running(&self) -> (bool, bool) {
        (
            self.ingestion.lock().await.is_running(),
            self.transmission.lock().await.is_running(),
        )
    }
}
