//! The session service tying the caches and the computation jobs together.
//!
//! A [`CubeService`] is created per session. It owns every cache of the engine, registers the
//! sources and regions the client works with, and runs computation jobs on a bounded number of
//! blocking worker threads of the provided runtime.
//!
//! Filling an aggregate never waits for a computation: it returns what is cached right now and
//! makes sure a job is running if that is not good enough. Clients that want to follow a long
//! computation [`subscribe`](CubeService::subscribe) to its partial results instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::channel::mpsc;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::Semaphore;

use crate::caching::{
    Aggregate, AggregateCache, AggregatePayload, ChannelPlaneCache, ChannelSelector, MemoryBudget,
    PolarizationSelector, Requirements, RequirementsChange, RequirementsStore, SourceHandle,
    SourceHandleCache, TileCache, TileData, TileKey,
};
use crate::cancellation::{CancelReason, CancellationController};
use crate::compute::{
    AUTO_BINS, ComputeOptions, ComputeRequest, HistogramSet, JobEnv, JobOutcome, JobState,
    PartialResult, PendingJob, ProgressiveComputer, resolve_bins,
};
use crate::config::Config;
use crate::error::CubeError;
use crate::region::RegionMask;
use crate::source::{CubeShape, Precomputed, SourceOpener};
use crate::tile::{TILE_SIZE, Tile};
use crate::types::{AggregateKey, ChannelOrAll, DataKind, RegionId, SourceId, SourceKey};
use crate::utils::defer::CallOnDrop;

mod jobs;
mod regions;

pub use jobs::{Claim, InFlightJob, JobRegistry};
pub use regions::{RegionRegistry, RegionSnapshot};

/// A snapshot of an aggregate as returned by [`CubeService::fill_aggregate`].
#[derive(Clone, Debug)]
pub struct Fill {
    pub key: AggregateKey,
    /// The latest payload, which may be partial or outdated.
    pub payload: Option<Arc<AggregatePayload>>,
    pub progress: f32,
    pub complete: bool,
    /// Whether the payload was computed for requirements that changed since.
    pub stale: bool,
    /// Whether a computation for the key is in flight.
    pub computing: bool,
}

impl Fill {
    fn cached(aggregate: Aggregate, computing: bool) -> Self {
        Self {
            key: aggregate.key,
            payload: Some(aggregate.payload),
            progress: aggregate.progress,
            complete: aggregate.complete,
            stale: aggregate.invalidated,
            computing,
        }
    }

    fn pending(key: AggregateKey) -> Self {
        Self {
            key,
            payload: None,
            progress: 0.0,
            complete: false,
            stale: false,
            computing: true,
        }
    }

    /// Whether the payload is complete and up to date.
    pub fn is_final(&self) -> bool {
        self.payload.is_some() && self.complete && !self.stale
    }
}

/// A source opened in the session.
#[derive(Debug)]
struct OpenSource {
    key: SourceKey,
    shape: CubeShape,
    planes: ChannelPlaneCache,
    tiles: TileCache,
    /// The id of the handle everything cached for this source was derived from.
    handle_id: AtomicU64,
    /// The `(channel, polarization)` shown by the client.
    current: Mutex<(u32, u32)>,
}

impl OpenSource {
    fn current(&self) -> (u32, u32) {
        *self.current.lock().unwrap()
    }
}

struct Prepared {
    source: Arc<OpenSource>,
    handle: Arc<SourceHandle>,
    request: ComputeRequest,
    generation: u64,
}

struct Inner {
    handles: SourceHandleCache,
    sources: RwLock<HashMap<SourceId, Arc<OpenSource>>>,
    regions: RegionRegistry,
    requirements: RequirementsStore,
    aggregates: Arc<AggregateCache>,
    cancellation: Arc<CancellationController>,
    computer: ProgressiveComputer,
    jobs: JobRegistry,
    budget: Arc<MemoryBudget>,
    tile_capacity: usize,
    permits: Semaphore,
    shutdown_timeout: Duration,
    runtime: tokio::runtime::Handle,
}

/// The caching and aggregation engine of one session.
#[derive(Clone)]
pub struct CubeService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CubeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeService")
            .field("handles", &self.inner.handles)
            .field("aggregates", &self.inner.aggregates.len())
            .field("jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl CubeService {
    /// Creates the service, running its jobs on `runtime`.
    pub fn new(config: &Config, opener: Arc<dyn SourceOpener>, runtime: tokio::runtime::Handle) -> Self {
        let cancellation = CancellationController::new();
        let aggregates = Arc::new(AggregateCache::new(Arc::clone(&cancellation)));
        let caches = &config.caches;
        let inner = Inner {
            handles: SourceHandleCache::new(opener, caches.source_handles as usize),
            sources: RwLock::new(HashMap::new()),
            regions: RegionRegistry::new(Arc::clone(&cancellation)),
            requirements: RequirementsStore::new(Arc::clone(&aggregates)),
            aggregates,
            cancellation,
            computer: ProgressiveComputer::new(ComputeOptions::from(&config.compute)),
            jobs: JobRegistry::new(),
            budget: MemoryBudget::new(caches.full_cube_budget),
            tile_capacity: caches.tiles as usize,
            permits: Semaphore::new(config.compute.max_concurrent_jobs.max(1)),
            shutdown_timeout: config.compute.shutdown_timeout,
            runtime,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Opens a source under `id`, loading its first channel plane.
    ///
    /// Opening an id again with the same key is a no-op, with another key it replaces the
    /// previous source.
    pub fn open_source(&self, id: SourceId, key: SourceKey) -> Result<CubeShape, CubeError> {
        self.inner.check_running()?;
        if let Some(open) = self.inner.sources.read().unwrap().get(&id) {
            if open.key == key {
                return Ok(open.shape);
            }
        }
        self.close_source(id);

        let handle = self.inner.handles.get(&key)?;
        let shape = handle.shape();
        let planes = ChannelPlaneCache::new(shape, &self.inner.budget);
        planes.set_current(&handle, 0, 0)?;

        let open = OpenSource {
            key,
            shape,
            planes,
            tiles: TileCache::new(self.inner.tile_capacity),
            handle_id: AtomicU64::new(handle.id()),
            current: Mutex::new((0, 0)),
        };
        tracing::info!(source = %id, key = %open.key, %shape, mode = ?open.planes.mode(), "opened source");
        self.inner.sources.write().unwrap().insert(id, Arc::new(open));
        Ok(shape)
    }

    /// Closes a source, dropping its regions, requirements and aggregates.
    pub fn close_source(&self, id: SourceId) -> bool {
        let Some(open) = self.inner.sources.write().unwrap().remove(&id) else {
            return false;
        };
        let inner = &self.inner;
        inner.jobs.cancel_where(|key| key.source == id);
        let regions = inner.regions.remove_source(id);
        inner.requirements.remove_source(id);
        let removed = inner.aggregates.remove_source(id);
        inner.computer.forget_source(id);

        let shared = inner
            .sources
            .read()
            .unwrap()
            .values()
            .any(|other| other.key == open.key);
        if !shared {
            inner.handles.remove(&open.key);
        }
        tracing::info!(source = %id, regions = regions.len(), aggregates = removed, "closed source");
        true
    }

    /// The shape of an open source.
    pub fn shape(&self, source: SourceId) -> Result<CubeShape, CubeError> {
        Ok(self.inner.source(source)?.shape)
    }

    /// Defines or redefines a region of a source.
    ///
    /// Redefining a region cancels its running jobs at their next slice boundary, and makes
    /// the aggregates computed for the previous definition unavailable.
    pub fn set_region(&self, region: RegionId, source: SourceId, mask: RegionMask) -> Result<bool, CubeError> {
        self.inner.check_running()?;
        if region.is_whole_image() {
            return Err(CubeError::InvalidRange(format!("{region} cannot be redefined")));
        }
        let open = self.inner.source(source)?;
        mask.validate(&open.shape)?;
        let changed = self.inner.regions.set(region, source, mask);
        if changed {
            let cancelled = self.inner.jobs.cancel_where(|key| key.region == region);
            self.inner.computer.forget_region(region);
            tracing::debug!(%region, %source, cancelled, "region changed");
        }
        Ok(changed)
    }

    /// Removes a region along with its requirements and aggregates.
    pub fn remove_region(&self, region: RegionId) -> bool {
        let Some(source) = self.inner.regions.remove(region) else {
            return false;
        };
        self.inner.jobs.cancel_where(|key| key.region == region);
        self.inner.requirements.remove_region(region);
        self.inner.aggregates.remove_region(region);
        self.inner.computer.forget_region(region);
        tracing::debug!(%region, %source, "removed region");
        true
    }

    /// Selects the channel and polarization the client shows.
    pub fn set_image_channel(&self, source: SourceId, channel: u32, polarization: u32) -> Result<(), CubeError> {
        self.inner.check_running()?;
        let open = self.inner.source(source)?;
        let handle = self.inner.handle(source, &open)?;
        open.planes.set_current(&handle, channel, polarization)?;
        *open.current.lock().unwrap() = (channel, polarization);
        Ok(())
    }

    /// The channel and polarization the client shows.
    pub fn image_channel(&self, source: SourceId) -> Result<(u32, u32), CubeError> {
        Ok(self.inner.source(source)?.current())
    }

    /// Replaces the requirements of one kind for a region.
    ///
    /// Changed requirements cancel the running jobs of that kind and mark their aggregates for
    /// recomputation, while the previous payloads keep being served.
    pub fn set_requirements(
        &self,
        source: SourceId,
        region: RegionId,
        requirements: Requirements,
    ) -> Result<RequirementsChange, CubeError> {
        self.inner.check_running()?;
        let open = self.inner.source(source)?;
        self.inner.check_region(source, region)?;
        validate_requirements(&requirements, &open.shape)?;

        let kind = requirements.kind();
        let change = self.inner.requirements.set(source, region, requirements);
        if change != RequirementsChange::Unchanged {
            let cancelled = self
                .inner
                .jobs
                .cancel_where(|key| key.source == source && key.region == region && key.kind == kind);
            tracing::debug!(%source, %region, %kind, ?change, cancelled, "requirements changed");
        }
        Ok(change)
    }

    /// The key of an aggregate over the channel and polarization currently shown.
    pub fn aggregate_key(&self, source: SourceId, region: RegionId, kind: DataKind) -> Result<AggregateKey, CubeError> {
        let open = self.inner.source(source)?;
        let (channel, polarization) = open.current();
        let channel = match kind {
            DataKind::SpectralSeries => ChannelOrAll::All,
            _ if region == RegionId::CUBE => ChannelOrAll::All,
            _ => ChannelOrAll::Channel(channel),
        };
        Ok(AggregateKey {
            source,
            region,
            kind,
            polarization,
            channel,
        })
    }

    /// The keys of every aggregate the requirements of a region ask for.
    pub fn required_keys(&self, source: SourceId, region: RegionId) -> Result<Vec<AggregateKey>, CubeError> {
        let open = self.inner.source(source)?;
        let Some(requirements) = self.inner.requirements.get(source, region) else {
            return Ok(vec![]);
        };
        let current = open.current();
        let key = |kind, polarization, channel| AggregateKey {
            source,
            region,
            kind,
            polarization,
            channel,
        };
        let plane_channel = |selector: ChannelSelector| match resolve_channel(selector, current) {
            _ if region == RegionId::CUBE => ChannelOrAll::All,
            channel => channel,
        };

        let mut keys = Vec::new();
        for config in &requirements.histograms {
            keys.push(key(DataKind::Histogram, current.1, plane_channel(config.channel)));
        }
        for config in &requirements.spectral {
            let polarization = resolve_polarization(config.polarization, current);
            keys.push(key(DataKind::SpectralSeries, polarization, ChannelOrAll::All));
        }
        for config in &requirements.stats {
            let polarization = resolve_polarization(config.polarization, current);
            keys.push(key(DataKind::Stats, polarization, plane_channel(ChannelSelector::Current)));
        }

        let mut seen = Vec::with_capacity(keys.len());
        keys.retain(|key| {
            let new = !seen.contains(key);
            seen.push(*key);
            new
        });
        Ok(keys)
    }

    /// Returns what is cached for `key` without waiting.
    ///
    /// An absent, partial or outdated aggregate starts a computation if none is running. Whole
    /// image aggregates the source stores itself are read directly instead.
    pub fn fill_aggregate(&self, key: AggregateKey) -> Result<Fill, CubeError> {
        self.fill(key).map(|(fill, _)| fill)
    }

    /// Fills every aggregate the requirements of a region ask for.
    pub fn fill_required(&self, source: SourceId, region: RegionId) -> Result<Vec<Fill>, CubeError> {
        self.required_keys(source, region)?
            .into_iter()
            .map(|key| self.fill_aggregate(key))
            .collect()
    }

    /// Streams the results for `key`.
    ///
    /// The stream starts with the latest available result and ends after the final one, or
    /// early when the computation is cancelled for good.
    pub fn subscribe(&self, key: AggregateKey) -> Result<mpsc::UnboundedReceiver<PartialResult>, CubeError> {
        let (fill, job) = self.fill(key)?;
        if let Some(stream) = job.and_then(|job| job.subscribe()) {
            return Ok(stream);
        }

        // nothing to wait for, hand out what there is
        let (sender, receiver) = mpsc::unbounded();
        let latest = if fill.computing {
            self.inner
                .aggregates
                .lookup(&key)
                .map(|aggregate| (aggregate.payload, aggregate.progress, aggregate.complete))
        } else {
            fill.payload.map(|payload| (payload, fill.progress, fill.complete))
        };
        if let Some((payload, progress, complete)) = latest {
            sender
                .unbounded_send(PartialResult {
                    key,
                    payload,
                    progress,
                    complete,
                })
                .ok();
        }
        Ok(receiver)
    }

    /// Returns a full resolution tile of a channel plane.
    pub fn tile(&self, source: SourceId, tile: Tile, channel: u32, polarization: u32) -> Result<Arc<TileData>, CubeError> {
        self.inner.check_running()?;
        let open = self.inner.source(source)?;
        let shape = open.shape;
        let mip = Tile::layer_to_mip(tile.layer, shape.width, shape.height, TILE_SIZE, TILE_SIZE);
        if tile.encode() < 0 || mip != 1 {
            return Err(CubeError::InvalidRange(format!(
                "tile {tile:?} is not a full resolution tile of {shape}"
            )));
        }
        let handle = self.inner.handle(source, &open)?;
        let key = TileKey {
            x: tile.x as u32,
            y: tile.y as u32,
            channel,
            polarization,
        };
        open.tiles.get(key, &handle)
    }

    /// The state of the job in flight for `key`, if any.
    pub fn job_state(&self, key: &AggregateKey) -> Option<JobState> {
        self.inner.jobs.get(key).map(|job| job.state())
    }

    /// The keys of all jobs in flight.
    pub fn running_jobs(&self) -> Vec<AggregateKey> {
        self.inner.jobs.keys()
    }

    pub fn aggregates(&self) -> &AggregateCache {
        &self.inner.aggregates
    }

    pub fn cancellation(&self) -> &CancellationController {
        &self.inner.cancellation
    }

    pub fn computer(&self) -> &ProgressiveComputer {
        &self.inner.computer
    }

    pub fn handles(&self) -> &SourceHandleCache {
        &self.inner.handles
    }

    /// Cancels every job and waits for the running ones to stop.
    ///
    /// Returns `false` if some job did not stop within the configured timeout.
    pub async fn shutdown(&self) -> bool {
        let inner = &self.inner;
        inner.cancellation.request_shutdown();
        inner.permits.close();
        let cancelled = inner.jobs.cancel_where(|_| true);
        tracing::info!(cancelled, "shutting down cube service");

        let drained = tokio::time::timeout(inner.shutdown_timeout, async {
            while !inner.jobs.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(jobs = inner.jobs.len(), "jobs still running after shutdown timeout");
        }
        drained
    }

    fn fill(&self, key: AggregateKey) -> Result<(Fill, Option<Arc<InFlightJob>>), CubeError> {
        self.inner.check_running()?;
        let open = self.inner.source(key.source)?;
        self.inner.check_region(key.source, key.region)?;
        self.inner.handle(key.source, &open)?;

        let cached = self.inner.aggregates.lookup(&key);
        if let Some(aggregate) = cached.as_ref().filter(|aggregate| aggregate.is_fresh()) {
            return Ok((Fill::cached(aggregate.clone(), false), None));
        }
        if let Some(aggregate) = self.inner.precomputed(key, &open) {
            return Ok((Fill::cached(aggregate, false), None));
        }

        let job = self.ensure_job(key);
        let fill = match cached {
            Some(aggregate) => Fill::cached(aggregate, true),
            None => Fill::pending(key),
        };
        Ok((fill, Some(job)))
    }

    /// Returns the job in flight for `key`, starting one if needed.
    fn ensure_job(&self, key: AggregateKey) -> Arc<InFlightJob> {
        loop {
            match self.inner.jobs.claim(key) {
                Claim::Running(job) => {
                    let generation = self.inner.cancellation.generation(key.region);
                    if job.ensure_result(generation) {
                        return job;
                    }
                }
                Claim::Started(job) => {
                    self.spawn_job(Arc::clone(&job));
                    return job;
                }
            }
        }
    }

    fn spawn_job(&self, job: Arc<InFlightJob>) {
        let inner = Arc::clone(&self.inner);
        let release = CallOnDrop::new({
            let inner = Arc::clone(&inner);
            let job = Arc::clone(&job);
            move || inner.jobs.release(&job)
        });

        let future = async move {
            let span = sentry::configure_scope(|scope| scope.get_span());
            let ctx = sentry::TransactionContext::continue_from_span(
                "Aggregate Computation",
                "compute_aggregate",
                span,
            );
            let transaction = sentry::start_transaction(ctx);
            transaction.set_tag("kind", job.key().kind.as_str());
            sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

            let state = match inner.permits.acquire().await {
                Ok(_permit) => {
                    let worker = Arc::clone(&inner);
                    let worker_job = Arc::clone(&job);
                    let computation = tokio::task::spawn_blocking(move || worker.run_job(&worker_job));
                    match computation.await {
                        Ok(state) => state,
                        Err(err) => {
                            tracing::error!(key = %job.key(), error = &err as &dyn std::error::Error, "computation panicked");
                            let state = JobState::Failed(CubeError::Io("computation panicked".into()));
                            job.end_run(state.clone());
                            state
                        }
                    }
                }
                // the semaphore is closed on shutdown
                Err(_) => {
                    let state = JobState::Cancelled(CancelReason::Shutdown);
                    job.end_run(state.clone());
                    state
                }
            };
            tracing::trace!(key = %job.key(), %state, "job finished");

            // Remove the marker before finishing the transaction. Callers either find the
            // finished job and start a new one, or they attach to the one still running.
            drop(release);
            transaction.finish();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        self.inner.runtime.spawn(future);
    }
}

impl Inner {
    fn check_running(&self) -> Result<(), CubeError> {
        if self.cancellation.is_shutdown() {
            return Err(CubeError::ShuttingDown);
        }
        Ok(())
    }

    fn source(&self, id: SourceId) -> Result<Arc<OpenSource>, CubeError> {
        self.sources
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CubeError::UnknownSource(id))
    }

    /// Checks that a region exists and belongs to `source`. Whole image regions always do.
    fn check_region(&self, source: SourceId, region: RegionId) -> Result<(), CubeError> {
        if region.is_whole_image() {
            return Ok(());
        }
        match self.regions.snapshot(region) {
            Some(snapshot) if snapshot.source == source => Ok(()),
            _ => Err(CubeError::UnknownRegion(region)),
        }
    }

    /// Returns an open handle of the source.
    ///
    /// When the cached handle was replaced, because the source changed or because it was
    /// evicted, everything derived from the previous handle is outdated: tiles and planes are
    /// dropped, aggregates are marked for recomputation and running jobs are cancelled.
    fn handle(&self, id: SourceId, open: &OpenSource) -> Result<Arc<SourceHandle>, CubeError> {
        let handle = self.handles.get(&open.key)?;
        let previous = open.handle_id.swap(handle.id(), Ordering::SeqCst);
        if previous != handle.id() {
            let invalidated = self.aggregates.invalidate_where(|key| key.source == id);
            let cancelled = self.jobs.cancel_where(|key| key.source == id);
            self.computer.forget_source(id);
            open.tiles.clear();
            open.planes.reset();
            tracing::info!(source = %id, invalidated, cancelled, "source changed");

            let (channel, polarization) = open.current();
            if let Err(err) = open.planes.set_current(&handle, channel, polarization) {
                tracing::warn!(source = %id, error = &err as &dyn std::error::Error, "failed to reload channel plane");
            }
        }
        Ok(handle)
    }

    /// Runs a job, again and again as long as it gets cancelled and asked to run again.
    fn run_job(&self, job: &InFlightJob) -> JobState {
        let _span = tracing::info_span!("aggregate", key = %job.key()).entered();
        loop {
            let flag = job.begin_run();
            let state = self.run_once(job, flag).state();
            if !job.end_run(state.clone()) {
                return state;
            }
            tracing::debug!(key = %job.key(), "running cancelled job again");
        }
    }

    fn run_once(&self, job: &InFlightJob, flag: Arc<AtomicBool>) -> JobOutcome {
        let key = job.key();
        // preparing may invalidate outdated aggregates, so the epoch is drawn afterwards
        let prepared = self.prepare(key);
        let pending = PendingJob::new(key, self.aggregates.next_epoch());
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(CubeError::UnknownRegion(_) | CubeError::UnknownSource(_)) => {
                return pending.start().cancel(CancelReason::RegionChanged);
            }
            Err(err) => return pending.start().fail(err),
        };

        job.set_generation(prepared.generation);
        let token = self.cancellation.token_at(key.region, prepared.generation, flag);
        let env = JobEnv {
            handle: &prepared.handle,
            planes: Some(&prepared.source.planes),
            aggregates: &self.aggregates,
            token: &token,
            observer: job,
        };
        self.computer.run(pending, &prepared.request, &env)
    }

    fn prepare(&self, key: AggregateKey) -> Result<Prepared, CubeError> {
        let source = self.source(key.source)?;
        let handle = self.handle(key.source, &source)?;
        let (mask, generation) = if key.region.is_whole_image() {
            let generation = self.cancellation.generation(key.region);
            (Arc::new(RegionMask::full(&source.shape)), generation)
        } else {
            match self.regions.snapshot(key.region) {
                Some(snapshot) if snapshot.source == key.source => (snapshot.mask, snapshot.generation),
                _ => return Err(CubeError::UnknownRegion(key.region)),
            }
        };
        let bins = match key.kind {
            DataKind::Histogram => self.histogram_bins(key, &source),
            _ => vec![],
        };
        Ok(Prepared {
            source,
            handle,
            request: ComputeRequest { key, mask, bins },
            generation,
        })
    }

    /// The bin counts the histogram requirements ask for, at least one.
    fn histogram_bins(&self, key: AggregateKey, source: &OpenSource) -> Vec<u32> {
        let (width, height) = (source.shape.width, source.shape.height);
        let current = source.current();
        let mut bins: Vec<u32> = self
            .requirements
            .get(key.source, key.region)
            .map(|requirements| requirements.histograms)
            .unwrap_or_default()
            .into_iter()
            .filter(|config| {
                key.region == RegionId::CUBE || resolve_channel(config.channel, current) == key.channel
            })
            .map(|config| resolve_bins(config.num_bins, width, height))
            .collect();
        bins.sort_unstable();
        bins.dedup();
        if bins.is_empty() {
            bins.push(resolve_bins(AUTO_BINS, width, height));
        }
        bins
    }

    /// Reads a whole image aggregate the source stores itself, and caches it.
    fn precomputed(&self, key: AggregateKey, source: &OpenSource) -> Option<Aggregate> {
        if !key.region.is_whole_image() || key.kind == DataKind::SpectralSeries {
            return None;
        }
        let handle = self.handle(key.source, source).ok()?;
        if !handle.has_precomputed_stats(key.kind) {
            return None;
        }
        let polarization = key.polarization as usize;

        let read = |num_bins: u32| match handle.read_precomputed_stats(key.kind, polarization, key.channel, num_bins) {
            Ok(precomputed) => precomputed,
            Err(err) => {
                tracing::warn!(%key, error = &err as &dyn std::error::Error, "failed to read precomputed statistics");
                None
            }
        };
        let payload = match key.kind {
            DataKind::Stats => match read(0)? {
                Precomputed::Stats(stats) => AggregatePayload::Stats(stats),
                Precomputed::Histogram(set) => AggregatePayload::Stats(set.stats),
            },
            _ => {
                let mut merged = HistogramSet::default();
                for num_bins in self.histogram_bins(key, source) {
                    let Precomputed::Histogram(set) = read(num_bins)? else {
                        return None;
                    };
                    merged.stats = set.stats;
                    merged.histograms.extend(set.histograms);
                }
                AggregatePayload::Histogram(merged)
            }
        };

        let aggregate = Aggregate {
            key,
            payload: Arc::new(payload),
            epoch: self.aggregates.next_epoch(),
            generation: self.cancellation.generation(key.region),
            complete: true,
            progress: 1.0,
            invalidated: false,
        };
        self.aggregates.upsert(aggregate.clone());
        metric!(counter("aggregates.precomputed") += 1, "kind" => key.kind.as_str());
        Some(aggregate)
    }
}

fn resolve_channel(selector: ChannelSelector, (channel, _): (u32, u32)) -> ChannelOrAll {
    match selector {
        ChannelSelector::Current => ChannelOrAll::Channel(channel),
        ChannelSelector::Index(index) => ChannelOrAll::Channel(index),
        ChannelSelector::All => ChannelOrAll::All,
    }
}

fn resolve_polarization(selector: PolarizationSelector, (_, polarization): (u32, u32)) -> u32 {
    match selector {
        PolarizationSelector::Current => polarization,
        PolarizationSelector::Index(index) => index,
    }
}

fn validate_requirements(requirements: &Requirements, shape: &CubeShape) -> Result<(), CubeError> {
    let check_channel = |selector: ChannelSelector| match selector {
        ChannelSelector::Index(index) if index as usize >= shape.depth => Err(CubeError::InvalidRange(format!(
            "channel {index} outside of {shape}"
        ))),
        _ => Ok(()),
    };
    let check_polarization = |selector: PolarizationSelector| match selector {
        PolarizationSelector::Index(index) if index as usize >= shape.polarizations => Err(
            CubeError::InvalidRange(format!("polarization {index} outside of {shape}")),
        ),
        _ => Ok(()),
    };
    match requirements {
        Requirements::Histogram(configs) => configs.iter().try_for_each(|c| check_channel(c.channel)),
        Requirements::Spectral(configs) => configs.iter().try_for_each(|c| check_polarization(c.polarization)),
        Requirements::Stats(configs) => configs.iter().try_for_each(|c| check_polarization(c.polarization)),
    }
}
