//! Progressive computation of aggregates over a region.
//!
//! A job walks the pixels of a region slice by slice, as laid out by a [`SlicePlan`]. After
//! every slice it stores a partial aggregate and notifies its observer, and before every slice it
//! consults its [`CancelToken`]. A job is never interrupted in the middle of a slice.
//!
//! Spectral jobs that get cancelled without their region changing leave their accumulators
//! behind, so that the next job for the same region and polarization picks up where they
//! stopped.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use super::histogram::{AUTO_BINS, Histogram, HistogramResult, HistogramSet, resolve_bins};
use super::job::{JobOutcome, PendingJob};
use super::stats::BasicStats;
use super::strategy::{AccessStrategy, SlicePlan};
use crate::caching::{
    Aggregate, AggregateCache, AggregatePayload, ChannelPlaneCache, SourceHandle, SpectralProfile,
};
use crate::cancellation::{CancelReason, CancelToken};
use crate::config::ComputeConfig;
use crate::error::CubeError;
use crate::region::RegionMask;
use crate::source::{CubeShape, Slice};
use crate::types::{AggregateKey, ChannelOrAll, DataKind, RegionId, SourceId};

/// Tuning of the slice layout.
#[derive(Clone, Copy, Debug)]
pub struct ComputeOptions {
    pub max_slice_pixels: usize,
    pub swizzle_crossover: f64,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self::from(&ComputeConfig::default())
    }
}

impl From<&ComputeConfig> for ComputeOptions {
    fn from(config: &ComputeConfig) -> Self {
        Self {
            max_slice_pixels: config.max_slice_pixels,
            swizzle_crossover: config.swizzle_crossover,
        }
    }
}

/// What to compute.
#[derive(Clone, Debug)]
pub struct ComputeRequest {
    pub key: AggregateKey,
    pub mask: Arc<RegionMask>,
    /// The bin counts of a histogram request. Empty means one automatically sized histogram.
    pub bins: Vec<u32>,
}

/// A payload published by a running job.
#[derive(Clone, Debug)]
pub struct PartialResult {
    pub key: AggregateKey,
    pub payload: Arc<AggregatePayload>,
    pub progress: f32,
    pub complete: bool,
}

/// Receives the partial results of a job, in publication order.
pub trait PartialObserver: Send + Sync {
    fn on_partial(&self, partial: &PartialResult);
}

impl<F> PartialObserver for F
where
    F: Fn(&PartialResult) + Send + Sync,
{
    fn on_partial(&self, partial: &PartialResult) {
        self(partial)
    }
}

/// Everything a job reads from and writes to.
pub struct JobEnv<'a> {
    pub handle: &'a SourceHandle,
    /// The plane cache of the source, consulted for single channel reads.
    pub planes: Option<&'a ChannelPlaneCache>,
    pub aggregates: &'a AggregateCache,
    pub token: &'a CancelToken,
    pub observer: &'a dyn PartialObserver,
}

enum Interrupt {
    Cancelled(CancelReason),
    Failed(CubeError),
}

impl From<CubeError> for Interrupt {
    fn from(err: CubeError) -> Self {
        Self::Failed(err)
    }
}

impl From<CancelReason> for Interrupt {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ResumeKey {
    source: SourceId,
    region: RegionId,
    polarization: u32,
}

/// The accumulators of an interrupted spectral job.
#[derive(Debug)]
struct SpectralProgress {
    handle_id: u64,
    mask: Arc<RegionMask>,
    generation: u64,
    strategy: AccessStrategy,
    total_slices: usize,
    next_slice: usize,
    accumulators: Vec<BasicStats>,
}

impl SpectralProgress {
    /// Whether `self` was computed over the same pixels with the same slice layout as `fresh`.
    fn continues(&self, fresh: &SpectralProgress) -> bool {
        self.handle_id == fresh.handle_id
            && self.generation == fresh.generation
            && *self.mask == *fresh.mask
            && self.strategy == fresh.strategy
            && self.total_slices == fresh.total_slices
            && self.accumulators.len() == fresh.accumulators.len()
    }
}

/// Runs computation jobs. One computer is shared by all jobs of a session.
#[derive(Debug, Default)]
pub struct ProgressiveComputer {
    options: ComputeOptions,
    resume: Mutex<HashMap<ResumeKey, SpectralProgress>>,
}

impl ProgressiveComputer {
    pub fn new(options: ComputeOptions) -> Self {
        Self {
            options,
            resume: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &ComputeOptions {
        &self.options
    }

    /// Runs `job` to completion, failure, or cancellation.
    ///
    /// Every partial result is stored in the aggregate cache before it is handed to the
    /// observer. The final publication has a progress of exactly `1.0` and is the only
    /// complete one.
    pub fn run(&self, job: PendingJob, request: &ComputeRequest, env: &JobEnv<'_>) -> JobOutcome {
        let job = job.start();
        let mut run = Run {
            key: request.key,
            epoch: job.epoch(),
            env,
            beam_area: env.handle.beam_area(),
            last_progress: 0.0,
        };

        let result = validate(request, &env.handle.shape())
            .map_err(Interrupt::from)
            .and_then(|channels| match request.key.kind {
                DataKind::SpectralSeries => self.spectral(&mut run, request),
                DataKind::Stats => self.stats(&mut run, request, channels),
                DataKind::Histogram => self.histogram(&mut run, request, channels),
            });

        match result {
            Ok(payload) => {
                let aggregate = run.publish(payload, 1.0, true);
                job.complete(aggregate)
            }
            Err(Interrupt::Cancelled(reason)) => job.cancel(reason),
            Err(Interrupt::Failed(err)) => job.fail(err),
        }
    }

    /// The slice a spectral job on this region would resume at, if any.
    pub fn resumable(&self, source: SourceId, region: RegionId, polarization: u32) -> Option<usize> {
        let key = ResumeKey {
            source,
            region,
            polarization,
        };
        self.resume.lock().unwrap().get(&key).map(|p| p.next_slice)
    }

    pub fn forget_region(&self, region: RegionId) {
        self.resume.lock().unwrap().retain(|key, _| key.region != region);
    }

    pub fn forget_source(&self, source: SourceId) {
        self.resume.lock().unwrap().retain(|key, _| key.source != source);
    }

    fn spectral(&self, run: &mut Run<'_, '_>, request: &ComputeRequest) -> Result<AggregatePayload, Interrupt> {
        let env = run.env;
        let shape = env.handle.shape();
        let mask = &request.mask;
        let polarization = request.key.polarization as usize;

        let strategy = AccessStrategy::choose(
            env.handle.has_swizzled(),
            mask.height(),
            shape.depth,
            mask.width(),
            self.options.swizzle_crossover,
        );
        let plan = SlicePlan::new(strategy, mask, 0..shape.depth, polarization, self.options.max_slice_pixels);

        let resume_key = ResumeKey {
            source: request.key.source,
            region: request.key.region,
            polarization: request.key.polarization,
        };
        let fresh = SpectralProgress {
            handle_id: env.handle.id(),
            mask: Arc::clone(mask),
            generation: env.token.generation(),
            strategy,
            total_slices: plan.len(),
            next_slice: 0,
            accumulators: vec![BasicStats::new(); shape.depth],
        };
        let saved = self.resume.lock().unwrap().remove(&resume_key);
        let mut progress = match saved {
            Some(saved) if saved.continues(&fresh) => {
                tracing::debug!(key = %run.key, slice = saved.next_slice, "resuming spectral job");
                saved
            }
            Some(_) => {
                tracing::debug!(key = %run.key, "discarding expired spectral progress");
                fresh
            }
            None => fresh,
        };
        tracing::debug!(
            key = %run.key,
            strategy = strategy.as_str(),
            slices = plan.len(),
            "computing spectral profile"
        );

        let total = plan.len();
        for (index, slice) in plan.slices().iter().enumerate().skip(progress.next_slice) {
            if let Err(reason) = env.token.check() {
                self.suspend(resume_key, progress, reason);
                return Err(reason.into());
            }

            let data = run.read(&plan, slice)?;
            let accumulators = &mut progress.accumulators;
            plan.visit(slice, &data, mask, |channel, value| accumulators[channel].push(value));
            progress.next_slice = index + 1;
            tracing::trace!(key = %run.key, slice = index, total, "processed slice");

            if progress.next_slice < total {
                let payload = spectral_payload(&progress.accumulators, run.beam_area);
                run.publish(payload, progress.next_slice as f32 / total as f32, false);
            }
        }

        if let Err(reason) = env.token.check() {
            self.suspend(resume_key, progress, reason);
            return Err(reason.into());
        }
        Ok(spectral_payload(&progress.accumulators, run.beam_area))
    }

    /// Keeps the accumulators of a cancelled spectral job, unless its region changed.
    fn suspend(&self, key: ResumeKey, progress: SpectralProgress, reason: CancelReason) {
        if reason == CancelReason::RegionChanged {
            return;
        }
        tracing::debug!(region = %key.region, slice = progress.next_slice, "suspending spectral job");
        self.resume.lock().unwrap().insert(key, progress);
    }

    fn stats(
        &self,
        run: &mut Run<'_, '_>,
        request: &ComputeRequest,
        channels: Range<usize>,
    ) -> Result<AggregatePayload, Interrupt> {
        let mask = &request.mask;
        let plan = SlicePlan::new(
            AccessStrategy::Direct,
            mask,
            channels,
            request.key.polarization as usize,
            self.options.max_slice_pixels,
        );
        let full_box = mask.is_rect();

        let mut stats = BasicStats::new();
        let total = plan.len();
        for (index, slice) in plan.slices().iter().enumerate() {
            run.checkpoint()?;
            let data = run.read(&plan, slice)?;
            if full_box {
                stats.merge(&BasicStats::from_par_slice(&data));
            } else {
                plan.visit(slice, &data, mask, |_, value| stats.push(value));
            }
            if index + 1 < total {
                let payload = AggregatePayload::Stats(stats.summarize(run.beam_area));
                run.publish(payload, (index + 1) as f32 / total as f32, false);
            }
        }

        run.checkpoint()?;
        Ok(AggregatePayload::Stats(stats.summarize(run.beam_area)))
    }

    /// Computes histograms in two passes: the value range first, then the bins.
    fn histogram(
        &self,
        run: &mut Run<'_, '_>,
        request: &ComputeRequest,
        channels: Range<usize>,
    ) -> Result<AggregatePayload, Interrupt> {
        let mask = &request.mask;
        let plan = SlicePlan::new(
            AccessStrategy::Direct,
            mask,
            channels,
            request.key.polarization as usize,
            self.options.max_slice_pixels,
        );
        let full_box = mask.is_rect();
        let total = plan.len() * 2;

        let mut stats = BasicStats::new();
        for (index, slice) in plan.slices().iter().enumerate() {
            run.checkpoint()?;
            let data = run.read(&plan, slice)?;
            if full_box {
                stats.merge(&BasicStats::from_par_slice(&data));
            } else {
                plan.visit(slice, &data, mask, |_, value| stats.push(value));
            }
            let payload = AggregatePayload::Histogram(HistogramSet {
                stats: stats.summarize(run.beam_area),
                histograms: vec![],
            });
            run.publish(payload, (index + 1) as f32 / total as f32, false);
        }

        let summary = stats.summarize(run.beam_area);
        let bins = match request.bins.as_slice() {
            [] => vec![resolve_bins(AUTO_BINS, mask.width(), mask.height())],
            bins => bins.to_vec(),
        };
        if !stats.has_values() {
            run.checkpoint()?;
            return Ok(AggregatePayload::Histogram(HistogramSet {
                stats: summary,
                histograms: bins.into_iter().map(HistogramResult::empty).collect(),
            }));
        }

        let mut histograms: Vec<_> = bins
            .iter()
            .map(|num_bins| Histogram::new(*num_bins, stats.min, stats.max))
            .collect();
        for (index, slice) in plan.slices().iter().enumerate() {
            run.checkpoint()?;
            let data = run.read(&plan, slice)?;
            if full_box {
                for histogram in &mut histograms {
                    histogram.par_extend(&data);
                }
            } else {
                plan.visit(slice, &data, mask, |_, value| {
                    for histogram in histograms.iter_mut() {
                        histogram.push(value);
                    }
                });
            }
            let done = plan.len() + index + 1;
            if done < total {
                let payload = AggregatePayload::Histogram(HistogramSet {
                    stats: summary,
                    histograms: histograms.iter().map(Histogram::finish).collect(),
                });
                run.publish(payload, done as f32 / total as f32, false);
            }
        }

        run.checkpoint()?;
        Ok(AggregatePayload::Histogram(HistogramSet {
            stats: summary,
            histograms: histograms.iter().map(Histogram::finish).collect(),
        }))
    }
}

/// Checks the request against the source, returning the channels to reduce.
fn validate(request: &ComputeRequest, shape: &CubeShape) -> Result<Range<usize>, CubeError> {
    request.mask.validate(shape)?;
    if request.key.polarization as usize >= shape.polarizations {
        return Err(CubeError::InvalidRange(format!(
            "polarization {} outside of {shape}",
            request.key.polarization
        )));
    }
    match request.key.channel {
        ChannelOrAll::All => Ok(0..shape.depth),
        ChannelOrAll::Channel(channel) if (channel as usize) < shape.depth => {
            Ok(channel as usize..channel as usize + 1)
        }
        ChannelOrAll::Channel(channel) => Err(CubeError::InvalidRange(format!(
            "channel {channel} outside of {shape}"
        ))),
    }
}

fn spectral_payload(accumulators: &[BasicStats], beam_area: Option<f64>) -> AggregatePayload {
    AggregatePayload::Spectral(SpectralProfile {
        channels: accumulators.iter().map(|s| s.summarize(beam_area)).collect(),
    })
}

/// The state of one running job.
struct Run<'a, 'e> {
    key: AggregateKey,
    epoch: u64,
    env: &'a JobEnv<'e>,
    beam_area: Option<f64>,
    last_progress: f32,
}

impl Run<'_, '_> {
    fn checkpoint(&self) -> Result<(), Interrupt> {
        Ok(self.env.token.check()?)
    }

    /// Reads a slice, preferring a loaded channel plane over the source.
    fn read(&self, plan: &SlicePlan, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        if plan.strategy == AccessStrategy::Swizzled {
            return self.env.handle.read_swizzled(slice);
        }
        if slice.channel_count() == 1 {
            let plane = self
                .env
                .planes
                .and_then(|planes| planes.plane(slice.channels.start as u32, slice.polarization as u32));
            if let Some(view) = plane {
                let pixels = view.as_slice();
                let width = view.width();
                let mut data = Vec::with_capacity(slice.len());
                for y in slice.y.clone() {
                    data.extend_from_slice(&pixels[y * width + slice.x.start..y * width + slice.x.end]);
                }
                return Ok(data);
            }
        }
        self.env.handle.read_slice(slice)
    }

    /// Stores an aggregate and hands it to the observer.
    ///
    /// Progress never goes backwards within a job.
    fn publish(&mut self, payload: AggregatePayload, progress: f32, complete: bool) -> Aggregate {
        let progress = progress.clamp(self.last_progress, 1.0);
        self.last_progress = progress;
        let payload = Arc::new(payload);
        let aggregate = Aggregate {
            key: self.key,
            payload: Arc::clone(&payload),
            epoch: self.epoch,
            generation: self.env.token.generation(),
            complete,
            progress,
            invalidated: false,
        };
        self.env.aggregates.upsert(aggregate.clone());
        self.env.observer.on_partial(&PartialResult {
            key: self.key,
            payload,
            progress,
            complete,
        });
        aggregate
    }
}
