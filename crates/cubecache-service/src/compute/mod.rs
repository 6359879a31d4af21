//! Reductions over the pixels of a region, and the jobs computing them.

mod histogram;
mod job;
mod progressive;
mod stats;
mod strategy;

pub use histogram::{AUTO_BINS, Histogram, HistogramResult, HistogramSet, resolve_bins};
pub use job::{JobOutcome, JobState, PendingJob, RunningJob};
pub use progressive::{
    ComputeOptions, ComputeRequest, JobEnv, PartialObserver, PartialResult, ProgressiveComputer,
};
pub use stats::{BasicStats, StatsSummary, StatsType};
pub use strategy::{AccessStrategy, SlicePlan};
