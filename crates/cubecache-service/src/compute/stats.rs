//! Running statistics accumulators.
//!
//! Sums are accumulated in `f64`, so the order in which pixels arrive only affects the last few
//! bits of the result. Accumulating a pixel set in one pass, or in any number of resumed chunks,
//! or in parallel chunks that are [`merge`](BasicStats::merge)d, yields the same counts and
//! statistics within floating point tolerance.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Number of pixels per parallel work unit when reducing an in-memory plane.
const PAR_CHUNK: usize = 64 * 1024;

/// The statistics a client can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsType {
    NumPixels,
    NanCount,
    Sum,
    FluxDensity,
    Mean,
    Rms,
    Sigma,
    SumSq,
    Min,
    Max,
    Extrema,
}

impl StatsType {
    pub const ALL: [StatsType; 11] = [
        Self::NumPixels,
        Self::NanCount,
        Self::Sum,
        Self::FluxDensity,
        Self::Mean,
        Self::Rms,
        Self::Sigma,
        Self::SumSq,
        Self::Min,
        Self::Max,
        Self::Extrema,
    ];
}

/// Raw accumulators over a set of pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BasicStats {
    pub count: u64,
    pub nan_count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for BasicStats {
    fn default() -> Self {
        Self {
            count: 0,
            nan_count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl BasicStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates a single pixel value. Non-finite values only bump `nan_count`.
    #[inline]
    pub fn push(&mut self, value: f32) {
        if !value.is_finite() {
            self.nan_count += 1;
            return;
        }
        let v = value as f64;
        self.count += 1;
        self.sum += v;
        self.sum_sq += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    pub fn extend<I: IntoIterator<Item = f32>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    /// Combines two disjoint accumulations.
    pub fn merge(&mut self, other: &BasicStats) {
        self.count += other.count;
        self.nan_count += other.nan_count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Reduces an in-memory slice in parallel.
    pub fn from_par_slice(data: &[f32]) -> Self {
        data.par_chunks(PAR_CHUNK)
            .map(|chunk| {
                let mut stats = BasicStats::new();
                stats.extend(chunk.iter().copied());
                stats
            })
            .reduce(BasicStats::new, |mut a, b| {
                a.merge(&b);
                a
            })
    }

    /// Whether at least one finite pixel was accumulated.
    pub fn has_values(&self) -> bool {
        self.count > 0
    }

    /// Computes the derived statistics.
    ///
    /// When no finite pixel was seen, everything except the two counts is undefined. The
    /// flux density is only defined when a beam area is known.
    pub fn summarize(&self, beam_area: Option<f64>) -> StatsSummary {
        if self.count == 0 {
            return StatsSummary {
                count: self.count,
                nan_count: self.nan_count,
                ..Default::default()
            };
        }

        let n = self.count as f64;
        let sigma = if self.count > 1 {
            let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
            Some(variance.max(0.0).sqrt())
        } else {
            None
        };
        let flux = beam_area
            .filter(|area| area.is_finite() && *area != 0.0)
            .map(|area| self.sum / area);

        StatsSummary {
            count: self.count,
            nan_count: self.nan_count,
            sum: Some(self.sum),
            sum_sq: Some(self.sum_sq),
            min: Some(self.min),
            max: Some(self.max),
            mean: Some(self.sum / n),
            rms: Some((self.sum_sq / n).sqrt()),
            sigma,
            flux,
        }
    }
}

/// Statistics derived from a [`BasicStats`] accumulation, as handed out to readers.
///
/// `None` means undefined, which is distinct from zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub count: u64,
    pub nan_count: u64,
    pub sum: Option<f64>,
    pub sum_sq: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub rms: Option<f64>,
    pub sigma: Option<f64>,
    pub flux: Option<f64>,
}

impl StatsSummary {
    pub fn get(&self, stat: StatsType) -> Option<f64> {
        match stat {
            StatsType::NumPixels => Some(self.count as f64),
            StatsType::NanCount => Some(self.nan_count as f64),
            StatsType::Sum => self.sum,
            StatsType::FluxDensity => self.flux,
            StatsType::Mean => self.mean,
            StatsType::Rms => self.rms,
            StatsType::Sigma => self.sigma,
            StatsType::SumSq => self.sum_sq,
            StatsType::Min => self.min,
            StatsType::Max => self.max,
            StatsType::Extrema => match (self.min, self.max) {
                (Some(min), Some(max)) if min.abs() > max.abs() => Some(min),
                (_, max) => max,
            },
        }
    }
}
