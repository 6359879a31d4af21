use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::stats::{BasicStats, StatsSummary};

/// Requests an automatically sized histogram.
pub const AUTO_BINS: i32 = -1;

/// Resolves a requested bin count, where [`AUTO_BINS`] scales with the plane size.
pub fn resolve_bins(num_bins: i32, width: usize, height: usize) -> u32 {
    if num_bins > 0 {
        return num_bins as u32;
    }
    let auto = ((width * height) as f64).sqrt() as u32;
    auto.max(2)
}

/// An accumulating histogram over a fixed value range.
#[derive(Clone, Debug)]
pub struct Histogram {
    min: f64,
    bin_width: f64,
    bins: Vec<u64>,
}

impl Histogram {
    /// Creates an empty histogram over `[min, max]`.
    pub fn new(num_bins: u32, min: f64, max: f64) -> Self {
        let num_bins = num_bins.max(1);
        Self {
            min,
            bin_width: (max - min) / num_bins as f64,
            bins: vec![0; num_bins as usize],
        }
    }

    #[inline]
    pub fn push(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let last = self.bins.len() - 1;
        let index = if self.bin_width > 0.0 {
            let bin = ((value as f64 - self.min) / self.bin_width).floor();
            // clamps the maximum into the last bin, and anything below `min` into the first
            (bin.max(0.0) as usize).min(last)
        } else {
            0
        };
        self.bins[index] += 1;
    }

    pub fn extend<I: IntoIterator<Item = f32>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    /// Adds the counts of a histogram with the same binning.
    pub fn merge(&mut self, other: &Histogram) {
        debug_assert_eq!(self.bins.len(), other.bins.len());
        for (a, b) in self.bins.iter_mut().zip(&other.bins) {
            *a += b;
        }
    }

    /// Bins an in-memory slice in parallel.
    pub fn par_extend(&mut self, data: &[f32]) {
        let empty = Histogram {
            min: self.min,
            bin_width: self.bin_width,
            bins: vec![0; self.bins.len()],
        };
        let partial = data
            .par_chunks(64 * 1024)
            .map(|chunk| {
                let mut hist = empty.clone();
                hist.extend(chunk.iter().copied());
                hist
            })
            .reduce(
                || empty.clone(),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            );
        self.merge(&partial);
    }

    /// Bins an in-memory slice over the range found by `stats`.
    pub fn from_par_slice(num_bins: u32, stats: &BasicStats, data: &[f32]) -> HistogramResult {
        if !stats.has_values() {
            return HistogramResult::empty(num_bins);
        }
        let mut hist = Histogram::new(num_bins, stats.min, stats.max);
        hist.par_extend(data);
        hist.finish()
    }

    pub fn finish(&self) -> HistogramResult {
        HistogramResult {
            num_bins: self.bins.len() as u32,
            bin_width: self.bin_width,
            bin_center: self.min + self.bin_width / 2.0,
            bins: self.bins.clone(),
        }
    }
}

/// A finished histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramResult {
    pub num_bins: u32,
    pub bin_width: f64,
    /// The center of the first bin.
    pub bin_center: f64,
    pub bins: Vec<u64>,
}

impl HistogramResult {
    /// The histogram of a selection without any finite pixel.
    pub fn empty(num_bins: u32) -> Self {
        Self {
            num_bins,
            bin_width: 0.0,
            bin_center: 0.0,
            bins: vec![0; num_bins as usize],
        }
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }
}

/// Histograms of one selection at several bin counts, plus the statistics they were binned with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    pub stats: StatsSummary,
    pub histograms: Vec<HistogramResult>,
}

impl HistogramSet {
    pub fn get(&self, num_bins: u32) -> Option<&HistogramResult> {
        self.histograms.iter().find(|h| h.num_bins == num_bins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bins() {
        assert_eq!(resolve_bins(64, 1000, 1000), 64);
        assert_eq!(resolve_bins(AUTO_BINS, 100, 100), 100);
        assert_eq!(resolve_bins(AUTO_BINS, 1, 1), 2);
    }

    #[test]
    fn test_binning() {
        let mut hist = Histogram::new(4, 0.0, 4.0);
        hist.extend([0.0, 0.5, 1.0, 2.5, 3.9, 4.0, f32::NAN]);

        let result = hist.finish();
        assert_eq!(result.bins, vec![2, 1, 1, 2]);
        assert_eq!(result.bin_width, 1.0);
        assert_eq!(result.bin_center, 0.5);
        assert_eq!(result.total(), 6);
    }

    #[test]
    fn test_constant_values() {
        let mut hist = Histogram::new(3, 2.0, 2.0);
        hist.extend([2.0, 2.0]);
        assert_eq!(hist.finish().bins, vec![2, 0, 0]);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let data: Vec<f32> = (0..200_000).map(|i| ((i * 7919) % 1000) as f32).collect();
        let mut stats = BasicStats::new();
        stats.extend(data.iter().copied());

        let mut sequential = Histogram::new(10, stats.min, stats.max);
        sequential.extend(data.iter().copied());

        let parallel = Histogram::from_par_slice(10, &stats, &data);
        assert_eq!(parallel, sequential.finish());
        assert_eq!(parallel.total(), 200_000);
    }

    #[test]
    fn test_empty_selection() {
        let stats = BasicStats::new();
        let result = Histogram::from_par_slice(5, &stats, &[f32::NAN]);
        assert_eq!(result, HistogramResult::empty(5));
    }
}
