use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::{CubeShape, DataSource, Precomputed, Slice, SourceOpener};
use crate::compute::{BasicStats, Histogram, HistogramSet};
use crate::error::CubeError;
use crate::types::{ChannelOrAll, DataKind, SourceKey};

/// A source held entirely in memory.
///
/// Clones share their pixels, version and counters. Every [`reopen`](Self::reopen) snapshots
/// the current version, so a handle opened before [`set_data`](Self::set_data) or
/// [`mark_changed`](Self::mark_changed) reports itself as changed afterwards.
#[derive(Clone, Debug)]
pub struct MemorySource {
    shape: CubeShape,
    swizzled: bool,
    precomputed: bool,
    beam_area: Option<f64>,
    read_delay: Option<Duration>,
    shared: Arc<Shared>,
    opened_version: u64,
}

#[derive(Debug)]
struct Shared {
    data: RwLock<Arc<[f32]>>,
    version: AtomicU64,
    reads: AtomicUsize,
    failing: AtomicBool,
}

impl MemorySource {
    /// Creates a source with `x` varying fastest and polarization slowest in `data`.
    pub fn new(dims: &[usize], data: Vec<f32>) -> Result<Self, CubeError> {
        let shape = CubeShape::from_dims(dims)?;
        if data.len() != shape.len() {
            return Err(CubeError::InvalidRange(format!(
                "{} values for a {shape} source",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            swizzled: false,
            precomputed: false,
            beam_area: None,
            read_delay: None,
            shared: Arc::new(Shared {
                data: RwLock::new(data.into()),
                version: AtomicU64::new(0),
                reads: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }),
            opened_version: 0,
        })
    }

    /// Offers a swizzled copy of the data.
    pub fn with_swizzled(mut self) -> Self {
        self.swizzled = true;
        self
    }

    /// Offers whole-image statistics and histograms as stored aggregates.
    pub fn with_precomputed_stats(mut self) -> Self {
        self.precomputed = true;
        self
    }

    pub fn with_beam_area(mut self, beam_area: f64) -> Self {
        self.beam_area = Some(beam_area);
        self
    }

    /// Makes every read block for the given time, simulating slow storage.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// A fresh view of this source, as if it was just opened.
    pub fn reopen(&self) -> Self {
        Self {
            opened_version: self.shared.version.load(Ordering::SeqCst),
            ..self.clone()
        }
    }

    /// Replaces the pixels and marks every previously opened view as changed.
    pub fn set_data(&self, data: Vec<f32>) -> Result<(), CubeError> {
        if data.len() != self.shape.len() {
            return Err(CubeError::InvalidRange(format!(
                "{} values for a {} source",
                data.len(),
                self.shape
            )));
        }
        *self.shared.data.write().unwrap() = data.into();
        self.mark_changed();
        Ok(())
    }

    pub fn mark_changed(&self) {
        self.shared.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes all following reads fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }

    /// The number of pixel reads served so far, across all views.
    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    fn begin_read(&self) -> Result<Arc<[f32]>, CubeError> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(CubeError::Io("simulated read failure".into()));
        }
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.shared.data.read().unwrap().clone())
    }

    /// The linear range covering whole planes of one polarization.
    fn planes(&self, polarization: usize, channels: Range<usize>) -> Range<usize> {
        let start = self.shape.index(0, 0, channels.start, polarization);
        start..start + self.shape.plane_len() * channels.len()
    }
}

impl DataSource for MemorySource {
    fn shape(&self) -> CubeShape {
        self.shape
    }

    fn has_changed(&self) -> bool {
        self.shared.version.load(Ordering::SeqCst) != self.opened_version
    }

    fn read_slice(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        slice.validate(&self.shape)?;
        let data = self.begin_read()?;
        let mut out = Vec::with_capacity(slice.len());
        for channel in slice.channels.clone() {
            for y in slice.y.clone() {
                let start = self.shape.index(slice.x.start, y, channel, slice.polarization);
                out.extend_from_slice(&data[start..start + slice.width()]);
            }
        }
        Ok(out)
    }

    fn has_swizzled(&self) -> bool {
        self.swizzled && self.shape.depth > 1
    }

    fn read_swizzled(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        if !self.has_swizzled() {
            return Err(CubeError::Io("source has no swizzled data".into()));
        }
        slice.validate(&self.shape)?;
        let data = self.begin_read()?;
        let mut out = Vec::with_capacity(slice.len());
        for x in slice.x.clone() {
            for y in slice.y.clone() {
                for channel in slice.channels.clone() {
                    out.push(data[self.shape.index(x, y, channel, slice.polarization)]);
                }
            }
        }
        Ok(out)
    }

    fn has_precomputed_stats(&self, kind: DataKind) -> bool {
        self.precomputed && kind != DataKind::SpectralSeries
    }

    fn read_precomputed_stats(
        &self,
        kind: DataKind,
        polarization: usize,
        channel: ChannelOrAll,
        num_bins: u32,
    ) -> Result<Option<Precomputed>, CubeError> {
        if !self.has_precomputed_stats(kind) || polarization >= self.shape.polarizations {
            return Ok(None);
        }
        let channels = match channel {
            ChannelOrAll::Channel(c) if (c as usize) < self.shape.depth => c as usize..c as usize + 1,
            ChannelOrAll::Channel(_) => return Ok(None),
            ChannelOrAll::All => 0..self.shape.depth,
        };

        let data = self.begin_read()?;
        let range = self.planes(polarization, channels);
        let stats = BasicStats::from_par_slice(&data[range.clone()]);
        let summary = stats.summarize(self.beam_area);
        Ok(Some(match kind {
            DataKind::Histogram => Precomputed::Histogram(HistogramSet {
                stats: summary,
                histograms: vec![Histogram::from_par_slice(num_bins, &stats, &data[range])],
            }),
            _ => Precomputed::Stats(summary),
        }))
    }

    fn beam_area(&self) -> Option<f64> {
        self.beam_area
    }
}

/// Opens registered [`MemorySource`]s, counting every open.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    sources: Mutex<HashMap<SourceKey, MemorySource>>,
    opens: AtomicUsize,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<SourceKey>, source: MemorySource) {
        self.sources.lock().unwrap().insert(key.into(), source);
    }

    pub fn remove(&self, key: &SourceKey) {
        self.sources.lock().unwrap().remove(key);
    }

    /// How many times a source was opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self, key: &SourceKey) -> Result<Arc<dyn DataSource>, CubeError> {
        let source = self
            .sources
            .lock()
            .unwrap()
            .get(key)
            .map(MemorySource::reopen)
            .ok_or_else(|| CubeError::Io(format!("no such source: {key}")))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: &[usize]) -> MemorySource {
        let len = dims.iter().product();
        MemorySource::new(dims, (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_read_slice_order() {
        let source = ramp(&[4, 3, 2]);
        let slice = Slice {
            x: 1..3,
            y: 1..3,
            channels: 0..2,
            polarization: 0,
        };
        let data = source.read_slice(&slice).unwrap();
        assert_eq!(data, vec![5., 6., 9., 10., 17., 18., 21., 22.]);
    }

    #[test]
    fn test_read_swizzled_order() {
        let source = ramp(&[4, 3, 2]).with_swizzled();
        let slice = Slice {
            x: 1..3,
            y: 1..2,
            channels: 0..2,
            polarization: 0,
        };
        let data = source.read_swizzled(&slice).unwrap();
        assert_eq!(data, vec![5., 17., 6., 18.]);
    }

    #[test]
    fn test_change_tracking() {
        let source = ramp(&[2, 2]);
        let opened = source.reopen();
        assert!(!opened.has_changed());

        source.set_data(vec![9.; 4]).unwrap();
        assert!(opened.has_changed());
        assert!(!source.reopen().has_changed());
        assert!(source.set_data(vec![1.]).is_err());
    }

    #[test]
    fn test_opener() {
        let opener = MemoryOpener::new();
        opener.insert(SourceKey::from("a"), ramp(&[2, 2]));

        assert!(opener.open(&SourceKey::from("a")).is_ok());
        assert!(opener.open(&SourceKey::from("b")).is_err());
        assert_eq!(opener.opens(), 1);
    }
}
