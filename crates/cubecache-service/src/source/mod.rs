//! The data-source capability consumed by the caches.
//!
//! The engine never depends on a concrete file format. Every format is one implementation of
//! [`DataSource`], opened through a [`SourceOpener`].

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::compute::{HistogramSet, StatsSummary};
use crate::error::CubeError;
use crate::types::{ChannelOrAll, DataKind, SourceKey};

mod memory;
mod raw;

pub use memory::{MemoryOpener, MemorySource};
pub use raw::{RawFileOpener, RawFileSource};

/// The extent of a 2D to 4D source, axes ordered `x, y, channel, polarization`.
///
/// Missing trailing axes have an extent of `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CubeShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub polarizations: usize,
    pub ndim: usize,
}

impl CubeShape {
    /// Builds a shape from axis extents, rejecting anything outside of 2D to 4D.
    pub fn from_dims(dims: &[usize]) -> Result<Self, CubeError> {
        if !(2..=4).contains(&dims.len()) {
            return Err(CubeError::UnsupportedShape(format!(
                "{} dimensions, expected 2 to 4",
                dims.len()
            )));
        }
        if dims.contains(&0) {
            return Err(CubeError::UnsupportedShape(format!(
                "empty axis in {dims:?}"
            )));
        }
        Ok(Self {
            width: dims[0],
            height: dims[1],
            depth: dims.get(2).copied().unwrap_or(1),
            polarizations: dims.get(3).copied().unwrap_or(1),
            ndim: dims.len(),
        })
    }

    pub fn dims(&self) -> Vec<usize> {
        [self.width, self.height, self.depth, self.polarizations][..self.ndim].to_vec()
    }

    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// The number of pixels of all polarizations and channels.
    pub fn len(&self) -> usize {
        self.plane_len() * self.depth * self.polarizations
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The linear index of a pixel, with `x` varying fastest.
    pub fn index(&self, x: usize, y: usize, channel: usize, polarization: usize) -> usize {
        ((polarization * self.depth + channel) * self.height + y) * self.width + x
    }
}

impl fmt::Display for CubeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<_> = self.dims().iter().map(|d| d.to_string()).collect();
        f.write_str(&dims.join("x"))
    }
}

/// A box of pixels inside a single polarization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slice {
    pub x: Range<usize>,
    pub y: Range<usize>,
    pub channels: Range<usize>,
    pub polarization: usize,
}

impl Slice {
    /// A full channel plane.
    pub fn plane(shape: &CubeShape, channel: usize, polarization: usize) -> Self {
        Self {
            x: 0..shape.width,
            y: 0..shape.height,
            channels: channel..channel + 1,
            polarization,
        }
    }

    pub fn width(&self) -> usize {
        self.x.len()
    }

    pub fn height(&self) -> usize {
        self.y.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.width() * self.height() * self.channel_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the slice is non-empty and lies inside of `shape`.
    pub fn validate(&self, shape: &CubeShape) -> Result<(), CubeError> {
        let fits = |range: &Range<usize>, extent: usize| {
            range.start < range.end && range.end <= extent
        };
        if fits(&self.x, shape.width)
            && fits(&self.y, shape.height)
            && fits(&self.channels, shape.depth)
            && self.polarization < shape.polarizations
        {
            Ok(())
        } else {
            Err(CubeError::InvalidRange(format!(
                "slice {self:?} outside of {shape}"
            )))
        }
    }
}

/// A reduction a source stores alongside its pixels.
#[derive(Clone, Debug, PartialEq)]
pub enum Precomputed {
    Stats(StatsSummary),
    Histogram(HistogramSet),
}

/// Read access to one multi-dimensional dataset.
///
/// Implementations need not be internally synchronized for reads: callers serialize all reads
/// against one source through its [`SourceHandle`](crate::caching::SourceHandle).
pub trait DataSource: Send + Sync + fmt::Debug {
    fn shape(&self) -> CubeShape;

    /// Whether the underlying data mutated since the source was opened.
    fn has_changed(&self) -> bool;

    /// Reads a box of pixels, ordered channel-major then row-major (`x` fastest).
    fn read_slice(&self, slice: &Slice) -> Result<Vec<f32>, CubeError>;

    /// Whether a pre-transposed copy with a contiguous spectral axis is available.
    fn has_swizzled(&self) -> bool {
        false
    }

    /// Reads a box of pixels from the swizzled copy, ordered by `x`, then `y`, with the
    /// channel varying fastest.
    fn read_swizzled(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        let _ = slice;
        Err(CubeError::Io("source has no swizzled data".into()))
    }

    /// Whether the source stores an aggregate of this kind for its whole image.
    fn has_precomputed_stats(&self, kind: DataKind) -> bool {
        let _ = kind;
        false
    }

    /// Reads a stored whole-image aggregate, or `None` if there is none for this selection.
    fn read_precomputed_stats(
        &self,
        kind: DataKind,
        polarization: usize,
        channel: ChannelOrAll,
        num_bins: u32,
    ) -> Result<Option<Precomputed>, CubeError> {
        let _ = (kind, polarization, channel, num_bins);
        Ok(None)
    }

    /// The area of the restoring beam in pixels, used for flux densities.
    fn beam_area(&self) -> Option<f64> {
        None
    }
}

/// Opens data sources by key.
pub trait SourceOpener: Send + Sync + 'static {
    fn open(&self, key: &SourceKey) -> Result<Arc<dyn DataSource>, CubeError>;
}

impl<F> SourceOpener for F
where
    F: Fn(&SourceKey) -> Result<Arc<dyn DataSource>, CubeError> + Send + Sync + 'static,
{
    fn open(&self, key: &SourceKey) -> Result<Arc<dyn DataSource>, CubeError> {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_dimensionality() {
        assert!(matches!(
            CubeShape::from_dims(&[10]),
            Err(CubeError::UnsupportedShape(_))
        ));
        assert!(matches!(
            CubeShape::from_dims(&[1, 2, 3, 4, 5]),
            Err(CubeError::UnsupportedShape(_))
        ));
        assert!(matches!(
            CubeShape::from_dims(&[4, 0, 2]),
            Err(CubeError::UnsupportedShape(_))
        ));

        let shape = CubeShape::from_dims(&[4, 3]).unwrap();
        assert_eq!((shape.depth, shape.polarizations), (1, 1));
        assert_eq!(shape.to_string(), "4x3");

        let shape = CubeShape::from_dims(&[4, 3, 5, 2]).unwrap();
        assert_eq!(shape.len(), 120);
        assert_eq!(shape.index(1, 2, 3, 1), ((5 + 3) * 3 + 2) * 4 + 1);
    }

    #[test]
    fn test_slice_validation() {
        let shape = CubeShape::from_dims(&[4, 3, 5]).unwrap();
        assert!(Slice::plane(&shape, 4, 0).validate(&shape).is_ok());
        assert!(Slice::plane(&shape, 5, 0).validate(&shape).is_err());
        assert!(Slice::plane(&shape, 0, 1).validate(&shape).is_err());

        let empty = Slice {
            x: 2..2,
            y: 0..3,
            channels: 0..1,
            polarization: 0,
        };
        assert!(matches!(
            empty.validate(&shape),
            Err(CubeError::InvalidRange(_))
        ));
    }
}
