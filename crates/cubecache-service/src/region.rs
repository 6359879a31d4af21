use std::ops::Range;
use std::sync::Arc;

use crate::error::CubeError;
use crate::source::CubeShape;

/// The pixels selected by a region, as a boolean mask over its bounding box.
///
/// Rasterizing shapes into masks happens outside of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionMask {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    /// Row-major; `None` selects the whole bounding box.
    bits: Option<Arc<[bool]>>,
}

impl RegionMask {
    /// A mask over the box at `(x, y)`, with `bits` in row-major order.
    pub fn new(x: usize, y: usize, width: usize, height: usize, bits: Vec<bool>) -> Result<Self, CubeError> {
        if width == 0 || height == 0 {
            return Err(CubeError::InvalidRange("empty region mask".into()));
        }
        if bits.len() != width * height {
            return Err(CubeError::InvalidRange(format!(
                "{} mask bits for a {width}x{height} box",
                bits.len()
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
            bits: Some(bits.into()),
        })
    }

    /// Selects every pixel of a rectangle.
    pub fn rect(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width: width.max(1),
            height: height.max(1),
            bits: None,
        }
    }

    /// Selects a single pixel.
    pub fn point(x: usize, y: usize) -> Self {
        Self::rect(x, y, 1, 1)
    }

    /// Selects every pixel of an image.
    pub fn full(shape: &CubeShape) -> Self {
        Self::rect(0, 0, shape.width, shape.height)
    }

    pub fn origin(&self) -> (usize, usize) {
        (self.x, self.y)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn x_range(&self) -> Range<usize> {
        self.x..self.x + self.width
    }

    pub fn y_range(&self) -> Range<usize> {
        self.y..self.y + self.height
    }

    /// Whether every pixel of the bounding box is selected.
    pub fn is_rect(&self) -> bool {
        match &self.bits {
            None => true,
            Some(bits) => bits.iter().all(|b| *b),
        }
    }

    /// Whether the mask selects the image pixel `(x, y)`.
    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        if !self.x_range().contains(&x) || !self.y_range().contains(&y) {
            return false;
        }
        match &self.bits {
            None => true,
            Some(bits) => bits[(y - self.y) * self.width + (x - self.x)],
        }
    }

    /// The number of selected pixels.
    pub fn pixel_count(&self) -> usize {
        match &self.bits {
            None => self.width * self.height,
            Some(bits) => bits.iter().filter(|b| **b).count(),
        }
    }

    /// Whether both masks cover the same bounding box.
    pub fn same_geometry(&self, other: &RegionMask) -> bool {
        self.origin() == other.origin() && self.width == other.width && self.height == other.height
    }

    /// Checks that the bounding box lies inside the image.
    pub fn validate(&self, shape: &CubeShape) -> Result<(), CubeError> {
        if self.x + self.width > shape.width || self.y + self.height > shape.height {
            return Err(CubeError::InvalidRange(format!(
                "region {}x{} at ({}, {}) outside of {shape}",
                self.width, self.height, self.x, self.y
            )));
        }
        Ok(())
    }
}
