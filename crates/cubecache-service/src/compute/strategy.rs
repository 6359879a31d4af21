use std::ops::Range;

use crate::region::RegionMask;
use crate::source::Slice;

/// The order in which a computation traverses the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessStrategy {
    /// Row slices of the channel-major data.
    Direct,
    /// Column slices of the swizzled copy with a contiguous spectral axis.
    Swizzled,
}

impl AccessStrategy {
    /// Picks the traversal that reads fewer strided runs.
    ///
    /// Direct access reads one run per row and channel, swizzled access one run per column.
    /// `crossover` weighs the column cost and is a tuning knob rather than a fixed contract.
    pub fn choose(
        has_swizzled: bool,
        rows: usize,
        channels: usize,
        row_span: usize,
        crossover: f64,
    ) -> Self {
        if has_swizzled && channels > 1 && (rows * channels) as f64 > crossover * row_span as f64 {
            Self::Swizzled
        } else {
            Self::Direct
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Swizzled => "swizzled",
        }
    }
}

/// The slices a computation reads, in order.
#[derive(Clone, Debug)]
pub struct SlicePlan {
    pub strategy: AccessStrategy,
    pub channels: Range<usize>,
    slices: Vec<Slice>,
}

impl SlicePlan {
    /// Splits the bounding box of `mask` over `channels` into slices of at most
    /// `max_slice_pixels` pixels, unless a single row or column of one channel is larger.
    pub fn new(
        strategy: AccessStrategy,
        mask: &RegionMask,
        channels: Range<usize>,
        polarization: usize,
        max_slice_pixels: usize,
    ) -> Self {
        let max = max_slice_pixels.max(1);
        let nchan = channels.len().max(1);
        let mut slices = Vec::new();

        match strategy {
            AccessStrategy::Direct => {
                let row = mask.width() * nchan;
                let (rows_per, chans_per) = if row <= max {
                    (max / row, nchan)
                } else {
                    (1, (max / mask.width()).max(1))
                };
                for y in blocks(mask.y_range(), rows_per) {
                    for c in blocks(channels.clone(), chans_per) {
                        slices.push(Slice {
                            x: mask.x_range(),
                            y: y.clone(),
                            channels: c,
                            polarization,
                        });
                    }
                }
            }
            AccessStrategy::Swizzled => {
                let column = mask.height() * nchan;
                let (cols_per, rows_per) = if column <= max {
                    (max / column, mask.height())
                } else {
                    (1, (max / nchan).max(1))
                };
                for x in blocks(mask.x_range(), cols_per) {
                    for y in blocks(mask.y_range(), rows_per) {
                        slices.push(Slice {
                            x: x.clone(),
                            y,
                            channels: channels.clone(),
                            polarization,
                        });
                    }
                }
            }
        }

        Self {
            strategy,
            channels,
            slices,
        }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Calls `f(channel, value)` for every masked pixel of a slice read with this plan's strategy.
    #[inline]
    pub fn visit<F: FnMut(usize, f32)>(&self, slice: &Slice, data: &[f32], mask: &RegionMask, mut f: F) {
        let mut values = data.iter().copied();
        match self.strategy {
            AccessStrategy::Direct => {
                for c in slice.channels.clone() {
                    for y in slice.y.clone() {
                        for x in slice.x.clone() {
                            let Some(v) = values.next() else { return };
                            if mask.contains(x, y) {
                                f(c, v);
                            }
                        }
                    }
                }
            }
            AccessStrategy::Swizzled => {
                for x in slice.x.clone() {
                    for y in slice.y.clone() {
                        let selected = mask.contains(x, y);
                        for c in slice.channels.clone() {
                            let Some(v) = values.next() else { return };
                            if selected {
                                f(c, v);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn blocks(range: Range<usize>, per: usize) -> impl Iterator<Item = Range<usize>> {
    let end = range.end;
    range
        .step_by(per.max(1))
        .map(move |start| start..(start + per.max(1)).min(end))
}
