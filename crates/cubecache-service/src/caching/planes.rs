use std::ops::Range;
use std::sync::{Arc, Mutex, RwLock};

use super::handles::SourceHandle;
use crate::error::CubeError;
use crate::source::{CubeShape, Slice};

/// A pool of bytes that open sources may reserve to hold their whole cube in memory.
#[derive(Debug)]
pub struct MemoryBudget {
    available: Mutex<u64>,
}

impl MemoryBudget {
    pub fn new(bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(bytes),
        })
    }

    /// Reserves `bytes`, or returns `None` if not enough of the budget is left.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Option<Reservation> {
        let mut available = self.available.lock().unwrap();
        if bytes == 0 || bytes > *available {
            return None;
        }
        *available -= bytes;
        Some(Reservation {
            budget: Arc::clone(self),
            bytes,
        })
    }

    pub fn available(&self) -> u64 {
        *self.available.lock().unwrap()
    }
}

/// A part of a [`MemoryBudget`], handed back when dropped.
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        *self.budget.available.lock().unwrap() += self.bytes;
    }
}

/// Whether a [`ChannelPlaneCache`] holds one plane or the whole cube.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneMode {
    Channel,
    Cube,
}

/// A read-only view of rows of a cached channel plane.
#[derive(Clone, Debug)]
pub struct PlaneView {
    data: Arc<[f32]>,
    offset: usize,
    width: usize,
    rows: Range<usize>,
    pub channel: u32,
    pub polarization: u32,
}

impl PlaneView {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// The pixels of the viewed rows, `x` varying fastest.
    pub fn as_slice(&self) -> &[f32] {
        let start = self.offset + self.rows.start * self.width;
        &self.data[start..start + self.rows.len() * self.width]
    }

    /// The pixel at plane coordinates `(x, y)`, which must lie within the viewed rows.
    pub fn get(&self, x: usize, y: usize) -> f32 {
        debug_assert!(self.rows.contains(&y) && x < self.width);
        self.data[self.offset + y * self.width + x]
    }

    /// Narrows the view to a subset of its rows.
    pub fn subrows(&self, rows: Range<usize>) -> Result<Self, CubeError> {
        if rows.start > rows.end || rows.start < self.rows.start || rows.end > self.rows.end {
            return Err(CubeError::InvalidRange(format!(
                "rows {rows:?} outside of {:?}",
                self.rows
            )));
        }
        Ok(Self {
            rows,
            ..self.clone()
        })
    }
}

#[derive(Debug, Default)]
struct PlaneState {
    /// The selected `(channel, polarization)`.
    selected: Option<(u32, u32)>,
    /// Whether `plane` holds the selected plane.
    valid: bool,
    /// The last filled plane, in channel mode.
    plane: Option<(Arc<[f32]>, (u32, u32))>,
    /// Every plane, in cube mode.
    cube: Option<Arc<[f32]>>,
}

/// Holds the current channel plane of one source, or its whole cube when the memory budget
/// allows.
///
/// Refills are serialized by a writer lock. The I/O of a refill goes into a private buffer, so
/// readers keep reading the previous plane and are blocked only while the buffers are swapped.
#[derive(Debug)]
pub struct ChannelPlaneCache {
    shape: CubeShape,
    mode: PlaneMode,
    state: RwLock<PlaneState>,
    refill: Mutex<()>,
    _reservation: Option<Reservation>,
}

impl ChannelPlaneCache {
    /// Creates an empty cache, in cube mode if the whole cube fits into `budget`.
    pub fn new(shape: CubeShape, budget: &Arc<MemoryBudget>) -> Self {
        let bytes = shape.len() as u64 * std::mem::size_of::<f32>() as u64;
        let reservation = if shape.depth * shape.polarizations > 1 {
            budget.try_reserve(bytes)
        } else {
            None
        };
        let mode = match reservation {
            Some(_) => PlaneMode::Cube,
            None => PlaneMode::Channel,
        };
        tracing::debug!(%shape, ?mode, "created channel plane cache");
        Self {
            shape,
            mode,
            state: RwLock::new(PlaneState::default()),
            refill: Mutex::new(()),
            _reservation: reservation,
        }
    }

    pub fn mode(&self) -> PlaneMode {
        self.mode
    }

    /// The currently selected `(channel, polarization)`.
    pub fn current(&self) -> Option<(u32, u32)> {
        self.state.read().unwrap().selected
    }

    /// Whether the selected plane is loaded.
    pub fn is_valid(&self) -> bool {
        self.state.read().unwrap().valid
    }

    /// Selects the plane to hold, reading it from `handle` if needed.
    ///
    /// Selecting the current plane again is free. In cube mode, only the first call reads.
    /// When the read fails, the cache stays invalid and keeps serving the previous plane.
    pub fn set_current(
        &self,
        handle: &SourceHandle,
        channel: u32,
        polarization: u32,
    ) -> Result<(), CubeError> {
        if channel as usize >= self.shape.depth || polarization as usize >= self.shape.polarizations {
            return Err(CubeError::InvalidRange(format!(
                "channel {channel}, polarization {polarization} outside of {}",
                self.shape
            )));
        }
        let target = (channel, polarization);
        let _writer = self.refill.lock().unwrap();
        {
            let mut state = self.state.write().unwrap();
            if state.valid && state.selected == Some(target) {
                return Ok(());
            }
            state.selected = Some(target);
            let cube_loaded = state.cube.is_some();
            state.valid = self.mode == PlaneMode::Cube && cube_loaded;
            if state.valid {
                return Ok(());
            }
        }

        metric!(counter("planes.refill") += 1, "mode" => self.mode_tag());
        match self.mode {
            PlaneMode::Channel => {
                let slice = Slice::plane(&self.shape, channel as usize, polarization as usize);
                let data: Arc<[f32]> = handle.read_slice(&slice)?.into();
                let mut state = self.state.write().unwrap();
                state.plane = Some((data, target));
                state.valid = true;
            }
            PlaneMode::Cube => {
                let mut data = Vec::with_capacity(self.shape.len());
                for pol in 0..self.shape.polarizations {
                    let slice = Slice {
                        x: 0..self.shape.width,
                        y: 0..self.shape.height,
                        channels: 0..self.shape.depth,
                        polarization: pol,
                    };
                    data.extend(handle.read_slice(&slice)?);
                }
                let mut state = self.state.write().unwrap();
                state.cube = Some(data.into());
                state.valid = true;
            }
        }
        tracing::trace!(channel, polarization, "refilled channel plane cache");
        Ok(())
    }

    /// A view of rows of the selected plane.
    ///
    /// While a refill is running, this serves the previously filled plane.
    pub fn read(&self, rows: Range<usize>) -> Result<PlaneView, CubeError> {
        let state = self.state.read().unwrap();
        let view = match (&state.cube, &state.plane, state.selected) {
            (Some(cube), _, Some((channel, polarization))) => self.cube_view(cube, channel, polarization),
            (None, Some((data, (channel, polarization))), _) => self.plane_view(data, *channel, *polarization),
            _ => return Err(CubeError::NotFilled),
        };
        drop(state);
        view.subrows(rows)
    }

    /// A view of the whole plane `(channel, polarization)`, if it is loaded.
    pub fn plane(&self, channel: u32, polarization: u32) -> Option<PlaneView> {
        let state = self.state.read().unwrap();
        if let Some(cube) = &state.cube {
            if (channel as usize) < self.shape.depth && (polarization as usize) < self.shape.polarizations {
                return Some(self.cube_view(cube, channel, polarization));
            }
            return None;
        }
        match &state.plane {
            Some((data, loaded)) if *loaded == (channel, polarization) => {
                Some(self.plane_view(data, channel, polarization))
            }
            _ => None,
        }
    }

    /// Forgets all loaded data, e.g. after the source changed.
    pub fn reset(&self) {
        let _writer = self.refill.lock().unwrap();
        let mut state = self.state.write().unwrap();
        let selected = state.selected;
        *state = PlaneState {
            selected,
            ..Default::default()
        };
    }

    fn cube_view(&self, cube: &Arc<[f32]>, channel: u32, polarization: u32) -> PlaneView {
        PlaneView {
            data: Arc::clone(cube),
            offset: self.shape.index(0, 0, channel as usize, polarization as usize),
            width: self.shape.width,
            rows: 0..self.shape.height,
            channel,
            polarization,
        }
    }

    fn plane_view(&self, data: &Arc<[f32]>, channel: u32, polarization: u32) -> PlaneView {
        PlaneView {
            data: Arc::clone(data),
            offset: 0,
            width: self.shape.width,
            rows: 0..self.shape.height,
            channel,
            polarization,
        }
    }

    fn mode_tag(&self) -> &'static str {
        match self.mode {
            PlaneMode::Channel => "channel",
            PlaneMode::Cube => "cube",
        }
    }
}
