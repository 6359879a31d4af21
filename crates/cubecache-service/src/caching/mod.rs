//! The caches owned by a session.
//!
//! - [`SourceHandleCache`] bounds the number of open data sources.
//! - [`TileCache`] keeps decoded tiles for repeated views of a source.
//! - [`ChannelPlaneCache`] keeps the current channel plane, or the whole cube.
//! - [`RequirementsStore`] tracks what the client subscribed to.
//! - [`AggregateCache`] memoizes the computed reductions.
//!
//! The two bounded caches evict strictly by least recent use, see [`lru::LruCache`].

mod aggregates;
mod handles;
mod planes;
mod requirements;
mod tiles;

pub use aggregates::{Aggregate, AggregateCache, AggregatePayload, SpectralProfile};
pub use handles::{SourceHandle, SourceHandleCache};
pub use planes::{ChannelPlaneCache, MemoryBudget, PlaneMode, PlaneView, Reservation};
pub use requirements::{
    ChannelSelector, HistogramConfig, PolarizationSelector, RegionRequirements, Requirements,
    RequirementsChange, RequirementsStore, SpectralConfig, StatsConfig,
};
pub use tiles::{CHUNK_SIZE, TileCache, TileData, TileKey};
