//! The caching and progressive aggregation engine of a viewer for large 2D to 4D data cubes.
//!
//! Everything a session needs is owned by a [`CubeService`](services::CubeService): the bounded
//! caches of open sources and decoded tiles, the channel plane cache, the memoized aggregates,
//! and the jobs computing them slice by slice.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod cancellation;
pub mod compute;
pub mod config;
pub mod error;
pub mod region;
pub mod services;
pub mod source;
pub mod tile;
pub mod types;
pub mod utils;
