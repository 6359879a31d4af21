use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::handles::SourceHandle;
use crate::error::CubeError;
use crate::source::Slice;
use crate::tile::TILE_SIZE;

/// Edge length of the block of tiles loaded by a single read.
pub const CHUNK_SIZE: usize = 2 * TILE_SIZE;

/// Addresses a full-resolution tile of one channel plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Tile column, in units of [`TILE_SIZE`].
    pub x: u32,
    /// Tile row, in units of [`TILE_SIZE`].
    pub y: u32,
    pub channel: u32,
    pub polarization: u32,
}

/// The decoded pixels of one tile. Edge tiles are cropped to the image.
#[derive(Clone, Debug, PartialEq)]
pub struct TileData {
    pub key: TileKey,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
}

/// A bounded LRU cache of decoded tiles of a single source.
#[derive(Debug)]
pub struct TileCache {
    tiles: Mutex<LruCache<TileKey, Arc<TileData>>>,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tiles: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the tile, loading its whole 2×2 chunk on a miss.
    ///
    /// The chunk is read outside of the cache lock. Every in-bounds tile of the chunk is
    /// installed, and the requested tile is installed last so it ends up most recently used.
    pub fn get(&self, key: TileKey, handle: &SourceHandle) -> Result<Arc<TileData>, CubeError> {
        if let Some(tile) = self.tiles.lock().unwrap().get(&key) {
            metric!(counter("tiles.hit") += 1);
            return Ok(Arc::clone(tile));
        }
        metric!(counter("tiles.miss") += 1);

        let mut loaded = load_chunk(key, handle)?;
        let position = loaded
            .iter()
            .position(|tile| tile.key == key)
            .ok_or_else(|| CubeError::InvalidRange(format!("tile {key:?} outside of image")))?;
        let requested = loaded.swap_remove(position);

        let mut tiles = self.tiles.lock().unwrap();
        for tile in loaded {
            // never displace a tile somebody else installed meanwhile
            if !tiles.contains(&tile.key) {
                self.install(&mut tiles, tile);
            }
        }
        if let Some(existing) = tiles.get(&key) {
            return Ok(Arc::clone(existing));
        }
        self.install(&mut tiles, Arc::clone(&requested));
        Ok(requested)
    }

    /// Returns the tile if cached, without affecting its recency.
    pub fn peek(&self, key: &TileKey) -> Option<Arc<TileData>> {
        self.tiles.lock().unwrap().peek(key).cloned()
    }

    pub fn remove(&self, key: &TileKey) -> bool {
        self.tiles.lock().unwrap().pop(key).is_some()
    }

    /// Drops every tile, e.g. when the source changed.
    pub fn clear(&self) {
        self.tiles.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.tiles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(&self, tiles: &mut LruCache<TileKey, Arc<TileData>>, tile: Arc<TileData>) {
        let key = tile.key;
        if let Some((evicted, _)) = tiles.push(key, tile) {
            if evicted != key {
                tracing::trace!(?evicted, "evicted tile");
                metric!(counter("tiles.evict") += 1);
            }
        }
    }
}

/// Reads the chunk enclosing `key` and splits it into tiles.
fn load_chunk(key: TileKey, handle: &SourceHandle) -> Result<Vec<Arc<TileData>>, CubeError> {
    let shape = handle.shape();
    let tiles_per_chunk = (CHUNK_SIZE / TILE_SIZE) as u32;
    let chunk_x = key.x - key.x % tiles_per_chunk;
    let chunk_y = key.y - key.y % tiles_per_chunk;

    let x0 = chunk_x as usize * TILE_SIZE;
    let y0 = chunk_y as usize * TILE_SIZE;
    if x0 >= shape.width || y0 >= shape.height {
        return Err(CubeError::InvalidRange(format!(
            "tile {key:?} outside of {shape}"
        )));
    }
    let slice = Slice {
        x: x0..(x0 + CHUNK_SIZE).min(shape.width),
        y: y0..(y0 + CHUNK_SIZE).min(shape.height),
        channels: key.channel as usize..key.channel as usize + 1,
        polarization: key.polarization as usize,
    };
    let chunk_width = slice.width();
    let chunk_height = slice.height();
    let pixels = handle.read_slice(&slice)?;

    let mut tiles = Vec::with_capacity(4);
    for dy in 0..tiles_per_chunk {
        for dx in 0..tiles_per_chunk {
            let tx = dx as usize * TILE_SIZE;
            let ty = dy as usize * TILE_SIZE;
            if tx >= chunk_width || ty >= chunk_height {
                continue;
            }
            let width = TILE_SIZE.min(chunk_width - tx);
            let height = TILE_SIZE.min(chunk_height - ty);
            let mut data = Vec::with_capacity(width * height);
            for row in ty..ty + height {
                let start = row * chunk_width + tx;
                data.extend_from_slice(&pixels[start..start + width]);
            }
            tiles.push(Arc::new(TileData {
                key: TileKey {
                    x: chunk_x + dx,
                    y: chunk_y + dy,
                    ..key
                },
                width,
                height,
                pixels: data,
            }));
        }
    }
    Ok(tiles)
}
