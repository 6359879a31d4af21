//! Addressing of image tiles in the multi-resolution tile pyramid.
//!
//! A tile at `layer` lives on a `2^layer × 2^layer` grid. Tiles are exchanged with clients as a
//! single packed `i32` of the form `layer << 24 | y << 12 | x`.

/// Edge length of a tile, in pixels.
pub const TILE_SIZE: usize = 256;

/// The deepest layer that still fits into the packed encoding.
pub const MAX_LAYER: i32 = 12;

/// The packed encoding of an invalid tile.
pub const INVALID_TILE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
}

impl Tile {
    pub fn new(x: i32, y: i32, layer: i32) -> Self {
        Self { x, y, layer }
    }

    /// Packs the tile into its 32-bit encoding, or [`INVALID_TILE`] if out of range.
    pub fn encode(self) -> i32 {
        let Self { x, y, layer } = self;
        if !(0..=MAX_LAYER).contains(&layer) {
            return INVALID_TILE;
        }
        let side = 1 << layer;
        if !(0..side).contains(&x) || !(0..side).contains(&y) {
            return INVALID_TILE;
        }
        (layer << 24) | (y << 12) | x
    }

    /// Unpacks a tile from its 32-bit encoding.
    ///
    /// This is the exact inverse of [`encode`](Self::encode) for every valid tile.
    pub fn decode(encoded: i32) -> Self {
        let encoded = encoded as u32;
        Self {
            x: (encoded & 0xfff) as i32,
            y: ((encoded >> 12) & 0xfff) as i32,
            layer: ((encoded >> 24) & 0x7f) as i32,
        }
    }

    /// The mip (downsampling factor) at which a layer renders an image of the given size.
    ///
    /// Layer 0 shows the whole image in a single tile; every further layer halves the mip.
    pub fn layer_to_mip(layer: i32, width: usize, height: usize, tile_width: usize, tile_height: usize) -> i32 {
        let tiles_x = width.div_ceil(tile_width.max(1));
        let tiles_y = height.div_ceil(tile_height.max(1));
        let total_layers = tiles_x.max(tiles_y).max(1).next_power_of_two().trailing_zeros() as i32;
        let exponent = total_layers - layer;
        if exponent < 0 { 1 } else { 1 << exponent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for layer in 0..=MAX_LAYER {
            let side = 1 << layer;
            // walking the whole grid of the deep layers is slow, so stride through it
            let step = (side / 64).max(1);
            let coords = (0..side).step_by(step as usize).chain([side - 1]);
            for x in coords.clone() {
                for y in coords.clone() {
                    let tile = Tile::new(x, y, layer);
                    let encoded = tile.encode();
                    assert_ne!(encoded, INVALID_TILE);
                    assert_eq!(Tile::decode(encoded), tile);
                }
            }
        }
    }

    #[test]
    fn test_encode_packing() {
        assert_eq!(Tile::new(0, 0, 0).encode(), 0);
        assert_eq!(Tile::new(3, 5, 4).encode(), (4 << 24) | (5 << 12) | 3);
        assert_eq!(Tile::new(4095, 4095, 12).encode(), (12 << 24) | (4095 << 12) | 4095);
    }

    #[test]
    fn test_encode_out_of_range() {
        assert_eq!(Tile::new(0, 0, 13).encode(), INVALID_TILE);
        assert_eq!(Tile::new(0, 0, -1).encode(), INVALID_TILE);
        assert_eq!(Tile::new(-1, 0, 3).encode(), INVALID_TILE);
        assert_eq!(Tile::new(0, -1, 3).encode(), INVALID_TILE);
        assert_eq!(Tile::new(8, 0, 3).encode(), INVALID_TILE);
        assert_eq!(Tile::new(0, 8, 3).encode(), INVALID_TILE);
        assert_eq!(Tile::new(1, 0, 0).encode(), INVALID_TILE);
    }

    #[test]
    fn test_layer_to_mip() {
        // 4000 px wide needs 16 tiles, which is 4 layers below the overview
        assert_eq!(Tile::layer_to_mip(0, 4000, 1000, 256, 256), 16);
        assert_eq!(Tile::layer_to_mip(2, 4000, 1000, 256, 256), 4);
        assert_eq!(Tile::layer_to_mip(4, 4000, 1000, 256, 256), 1);
        assert_eq!(Tile::layer_to_mip(0, 200, 200, 256, 256), 1);
    }
}
