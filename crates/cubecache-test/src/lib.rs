//! Helpers for testing the cube service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Raw cube files written into it are gone once it is dropped,
//!    so assign it to a variable in the test function (e.g. `let dir = test::tempdir()`).
//!
//!  - The synthetic cubes are laid out with `x` varying fastest and polarization slowest, the
//!    layout every source in the engine reads and writes.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the engine crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cubecache_service=trace,cubecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// The pixel count of a cube with the given dimensions.
pub fn cube_len(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// A cube whose pixel values encode their position.
///
/// The value at `(x, y, channel, polarization)` is `x + 10 * y + 1000 * channel + 100000 *
/// polarization`, which makes misplaced reads easy to spot.
pub fn gradient_cube(dims: &[usize]) -> Vec<f32> {
    let width = dims.first().copied().unwrap_or(1);
    let height = dims.get(1).copied().unwrap_or(1);
    let depth = dims.get(2).copied().unwrap_or(1);
    let plane = width * height;

    (0..cube_len(dims))
        .map(|i| {
            let x = i % width;
            let y = (i / width) % height;
            let channel = (i / plane) % depth;
            let polarization = i / (plane * depth);
            (x + 10 * y + 1000 * channel + 100_000 * polarization) as f32
        })
        .collect()
}

/// A cube of reproducible pseudo-random values in `[-1, 1)`, with every `nan_every`th pixel
/// set to NaN (`0` for none).
pub fn noisy_cube(dims: &[usize], seed: u64, nan_every: usize) -> Vec<f32> {
    // xorshift64*, good enough to decorrelate neighbouring pixels
    let mut state = seed.max(1);
    (0..cube_len(dims))
        .map(|i| {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let value = (state.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 40) as f32 / (1u64 << 24) as f32;
            if nan_every > 0 && i % nan_every == nan_every - 1 {
                f32::NAN
            } else {
                value * 2.0 - 1.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_cube() {
        let cube = gradient_cube(&[4, 3, 2, 2]);
        assert_eq!(cube.len(), 48);
        assert_eq!(cube[1], 1.0);
        assert_eq!(cube[4], 10.0);
        assert_eq!(cube[12], 1000.0);
        assert_eq!(cube[24], 100_000.0);
    }

    #[test]
    fn test_noisy_cube() {
        let cube = noisy_cube(&[8, 8], 7, 5);
        assert_eq!(cube, noisy_cube(&[8, 8], 7, 5));
        assert_eq!(cube.iter().filter(|v| v.is_nan()).count(), 12);
        assert!(cube.iter().filter(|v| !v.is_nan()).all(|v| (-1.0..1.0).contains(v)));
    }
}
