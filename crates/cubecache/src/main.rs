//! CubeCache.
//!
//! Computes statistics, spectral profiles and histograms of regions of large 2D to 4D data
//! cubes, progressively and with every intermediate result cached, the way an interactive
//! viewer does.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod cli;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
