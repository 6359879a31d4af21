//! Cooperative cancellation of computation jobs.
//!
//! Cancellation is level-triggered: jobs poll a [`CancelToken`] at slice boundaries and are
//! never interrupted in the middle of a slice.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::types::RegionId;

/// Why a job stopped before completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The region was redefined or removed after the job started.
    RegionChanged,
    /// The job itself was cancelled, e.g. because its requirements changed.
    JobCancelled,
    /// The session is shutting down.
    Shutdown,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegionChanged => "region_changed",
            Self::JobCancelled => "job_cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-region generation counters plus the session-wide shutdown flag.
#[derive(Debug, Default)]
pub struct CancellationController {
    generations: RwLock<HashMap<RegionId, u64>>,
    shutdown: AtomicBool,
}

impl CancellationController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advances the generation of `region`, invalidating every job that captured an older one.
    pub fn bump(&self, region: RegionId) -> u64 {
        let mut generations = self.generations.write().unwrap();
        let generation = generations.entry(region).or_insert(0);
        *generation += 1;
        tracing::trace!(%region, generation = *generation, "bumped region generation");
        *generation
    }

    /// The current generation of `region`. Unknown regions are at generation `0`.
    pub fn generation(&self, region: RegionId) -> u64 {
        self.generations
            .read()
            .unwrap()
            .get(&region)
            .copied()
            .unwrap_or(0)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Captures the current generation of `region` for a job with its own cancel flag.
    pub fn token(self: &Arc<Self>, region: RegionId, job_flag: Arc<AtomicBool>) -> CancelToken {
        CancelToken {
            controller: Arc::clone(self),
            region,
            generation: self.generation(region),
            job_flag,
        }
    }

    /// Like [`token`](Self::token), but for a generation captured earlier.
    pub fn token_at(
        self: &Arc<Self>,
        region: RegionId,
        generation: u64,
        job_flag: Arc<AtomicBool>,
    ) -> CancelToken {
        CancelToken {
            controller: Arc::clone(self),
            region,
            generation,
            job_flag,
        }
    }
}

/// What a running job consults between slices.
#[derive(Clone, Debug)]
pub struct CancelToken {
    controller: Arc<CancellationController>,
    region: RegionId,
    generation: u64,
    job_flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that is only ever cancelled through its own flag.
    pub fn detached() -> Self {
        CancellationController::new().token(RegionId::IMAGE, Default::default())
    }

    /// The region generation captured when the job started.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Cancels just the job owning this token.
    pub fn cancel(&self) {
        self.job_flag.store(true, Ordering::SeqCst);
    }

    /// Checks whether the job may continue with its next slice.
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.controller.generation(self.region) != self.generation {
            return Err(CancelReason::RegionChanged);
        }
        if self.controller.is_shutdown() {
            return Err(CancelReason::Shutdown);
        }
        if self.job_flag.load(Ordering::SeqCst) {
            return Err(CancelReason::JobCancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations() {
        let controller = CancellationController::new();
        let region = RegionId(3);
        assert_eq!(controller.generation(region), 0);

        let token = controller.token(region, Default::default());
        assert_eq!(token.check(), Ok(()));

        assert_eq!(controller.bump(region), 1);
        assert_eq!(token.check(), Err(CancelReason::RegionChanged));

        // other regions are unaffected
        let other = controller.token(RegionId(4), Default::default());
        assert_eq!(other.check(), Ok(()));
        assert_eq!(controller.token(region, Default::default()).check(), Ok(()));
    }

    #[test]
    fn test_job_flag_and_shutdown() {
        let controller = CancellationController::new();
        let flag = Arc::new(AtomicBool::new(false));
        let token = controller.token(RegionId(1), Arc::clone(&flag));
        let sibling = controller.token(RegionId(1), Default::default());

        token.cancel();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(token.check(), Err(CancelReason::JobCancelled));
        assert_eq!(sibling.check(), Ok(()));

        controller.request_shutdown();
        assert_eq!(sibling.check(), Err(CancelReason::Shutdown));
    }
}
