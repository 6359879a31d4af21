//! Bookkeeping of the jobs in flight.
//!
//! There is at most one [`InFlightJob`] per [`AggregateKey`]. Requests for a key that is
//! already being computed attach to the existing job instead of starting another one. A job
//! whose computation got cancelled can be asked to run again, which happens within the same
//! in-flight marker, so two computations of one key never overlap.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;

use crate::cancellation::CancelReason;
use crate::compute::{JobState, PartialObserver, PartialResult};
use crate::types::AggregateKey;

#[derive(Debug)]
struct Subscriber {
    /// The run this subscriber receives results of.
    run: u64,
    sender: mpsc::UnboundedSender<PartialResult>,
}

#[derive(Debug)]
struct Slot {
    run: u64,
    state: JobState,
    /// The cancel flag of the current run.
    flag: Arc<AtomicBool>,
    /// The region generation the current run computes for, once it is known.
    generation: Option<u64>,
    rerun: bool,
    finished: bool,
    latest: Option<PartialResult>,
    subscribers: Vec<Subscriber>,
}

/// A computation of one aggregate, possibly spanning several runs.
#[derive(Debug)]
pub struct InFlightJob {
    key: AggregateKey,
    slot: Mutex<Slot>,
}

impl InFlightJob {
    fn new(key: AggregateKey) -> Self {
        Self {
            key,
            slot: Mutex::new(Slot {
                run: 0,
                state: JobState::Pending,
                flag: Default::default(),
                generation: None,
                rerun: false,
                finished: false,
                latest: None,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> AggregateKey {
        self.key
    }

    pub fn state(&self) -> JobState {
        self.slot.lock().unwrap().state.clone()
    }

    /// The cancel flag for the run that is about to start.
    pub(crate) fn begin_run(&self) -> Arc<AtomicBool> {
        let mut slot = self.slot.lock().unwrap();
        slot.state = JobState::Running;
        Arc::clone(&slot.flag)
    }

    /// Records the region generation the current run captured.
    pub(crate) fn set_generation(&self, generation: u64) {
        self.slot.lock().unwrap().generation = Some(generation);
    }

    /// Records the end of a run, returning `true` if the job has to run again.
    ///
    /// Subscribers of the ended run are disconnected, those waiting for the next run stay.
    pub(crate) fn end_run(&self, state: JobState) -> bool {
        let mut slot = self.slot.lock().unwrap();
        let rerun = mem::take(&mut slot.rerun);
        if rerun && !matches!(state, JobState::Cancelled(CancelReason::Shutdown)) {
            slot.run += 1;
            slot.flag = Default::default();
            slot.generation = None;
            slot.latest = None;
            slot.state = JobState::Pending;
            let run = slot.run;
            slot.subscribers.retain(|s| s.run == run);
            return true;
        }
        slot.state = state;
        slot.finished = true;
        slot.subscribers.clear();
        false
    }

    /// Cancels the current run.
    pub fn cancel(&self) {
        let slot = self.slot.lock().unwrap();
        slot.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().unwrap().flag.load(Ordering::SeqCst)
    }

    /// Makes sure a computation for the region at `generation` will deliver a result,
    /// returning `false` if the job already finished for good.
    ///
    /// A job whose current run was cancelled, or computes for an outdated definition of the
    /// region, is scheduled to run again.
    pub(crate) fn ensure_result(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.finished {
            return false;
        }
        let outdated = slot.generation.is_some_and(|captured| captured != generation);
        if outdated || slot.flag.load(Ordering::SeqCst) {
            slot.rerun = true;
        }
        true
    }

    /// Streams the results of this job, starting with the latest partial result.
    ///
    /// When the current run was cancelled or is due to run again, the stream delivers the
    /// results of the next run. The stream ends when the job finishes. Returns `None` if it
    /// already did.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<PartialResult>> {
        let mut slot = self.slot.lock().unwrap();
        if slot.finished {
            return None;
        }
        let (sender, receiver) = mpsc::unbounded();
        let run = if slot.rerun || slot.flag.load(Ordering::SeqCst) {
            slot.run + 1
        } else {
            if let Some(latest) = &slot.latest {
                sender.unbounded_send(latest.clone()).ok();
            }
            slot.run
        };
        slot.subscribers.push(Subscriber { run, sender });
        Some(receiver)
    }
}

impl PartialObserver for InFlightJob {
    fn on_partial(&self, partial: &PartialResult) {
        let mut slot = self.slot.lock().unwrap();
        let run = slot.run;
        slot.subscribers
            .retain(|s| s.run != run || s.sender.unbounded_send(partial.clone()).is_ok());
        slot.latest = Some(partial.clone());
    }
}

/// The outcome of [`JobRegistry::claim`].
pub enum Claim {
    /// The caller owns a new job and has to run it.
    Started(Arc<InFlightJob>),
    /// A job for the key is already in flight.
    Running(Arc<InFlightJob>),
}

/// The in-flight markers of a session, guarded by a short-held lock of their own.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<AggregateKey, Arc<InFlightJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks for a job in flight, creating one if there is none.
    pub fn claim(&self, key: AggregateKey) -> Claim {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get(&key) {
            if !job.slot.lock().unwrap().finished {
                return Claim::Running(Arc::clone(job));
            }
        }
        let job = Arc::new(InFlightJob::new(key));
        jobs.insert(key, Arc::clone(&job));
        Claim::Started(job)
    }

    /// Removes the marker of a finished job, unless it was already replaced.
    pub fn release(&self, job: &Arc<InFlightJob>) {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.get(&job.key).is_some_and(|current| Arc::ptr_eq(current, job)) {
            jobs.remove(&job.key);
        }
    }

    pub fn get(&self, key: &AggregateKey) -> Option<Arc<InFlightJob>> {
        self.jobs.lock().unwrap().get(key).cloned()
    }

    /// Cancels the jobs whose keys match, returning how many were cancelled.
    pub fn cancel_where<F: Fn(&AggregateKey) -> bool>(&self, f: F) -> usize {
        let jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for job in jobs.values().filter(|job| f(&job.key)) {
            job.cancel();
            count += 1;
        }
        count
    }

    pub fn keys(&self) -> Vec<AggregateKey> {
        let mut keys: Vec<_> = self.jobs.lock().unwrap().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
