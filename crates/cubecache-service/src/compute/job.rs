//! The lifecycle of a computation job.
//!
//! The states are encoded in types: a [`PendingJob`] can only be started, and only a
//! [`RunningJob`] can reach one of the terminal outcomes.

use std::fmt;
use std::time::Instant;

use crate::caching::Aggregate;
use crate::cancellation::CancelReason;
use crate::error::CubeError;
use crate::types::AggregateKey;

/// The observable state of a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled(CancelReason),
    Failed(CubeError),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled(reason) => write!(f, "cancelled ({reason})"),
            Self::Failed(err) => write!(f, "failed ({err})"),
        }
    }
}

/// A job that was scheduled, but did not start yet.
#[derive(Debug)]
pub struct PendingJob {
    key: AggregateKey,
    epoch: u64,
}

impl PendingJob {
    pub fn new(key: AggregateKey, epoch: u64) -> Self {
        Self { key, epoch }
    }

    pub fn key(&self) -> &AggregateKey {
        &self.key
    }

    pub fn start(self) -> RunningJob {
        metric!(counter("jobs.started") += 1, "kind" => self.key.kind.as_str());
        tracing::debug!(key = %self.key, epoch = self.epoch, "job started");
        RunningJob {
            key: self.key,
            epoch: self.epoch,
            started: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct RunningJob {
    key: AggregateKey,
    epoch: u64,
    started: Instant,
}

impl RunningJob {
    pub fn key(&self) -> &AggregateKey {
        &self.key
    }

    /// The epoch every write of this job is stamped with.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn complete(self, aggregate: Aggregate) -> JobOutcome {
        tracing::info!(key = %self.key, elapsed = ?self.started.elapsed(), "job completed");
        self.finish("completed");
        JobOutcome::Completed(aggregate)
    }

    pub fn cancel(self, reason: CancelReason) -> JobOutcome {
        tracing::debug!(key = %self.key, %reason, "job cancelled");
        self.finish("cancelled");
        JobOutcome::Cancelled(reason)
    }

    pub fn fail(self, error: CubeError) -> JobOutcome {
        tracing::error!(key = %self.key, error = &error as &dyn std::error::Error, "job failed");
        metric!(counter("jobs.errors") += 1, "error" => error.metrics_tag());
        self.finish("failed");
        JobOutcome::Failed(error)
    }

    fn finish(&self, outcome: &str) {
        let kind = self.key.kind.as_str();
        metric!(counter(&format!("jobs.{outcome}")) += 1, "kind" => kind);
        metric!(timer("jobs.duration") = self.started.elapsed(), "kind" => kind, "outcome" => outcome);
    }
}

/// How a job ended.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Completed(Aggregate),
    Cancelled(CancelReason),
    Failed(CubeError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Cancelled(reason) => JobState::Cancelled(*reason),
            Self::Failed(err) => JobState::Failed(err.clone()),
        }
    }

    pub fn aggregate(&self) -> Option<&Aggregate> {
        match self {
            Self::Completed(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}
