use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::cancellation::CancellationController;
use crate::compute::{HistogramSet, StatsSummary};
use crate::types::{AggregateKey, DataKind, RegionId, SourceId};

/// The reduced value of an aggregate.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregatePayload {
    Histogram(HistogramSet),
    Stats(StatsSummary),
    Spectral(SpectralProfile),
}

impl AggregatePayload {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Histogram(_) => DataKind::Histogram,
            Self::Stats(_) => DataKind::Stats,
            Self::Spectral(_) => DataKind::SpectralSeries,
        }
    }
}

/// Statistics of a region for every channel of one polarization.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpectralProfile {
    pub channels: Vec<StatsSummary>,
}

impl SpectralProfile {
    /// The values of one statistic along the spectral axis.
    pub fn series(&self, stat: crate::compute::StatsType) -> Vec<Option<f64>> {
        self.channels.iter().map(|c| c.get(stat)).collect()
    }
}

/// A memoized reduction, as stored in and handed out by the [`AggregateCache`].
///
/// Readers get their own snapshot; the payload itself is shared and immutable.
#[derive(Clone, Debug)]
pub struct Aggregate {
    pub key: AggregateKey,
    pub payload: Arc<AggregatePayload>,
    /// Orders writes: an older epoch never overwrites a newer one.
    pub epoch: u64,
    /// The region generation the payload was computed for.
    pub generation: u64,
    pub complete: bool,
    pub progress: f32,
    /// Set when the requirements changed; the payload may be served but must be recomputed.
    pub invalidated: bool,
}

impl Aggregate {
    /// Whether the aggregate can be served without triggering a recomputation.
    pub fn is_fresh(&self) -> bool {
        self.complete && !self.invalidated
    }
}

/// Memoized aggregates of all sources and regions of a session.
///
/// There is no eviction: entries go away when their region, source or requirement is removed.
#[derive(Debug)]
pub struct AggregateCache {
    entries: RwLock<HashMap<AggregateKey, Aggregate>>,
    epochs: AtomicU64,
    cancellation: Arc<CancellationController>,
}

impl AggregateCache {
    pub fn new(cancellation: Arc<CancellationController>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            cancellation,
        }
    }

    /// Hands out a new epoch, greater than all previous ones.
    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns a snapshot of the aggregate, unless it was computed for an outdated region.
    pub fn lookup(&self, key: &AggregateKey) -> Option<Aggregate> {
        let aggregate = self.peek(key)?;
        if aggregate.generation != self.cancellation.generation(key.region) {
            metric!(counter("aggregates.miss") += 1, "reason" => "stale");
            return None;
        }
        metric!(counter("aggregates.hit") += 1, "kind" => key.kind.as_str());
        Some(aggregate)
    }

    /// Returns a snapshot of the stored aggregate, even if it is stale.
    pub fn peek(&self, key: &AggregateKey) -> Option<Aggregate> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Stores an aggregate, unless one with a newer epoch is already stored.
    ///
    /// Partial results do not replace an invalidated complete aggregate of the same region
    /// generation.
    ///
    /// Returns whether the aggregate was stored.
    pub fn upsert(&self, aggregate: Aggregate) -> bool {
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&aggregate.key) {
            if aggregate.epoch < existing.epoch {
                tracing::debug!(
                    key = %aggregate.key,
                    epoch = aggregate.epoch,
                    stored = existing.epoch,
                    "dropping late aggregate write"
                );
                metric!(counter("aggregates.dropped_stale_epoch") += 1);
                return false;
            }
            // the last good payload is served until its recomputation completes
            if !aggregate.complete
                && existing.complete
                && existing.invalidated
                && existing.generation == aggregate.generation
            {
                return false;
            }
        }
        entries.insert(aggregate.key, aggregate);
        true
    }

    /// Marks the matching aggregates as needing recomputation, keeping their payloads.
    ///
    /// The stored epochs are advanced, so writes of jobs started before this call are dropped.
    pub fn invalidate(&self, source: SourceId, region: RegionId, kind: DataKind) -> usize {
        self.invalidate_where(|key| key.source == source && key.region == region && key.kind == kind)
    }

    /// Like [`invalidate`](Self::invalidate), for every aggregate matching `f`.
    pub fn invalidate_where<F: Fn(&AggregateKey) -> bool>(&self, f: F) -> usize {
        let mut entries = self.entries.write().unwrap();
        let mut count = 0;
        for aggregate in entries.values_mut().filter(|aggregate| f(&aggregate.key)) {
            aggregate.invalidated = true;
            aggregate.epoch = self.next_epoch();
            count += 1;
        }
        count
    }

    /// Removes the aggregates of one kind of a region.
    pub fn remove_kind(&self, source: SourceId, region: RegionId, kind: DataKind) -> usize {
        self.remove_where(|key| key.source == source && key.region == region && key.kind == kind)
    }

    /// Removes the aggregates of a region across all sources.
    pub fn remove_region(&self, region: RegionId) -> usize {
        self.remove_where(|key| key.region == region)
    }

    pub fn remove_source(&self, source: SourceId) -> usize {
        self.remove_where(|key| key.source == source)
    }

    fn remove_where<F: Fn(&AggregateKey) -> bool>(&self, f: F) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !f(key));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelOrAll;

    fn key(region: i32, kind: DataKind) -> AggregateKey {
        AggregateKey {
            source: SourceId(0),
            region: RegionId(region),
            kind,
            polarization: 0,
            channel: ChannelOrAll::All,
        }
    }

    fn aggregate(key: AggregateKey, epoch: u64, count: u64) -> Aggregate {
        Aggregate {
            key,
            payload: Arc::new(AggregatePayload::Stats(StatsSummary {
                count,
                ..Default::default()
            })),
            epoch,
            generation: 0,
            complete: true,
            progress: 1.0,
            invalidated: false,
        }
    }

    fn count(aggregate: &Aggregate) -> u64 {
        match &*aggregate.payload {
            AggregatePayload::Stats(stats) => stats.count,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_epoch_ordering() {
        let cache = AggregateCache::new(CancellationController::new());
        let key = key(1, DataKind::Stats);

        assert!(cache.upsert(aggregate(key, 5, 1)));
        assert!(!cache.upsert(aggregate(key, 4, 2)));
        assert_eq!(count(&cache.lookup(&key).unwrap()), 1);

        // the same job may keep refining its own entry
        assert!(cache.upsert(aggregate(key, 5, 3)));
        assert!(cache.upsert(aggregate(key, 6, 4)));
        assert_eq!(count(&cache.lookup(&key).unwrap()), 4);
    }

    #[test]
    fn test_stale_generation() {
        let cancellation = CancellationController::new();
        let cache = AggregateCache::new(cancellation.clone());
        let key = key(1, DataKind::Stats);
        cache.upsert(aggregate(key, 1, 1));

        cancellation.bump(RegionId(1));
        assert!(cache.lookup(&key).is_none());
        assert!(cache.peek(&key).is_some());
    }

    #[test]
    fn test_invalidate_keeps_payload() {
        let cache = AggregateCache::new(CancellationController::new());
        let stats = key(1, DataKind::Stats);
        let histogram = key(1, DataKind::Histogram);
        let epoch = cache.next_epoch();
        cache.upsert(aggregate(stats, epoch, 7));
        cache.upsert(aggregate(histogram, epoch, 8));

        assert_eq!(cache.invalidate(SourceId(0), RegionId(1), DataKind::Stats), 1);
        let stored = cache.lookup(&stats).unwrap();
        assert!(stored.invalidated);
        assert!(!stored.is_fresh());
        assert_eq!(count(&stored), 7);
        assert!(cache.lookup(&histogram).unwrap().is_fresh());

        // a write of a job started before the invalidation is dropped
        assert!(!cache.upsert(aggregate(stats, epoch, 9)));
        assert!(cache.upsert(aggregate(stats, cache.next_epoch(), 10)));
        assert!(cache.lookup(&stats).unwrap().is_fresh());
    }

    #[test]
    fn test_partial_does_not_replace_invalidated() {
        let cache = AggregateCache::new(CancellationController::new());
        let key = key(1, DataKind::Stats);
        cache.upsert(aggregate(key, cache.next_epoch(), 7));
        cache.invalidate(SourceId(0), RegionId(1), DataKind::Stats);

        let epoch = cache.next_epoch();
        let mut partial = aggregate(key, epoch, 3);
        partial.complete = false;
        partial.progress = 0.5;
        assert!(!cache.upsert(partial));
        assert_eq!(count(&cache.lookup(&key).unwrap()), 7);

        assert!(cache.upsert(aggregate(key, epoch, 12)));
        let stored = cache.lookup(&key).unwrap();
        assert!(stored.is_fresh());
        assert_eq!(count(&stored), 12);
    }

    #[test]
    fn test_removal() {
        let cache = AggregateCache::new(CancellationController::new());
        cache.upsert(aggregate(key(1, DataKind::Stats), 1, 0));
        cache.upsert(aggregate(key(1, DataKind::Histogram), 1, 0));
        cache.upsert(aggregate(key(2, DataKind::Stats), 1, 0));

        assert_eq!(cache.remove_kind(SourceId(0), RegionId(1), DataKind::Histogram), 1);
        assert_eq!(cache.remove_region(RegionId(1)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove_source(SourceId(0)), 1);
        assert!(cache.is_empty());
    }
}
