use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use super::aggregates::AggregateCache;
use crate::compute::StatsType;
use crate::types::{DataKind, RegionId, SourceId};

/// Which channel a histogram is computed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSelector {
    /// The channel currently shown for the source.
    Current,
    Index(u32),
    /// Every channel, i.e. a cube histogram.
    All,
}

/// Which polarization a spectral profile or statistics are computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolarizationSelector {
    /// The polarization currently shown for the source.
    Current,
    Index(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct HistogramConfig {
    pub channel: ChannelSelector,
    /// The number of bins, or [`AUTO_BINS`](crate::compute::AUTO_BINS).
    pub num_bins: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct SpectralConfig {
    pub polarization: PolarizationSelector,
    pub stats: Vec<StatsType>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct StatsConfig {
    pub polarization: PolarizationSelector,
    pub stats: Vec<StatsType>,
}

/// A full list of configs of one kind, replacing the previous list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirements {
    Histogram(Vec<HistogramConfig>),
    Spectral(Vec<SpectralConfig>),
    Stats(Vec<StatsConfig>),
}

impl Requirements {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Histogram(_) => DataKind::Histogram,
            Self::Spectral(_) => DataKind::SpectralSeries,
            Self::Stats(_) => DataKind::Stats,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Histogram(configs) => configs.is_empty(),
            Self::Spectral(configs) => configs.is_empty(),
            Self::Stats(configs) => configs.is_empty(),
        }
    }
}

/// Everything a client wants computed for one region of one source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionRequirements {
    pub histograms: Vec<HistogramConfig>,
    pub spectral: Vec<SpectralConfig>,
    pub stats: Vec<StatsConfig>,
}

impl RegionRequirements {
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty() && self.spectral.is_empty() && self.stats.is_empty()
    }

    /// Replaces the configs of one kind, returning whether they differ from before.
    fn replace(&mut self, requirements: Requirements) -> bool {
        fn swap<T: PartialEq>(slot: &mut Vec<T>, new: Vec<T>) -> bool {
            if *slot == new {
                return false;
            }
            *slot = new;
            true
        }
        match requirements {
            Requirements::Histogram(configs) => swap(&mut self.histograms, configs),
            Requirements::Spectral(configs) => swap(&mut self.spectral, configs),
            Requirements::Stats(configs) => swap(&mut self.stats, configs),
        }
    }
}

/// The effect of a [`RequirementsStore::set`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequirementsChange {
    Unchanged,
    /// The configs changed; matching aggregates were invalidated but kept.
    Replaced,
    /// The configs were cleared; matching aggregates were removed.
    Cleared,
}

/// What the client currently subscribes to, per source and region.
#[derive(Debug)]
pub struct RequirementsStore {
    entries: Mutex<HashMap<(SourceId, RegionId), RegionRequirements>>,
    aggregates: Arc<AggregateCache>,
}

impl RequirementsStore {
    pub fn new(aggregates: Arc<AggregateCache>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            aggregates,
        }
    }

    /// Replaces the configs of one kind for a region.
    ///
    /// An empty list clears the requirement, and a region left without any requirement is
    /// dropped altogether.
    pub fn set(
        &self,
        source: SourceId,
        region: RegionId,
        requirements: Requirements,
    ) -> RequirementsChange {
        let kind = requirements.kind();
        let clearing = requirements.is_empty();

        let mut entries = self.entries.lock().unwrap();
        let changed = if clearing && !entries.contains_key(&(source, region)) {
            false
        } else {
            entries
                .entry((source, region))
                .or_default()
                .replace(requirements)
        };
        if entries
            .get(&(source, region))
            .is_some_and(RegionRequirements::is_empty)
        {
            entries.remove(&(source, region));
        }
        drop(entries);

        if !changed {
            return RequirementsChange::Unchanged;
        }
        if clearing {
            let removed = self.aggregates.remove_kind(source, region, kind);
            tracing::debug!(%source, %region, %kind, removed, "cleared requirements");
            RequirementsChange::Cleared
        } else {
            let invalidated = self.aggregates.invalidate(source, region, kind);
            tracing::debug!(%source, %region, %kind, invalidated, "replaced requirements");
            RequirementsChange::Replaced
        }
    }

    pub fn set_histogram_requirements(
        &self,
        source: SourceId,
        region: RegionId,
        configs: Vec<HistogramConfig>,
    ) -> RequirementsChange {
        self.set(source, region, Requirements::Histogram(configs))
    }

    pub fn set_spectral_requirements(
        &self,
        source: SourceId,
        region: RegionId,
        configs: Vec<SpectralConfig>,
    ) -> RequirementsChange {
        self.set(source, region, Requirements::Spectral(configs))
    }

    pub fn set_stats_requirements(
        &self,
        source: SourceId,
        region: RegionId,
        configs: Vec<StatsConfig>,
    ) -> RequirementsChange {
        self.set(source, region, Requirements::Stats(configs))
    }

    pub fn get(&self, source: SourceId, region: RegionId) -> Option<RegionRequirements> {
        self.entries.lock().unwrap().get(&(source, region)).cloned()
    }

    /// The regions of `source` that have any requirement.
    pub fn regions(&self, source: SourceId) -> Vec<RegionId> {
        let mut regions: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|(s, _)| *s == source)
            .map(|(_, r)| *r)
            .collect();
        regions.sort();
        regions
    }

    pub fn remove_region(&self, region: RegionId) {
        self.entries.lock().unwrap().retain(|(_, r), _| *r != region);
    }

    pub fn remove_source(&self, source: SourceId) {
        self.entries.lock().unwrap().retain(|(s, _), _| *s != source);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
