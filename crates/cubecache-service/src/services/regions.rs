use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cancellation::CancellationController;
use crate::region::RegionMask;
use crate::types::{RegionId, SourceId};

/// A region definition together with the generation it was captured at.
#[derive(Clone, Debug)]
pub struct RegionSnapshot {
    pub source: SourceId,
    pub mask: Arc<RegionMask>,
    pub generation: u64,
}

#[derive(Debug)]
struct RegionEntry {
    source: SourceId,
    mask: Arc<RegionMask>,
}

/// The regions the client has drawn.
///
/// Every change of a region's definition advances its generation while the registry lock is
/// held, so a snapshot always pairs a mask with the generation it belongs to.
#[derive(Debug)]
pub struct RegionRegistry {
    regions: Mutex<HashMap<RegionId, RegionEntry>>,
    cancellation: Arc<CancellationController>,
}

impl RegionRegistry {
    pub fn new(cancellation: Arc<CancellationController>) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            cancellation,
        }
    }

    /// Defines or redefines a region, returning whether its definition changed.
    pub fn set(&self, region: RegionId, source: SourceId, mask: RegionMask) -> bool {
        let mut regions = self.regions.lock().unwrap();
        if let Some(entry) = regions.get(&region) {
            if entry.source == source && *entry.mask == mask {
                return false;
            }
        }
        regions.insert(
            region,
            RegionEntry {
                source,
                mask: Arc::new(mask),
            },
        );
        self.cancellation.bump(region);
        true
    }

    /// Removes a region, returning the source it belonged to.
    pub fn remove(&self, region: RegionId) -> Option<SourceId> {
        let mut regions = self.regions.lock().unwrap();
        let entry = regions.remove(&region)?;
        self.cancellation.bump(region);
        Some(entry.source)
    }

    /// Removes every region of a source.
    pub fn remove_source(&self, source: SourceId) -> Vec<RegionId> {
        let mut regions = self.regions.lock().unwrap();
        let removed: Vec<_> = regions
            .iter()
            .filter(|(_, entry)| entry.source == source)
            .map(|(region, _)| *region)
            .collect();
        for region in &removed {
            regions.remove(region);
            self.cancellation.bump(*region);
        }
        removed
    }

    pub fn snapshot(&self, region: RegionId) -> Option<RegionSnapshot> {
        let regions = self.regions.lock().unwrap();
        let entry = regions.get(&region)?;
        Some(RegionSnapshot {
            source: entry.source,
            mask: Arc::clone(&entry.mask),
            generation: self.cancellation.generation(region),
        })
    }

    pub fn len(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
