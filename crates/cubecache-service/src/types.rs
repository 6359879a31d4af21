//! Identifiers and keys shared by every cache in the engine.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque identifier of a data source: a path plus an optional sub-unit (e.g. an HDU).
///
/// A [`SourceKey`] maps 1:1 onto a cached handle in the
/// [`SourceHandleCache`](crate::caching::SourceHandleCache).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(Arc<str>);

impl SourceKey {
    /// Creates a key for the given path and optional sub-unit.
    pub fn new(path: &str, sub_unit: Option<&str>) -> Self {
        match sub_unit {
            Some(unit) if !unit.is_empty() => Self(format!("{path}:{unit}").into()),
            _ => Self(path.into()),
        }
    }

    /// Returns the path portion of the key, without the sub-unit.
    pub fn path(&self) -> &str {
        self.split().0
    }

    /// Returns the sub-unit portion of the key, if any.
    pub fn sub_unit(&self) -> Option<&str> {
        self.split().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (&str, Option<&str>) {
        match self.0.rsplit_once(':') {
            // Do not treat Windows drive letters as sub-units.
            Some((path, unit)) if path.len() > 1 && !unit.contains(['/', '\\']) => {
                (path, Some(unit))
            }
            _ => (&self.0, None),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKey {
    fn from(path: &str) -> Self {
        Self(path.into())
    }
}

/// The session-local identifier of an opened source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub i32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// The identifier of a region drawn by the client, or one of the reserved sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub i32);

impl RegionId {
    /// Aggregates over the whole current channel plane.
    pub const IMAGE: RegionId = RegionId(-1);
    /// Aggregates over every channel of the whole image.
    pub const CUBE: RegionId = RegionId(-2);
    /// The cursor "region", a single pixel.
    pub const CURSOR: RegionId = RegionId(0);

    /// Whether this id is one of the whole-image sentinels that are not tied to a drawn shape.
    pub fn is_whole_image(self) -> bool {
        self == Self::IMAGE || self == Self::CUBE
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IMAGE => f.write_str("region#image"),
            Self::CUBE => f.write_str("region#cube"),
            Self(id) => write!(f, "region#{id}"),
        }
    }
}

/// The kind of reduction an aggregate holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Histogram,
    Stats,
    SpectralSeries,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [Self::Histogram, Self::Stats, Self::SpectralSeries];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Histogram => "histogram",
            Self::Stats => "stats",
            Self::SpectralSeries => "spectral",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either a single channel or the whole spectral axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrAll {
    Channel(u32),
    All,
}

impl fmt::Display for ChannelOrAll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(channel) => write!(f, "{channel}"),
            Self::All => f.write_str("all"),
        }
    }
}

/// The memoization key of an [`Aggregate`](crate::caching::Aggregate).
///
/// At most one computation job is live per key at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub source: SourceId,
    pub region: RegionId,
    pub kind: DataKind,
    pub polarization: u32,
    pub channel: ChannelOrAll,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/pol={}/chan={}",
            self.source, self.region, self.kind, self.polarization, self.channel
        )
    }
}
