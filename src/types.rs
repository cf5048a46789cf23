//! Shared data types for counters, events, and cycle reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key under which a feature's variant array lives in a datafile. Spec §9
/// flags that the platform's schema has at least two versions of this key;
/// parameterizing it here means a future schema only changes this constant.
pub const VARIATIONS_KEY: &str = "variations";

/// A fully-qualified variant identity: one datafile, one feature, one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantKey {
    pub datafile: String,
    pub feature: String,
    pub variant: String,
}

impl VariantKey {
    pub fn new(datafile: impl Into<String>, feature: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            datafile: datafile.into(),
            feature: feature.into(),
            variant: variant.into(),
        }
    }

    /// The `stats:{datafile}:{feature}:{variant}` key this record lives
    /// under in the counter store (spec §6).
    pub fn store_key(&self) -> String {
        format!("stats:{}:{}:{}", self.datafile, self.feature, self.variant)
    }

    /// Parse a store key back into its parts. Datafile paths may contain
    /// `/`, so only the final two `:`-separated segments are taken as
    /// feature and variant.
    pub fn parse_store_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("stats:")?;
        let mut parts = rest.rsplitn(3, ':');
        let variant = parts.next()?.to_string();
        let feature = parts.next()?.to_string();
        let datafile = parts.next()?.to_string();
        Some(Self { datafile, feature, variant })
    }
}

/// Snapshot of one variant's counters as read from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CounterSnapshot {
    pub exposures: u64,
    pub conversions: u64,
    pub weight: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for CounterSnapshot {
    fn default() -> Self {
        Self {
            exposures: 0,
            conversions: 0,
            weight: None,
            last_updated: None,
        }
    }
}

impl CounterSnapshot {
    /// `conversions / exposures`, with the `0/0 = 0` sentinel from spec §4.7.
    pub fn conversion_rate(&self) -> f64 {
        if self.exposures == 0 {
            0.0
        } else {
            self.conversions as f64 / self.exposures as f64
        }
    }
}

/// Incoming `expose`/`convert` event body: `{ "datafile": ..., "features": { feature: variant } }`
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub datafile: String,
    pub features: std::collections::HashMap<String, String>,
}

/// Per-variant row in the `/stats` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsEntry {
    pub exposures: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub weight: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<CounterSnapshot> for StatsEntry {
    fn from(c: CounterSnapshot) -> Self {
        Self {
            exposures: c.exposures,
            conversions: c.conversions,
            conversion_rate: c.conversion_rate(),
            weight: c.weight,
            last_updated: c.last_updated,
        }
    }
}

/// Why a group was skipped during a recalculation cycle.
#[derive(Debug, Clone, Serialize)]
pub enum SkipReason {
    InsufficientExposures,
    ZeroOriginalWeight,
    NotInAnyDatafile,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::InsufficientExposures => "insufficient exposures",
            SkipReason::ZeroOriginalWeight => "zero total original weight",
            SkipReason::NotInAnyDatafile => "group not present in any datafile",
        };
        write!(f, "{s}")
    }
}

/// Identity of one experiment group: a (datafile, feature) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupKey {
    pub datafile: String,
    pub feature: String,
}

/// Summary of one recalculation cycle, returned by the scheduler and the
/// manual `/recalculate` endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub groups_considered: usize,
    pub groups_updated: Vec<GroupUpdate>,
    pub groups_skipped: Vec<GroupSkip>,
    pub groups_errored: Vec<GroupError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupUpdate {
    pub group: GroupKey,
    pub weights: std::collections::BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSkip {
    pub group: GroupKey,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupError {
    pub group: GroupKey,
    pub error: String,
}
