use serde::{Deserialize, Serialize};

pub const DEFAULT_QUERY_THRESHOLD_SECS: u64 = 5;

/// Monitor options. Field names follow the camelCase config keys
/// (`queryThresholdSeconds`, `useHistoricalLog`, `reportAllCollectionScans`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Minimum elapsed time for an operation to count as slow.
    #[serde(rename = "queryThresholdSeconds")]
    pub query_threshold_secs: u64,
    /// Poll `system.profile` instead of `currentOp`.
    pub use_historical_log: bool,
    /// Also report profiler entries that scanned a whole collection, however fast.
    /// Ignored without `use_historical_log`.
    pub report_all_collection_scans: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            query_threshold_secs: DEFAULT_QUERY_THRESHOLD_SECS,
            use_historical_log: false,
            report_all_collection_scans: false,
        }
    }
}

impl MonitorConfig {
    pub fn threshold_millis(&self) -> i64 {
        i64::try_from(self.query_threshold_secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }
}
