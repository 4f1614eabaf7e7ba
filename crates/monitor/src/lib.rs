//! Opsprint monitor: finds slow operations and fingerprints them.
//!
//! Each call to [`SlowOperationMonitor::retrieve_slow_operations`] makes one
//! round-trip to the source (two on the first profiler poll, which opens the
//! collection handle) and returns the classified batch. Polling cadence,
//! retries and timeouts belong to the caller.
//!
//! Retrieval takes `&mut self`: one poll in flight per monitor. The profiler
//! watermark is read before the query and written after it, so sharing a
//! monitor across tasks needs an external mutex.

#![forbid(unsafe_code)]

use std::time::Instant;

use bson::{doc, DateTime, Document};
use metrics::{counter, histogram};
use opsprint_core::record::{self, FingerprintedRecord, PLAN_COLLECTION_SCAN};
use opsprint_mongohub::{CurrentOpRequest, OpsSource, ProfileLog, SourceError};
use tracing::{debug, info, warn};

mod config;

pub use config::{MonitorConfig, DEFAULT_QUERY_THRESHOLD_SECS};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Monitor could not be built; not recoverable.
    #[error("configuration: {0}")]
    Configuration(String),
    /// Source call failed; this poll produced nothing.
    #[error("retrieval: {0}")]
    Retrieval(#[from] SourceError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// Which source a monitor polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Historical,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Historical => "historical",
        }
    }
}

enum Strategy<P> {
    Live,
    Historical {
        /// Opened on first poll.
        profile: Option<P>,
        /// Max `ts` returned so far.
        watermark: Option<DateTime>,
    },
}

pub struct SlowOperationMonitor<S: OpsSource> {
    source: S,
    config: MonitorConfig,
    strategy: Strategy<S::Profile>,
}

pub struct MonitorBuilder<S> {
    config: MonitorConfig,
    source: Option<S>,
}

impl<S: OpsSource> MonitorBuilder<S> {
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, source: S) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> MonitorResult<SlowOperationMonitor<S>> {
        let source = self
            .source
            .ok_or_else(|| MonitorError::Configuration("an operations source is required".to_string()))?;
        let config = self.config;
        if config.report_all_collection_scans && !config.use_historical_log {
            warn!("reportAllCollectionScans has no effect without useHistoricalLog");
        }
        let strategy = if config.use_historical_log {
            Strategy::Historical { profile: None, watermark: None }
        } else {
            Strategy::Live
        };
        info!(
            mode = if config.use_historical_log { "historical" } else { "live" },
            threshold_secs = config.query_threshold_secs,
            all_collscans = config.report_all_collection_scans,
            "slow operation monitor ready"
        );
        Ok(SlowOperationMonitor { source, config, strategy })
    }
}

impl<S: OpsSource> SlowOperationMonitor<S> {
    pub fn builder() -> MonitorBuilder<S> {
        MonitorBuilder { config: MonitorConfig::default(), source: None }
    }

    pub fn new(source: S, config: MonitorConfig) -> MonitorResult<Self> {
        Self::builder().config(config).source(source).build()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        match self.strategy {
            Strategy::Live => Mode::Live,
            Strategy::Historical { .. } => Mode::Historical,
        }
    }

    /// Profiler watermark; always `None` in live mode.
    pub fn watermark(&self) -> Option<DateTime> {
        match &self.strategy {
            Strategy::Live => None,
            Strategy::Historical { watermark, .. } => *watermark,
        }
    }

    /// Fetch one batch of slow operations and fingerprint them.
    ///
    /// An empty batch is not an error. On failure nothing is returned and the
    /// watermark is left as it was.
    pub async fn retrieve_slow_operations(&mut self) -> MonitorResult<Vec<FingerprintedRecord>> {
        let started = Instant::now();
        let mode = self.mode();
        let raw = match &mut self.strategy {
            Strategy::Live => poll_live(&self.source, &self.config).await?,
            Strategy::Historical { profile, watermark } => {
                poll_historical(&self.source, &self.config, profile, watermark).await?
            }
        };
        let records: Vec<FingerprintedRecord> = raw.into_iter().map(FingerprintedRecord::from_operation).collect();
        histogram!("monitor_poll_ms", started.elapsed().as_secs_f64() * 1000.0, "mode" => mode.as_str());
        counter!("monitor_records_total", records.len() as u64, "mode" => mode.as_str());
        debug!(mode = mode.as_str(), count = records.len(), "slow operations retrieved");
        Ok(records)
    }
}

async fn poll_live<S: OpsSource>(source: &S, config: &MonitorConfig) -> Result<Vec<Document>, SourceError> {
    let req = CurrentOpRequest { min_secs_running: config.query_threshold_secs };
    let mut ops = source.current_op(req).await?;
    let threshold_ms = config.threshold_millis();
    ops.retain(|op| record::duration_millis(op).map_or(true, |ms| ms >= threshold_ms));
    Ok(ops)
}

async fn poll_historical<S: OpsSource>(
    source: &S,
    config: &MonitorConfig,
    profile: &mut Option<S::Profile>,
    watermark: &mut Option<DateTime>,
) -> Result<Vec<Document>, SourceError> {
    let log = match profile.take() {
        Some(log) => log,
        None => source.open_profile().await?,
    };
    let filter = historical_filter(config, log.namespace(), *watermark);
    let found = log.find(filter).await;
    *profile = Some(log);
    let mut rows = found?;

    if let Some(wm) = *watermark {
        rows.retain(|r| record::timestamp(r).map_or(true, |ts| ts > wm));
    }
    if let Some(max) = rows.iter().filter_map(record::timestamp).max() {
        if watermark.map_or(true, |wm| max > wm) {
            debug!(watermark = %max, "profiler watermark advanced");
            *watermark = Some(max);
        }
    }
    Ok(rows)
}

/// Profiler filter: slow entries (or any collection scan when configured),
/// excluding the profiler's own namespace, newer than `watermark`.
pub fn historical_filter(config: &MonitorConfig, profile_ns: &str, watermark: Option<DateTime>) -> Document {
    let slow = doc! { "millis": { "$gte": config.threshold_millis() } };
    let mut filter = if config.report_all_collection_scans {
        doc! { "$or": [ slow, { "planSummary": { "$regex": PLAN_COLLECTION_SCAN } } ] }
    } else {
        slow
    };
    filter.insert("ns", doc! { "$ne": profile_ns });
    if let Some(wm) = watermark {
        filter.insert("ts", doc! { "$gt": wm });
    }
    filter
}
