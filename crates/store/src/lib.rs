//! Opsprint store: groups fingerprinted operations across polls.
//!
//! Memory is bounded: once `cap` groups exist, the oldest group (by first
//! appearance) is evicted to make room. Nothing is persisted.
//!
//! `currentOp` reports a long-running operation on every poll until it
//! finishes. Operations carrying an `opid` already seen in the previous poll
//! are not counted again; they only refresh duration and sample.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use bson::{Bson, Document};
use metrics::{counter, gauge};
use opsprint_core::FingerprintedRecord;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::debug;

/// Distinct application names kept per group.
const MAX_APP_NAMES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupKey {
    pub collection: String,
    pub fingerprint: String,
}

impl GroupKey {
    pub fn of(rec: &FingerprintedRecord) -> Self {
        Self { collection: rec.collection.clone(), fingerprint: rec.fingerprint.clone() }
    }
}

/// Aggregate for one `(collection, fingerprint)` pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintGroup {
    #[serde(flatten)]
    pub key: GroupKey,
    pub count: u64,
    pub collection_scans: u64,
    pub indexed: u64,
    pub waiting_for_lock: u64,
    pub max_duration_millis: Option<i64>,
    pub first_seen_poll: u64,
    pub last_seen_poll: u64,
    pub app_names: Vec<String>,
    /// Most recent raw operation of this shape.
    pub sample: Document,
}

impl FingerprintGroup {
    fn new(key: GroupKey, poll: u64, rec: &FingerprintedRecord) -> Self {
        Self {
            key,
            count: 0,
            collection_scans: 0,
            indexed: 0,
            waiting_for_lock: 0,
            max_duration_millis: None,
            first_seen_poll: poll,
            last_seen_poll: poll,
            app_names: Vec::new(),
            sample: rec.operation.clone(),
        }
    }

    fn add(&mut self, poll: u64, rec: &FingerprintedRecord) {
        self.count += 1;
        self.collection_scans += u64::from(rec.is_collection_scan);
        self.indexed += u64::from(rec.is_indexed);
        self.waiting_for_lock += u64::from(rec.waiting_for_lock == Some(true));
        self.refresh(poll, rec);
        if let Some(app) = rec.app_name.as_deref() {
            if self.app_names.len() < MAX_APP_NAMES && !self.app_names.iter().any(|a| a == app) {
                self.app_names.push(app.to_string());
            }
        }
    }

    /// Update what a repeated sighting of a running operation can change.
    fn refresh(&mut self, poll: u64, rec: &FingerprintedRecord) {
        self.max_duration_millis = match (self.max_duration_millis, rec.duration_millis) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.last_seen_poll = poll;
        self.sample = rec.operation.clone();
    }
}

/// Identity of a running operation; profiler rows carry none.
/// Sharded clusters report string opids (`shard01:1234`).
fn opid_key(rec: &FingerprintedRecord) -> Option<String> {
    match rec.operation.get("opid")? {
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::String(s) => Some(s.clone()),
        _ => None,
    }
}

pub struct FingerprintTally {
    map: FxHashMap<GroupKey, FingerprintGroup>,
    order: VecDeque<GroupKey>,
    cap: usize,
    evicted: u64,
    polls: u64,
    /// Opids returned by the previous poll.
    running: FxHashSet<String>,
}

impl FingerprintTally {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::new(),
            cap: cap.max(1),
            evicted: 0,
            polls: 0,
            running: FxHashSet::default(),
        }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn evicted(&self) -> u64 { self.evicted }
    pub fn polls(&self) -> u64 { self.polls }

    pub fn get(&self, key: &GroupKey) -> Option<&FingerprintGroup> { self.map.get(key) }

    /// Fold one poll's batch in. Returns how many groups were seen for the first time.
    pub fn record_poll(&mut self, batch: &[FingerprintedRecord]) -> usize {
        self.polls += 1;
        let poll = self.polls;
        let mut fresh = 0;
        let mut running = FxHashSet::default();
        for rec in batch {
            let key = GroupKey::of(rec);
            let opid = opid_key(rec);
            let repeat = opid.as_ref().map_or(false, |id| self.running.contains(id));
            if let Some(id) = opid {
                running.insert(id);
            }
            if repeat {
                if let Some(group) = self.map.get_mut(&key) {
                    group.refresh(poll, rec);
                    continue;
                }
            }
            if !self.map.contains_key(&key) {
                if self.order.len() >= self.cap {
                    if let Some(old) = self.order.pop_front() {
                        self.map.remove(&old);
                        self.evicted += 1;
                        counter!("tally_evicted_total", 1u64);
                    }
                }
                self.order.push_back(key.clone());
                self.map.insert(key.clone(), FingerprintGroup::new(key.clone(), poll, rec));
                fresh += 1;
            }
            if let Some(group) = self.map.get_mut(&key) {
                group.add(poll, rec);
            }
        }
        self.running = running;
        gauge!("tally_groups", self.map.len() as f64);
        debug!(poll, batch = batch.len(), fresh, groups = self.map.len(), "tally updated");
        fresh
    }

    /// Groups by count (desc), ties broken by key.
    pub fn top(&self, n: usize) -> Vec<&FingerprintGroup> {
        let mut groups: Vec<&FingerprintGroup> = self.map.values().collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        groups.truncate(n);
        groups
    }
}
