//! Classification of raw operation documents (`currentOp` entries and
//! `system.profile` rows) into fingerprinted records.

use bson::{Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::fingerprint::fingerprint;

/// Collection name used when an operation has no target namespace.
pub const NO_COLLECTION: &str = "(none)";

pub const PLAN_INDEX_SCAN: &str = "IXSCAN";
pub const PLAN_ID_LOOKUP: &str = "IDHACK";
pub const PLAN_COLLECTION_SCAN: &str = "COLLSCAN";

/// Where the query shape of an operation may live, probed in order.
/// `&["command", "q"]` is the filter part of an update statement.
const SHAPE_PATHS: [&[&str]; 5] = [
    &["query"],
    &["command", "q"],
    &["command", "filter"],
    &["command", "query"],
    &["command", "pipeline"],
];

/// An operation enriched with its query-shape fingerprint and plan class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintedRecord {
    /// Raw operation as returned by the server.
    pub operation: Document,
    pub fingerprint: String,
    pub collection: String,
    pub is_indexed: bool,
    pub is_collection_scan: bool,
    pub waiting_for_lock: Option<bool>,
    pub app_name: Option<String>,
    pub operation_type: Option<String>,
    /// Elapsed time normalized to milliseconds, when the source reports one.
    pub duration_millis: Option<i64>,
    /// Profiler timestamp (historical log only).
    pub timestamp: Option<DateTime>,
}

impl FingerprintedRecord {
    pub fn from_operation(operation: Document) -> Self {
        let shape = query_shape(&operation);
        let fingerprint = fingerprint(&shape);
        let plan = plan_summary(&operation);
        Self {
            fingerprint,
            collection: collection_name(operation.get_str("ns").ok()).to_string(),
            is_indexed: is_indexed(plan),
            is_collection_scan: is_collection_scan(plan),
            waiting_for_lock: operation.get_bool("waitingForLock").ok(),
            app_name: operation.get_str("appName").ok().map(str::to_string),
            operation_type: operation.get_str("op").ok().map(str::to_string),
            duration_millis: duration_millis(&operation),
            timestamp: timestamp(&operation),
            operation,
        }
    }
}

/// Strip the database prefix from a namespace. Database names cannot contain
/// `.`, so everything after the first dot is the collection
/// (`app.system.profile` -> `system.profile`). A namespace without a dot is
/// kept as is; only a missing namespace maps to [`NO_COLLECTION`].
pub fn collection_name(ns: Option<&str>) -> &str {
    match ns {
        Some(ns) => ns.split_once('.').map_or(ns, |(_db, coll)| coll),
        None => NO_COLLECTION,
    }
}

pub fn plan_summary(op: &Document) -> Option<&str> {
    op.get_str("planSummary").ok()
}

pub fn is_indexed(plan: Option<&str>) -> bool {
    plan.map(|p| p.contains(PLAN_INDEX_SCAN) || p.contains(PLAN_ID_LOOKUP)).unwrap_or(false)
}

pub fn is_collection_scan(plan: Option<&str>) -> bool {
    plan.map(|p| p.contains(PLAN_COLLECTION_SCAN)).unwrap_or(false)
}

/// First present query-shape field, or an empty document.
pub fn query_shape(op: &Document) -> Bson {
    SHAPE_PATHS
        .iter()
        .find_map(|path| lookup(op, path))
        .cloned()
        .unwrap_or_else(|| Bson::Document(Document::new()))
}

fn lookup<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Bson> {
    let (last, parents) = path.split_last()?;
    let mut cur = doc;
    for key in parents {
        cur = cur.get_document(key).ok()?;
    }
    cur.get(last)
}

/// Elapsed time in milliseconds from `millis` (profiler), `microsecs_running`
/// or `secs_running` (currentOp), whichever comes first.
pub fn duration_millis(op: &Document) -> Option<i64> {
    if let Some(ms) = op.get("millis").and_then(as_i64) {
        return Some(ms);
    }
    if let Some(us) = op.get("microsecs_running").and_then(as_i64) {
        return Some(us / 1_000);
    }
    op.get("secs_running").and_then(as_i64).map(|s| s.saturating_mul(1_000))
}

pub fn timestamp(op: &Document) -> Option<DateTime> {
    op.get_datetime("ts").ok().copied()
}

fn as_i64(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.is_finite() => Some(*f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn collection_strips_database() {
        assert_eq!(collection_name(Some("app.users")), "users");
        assert_eq!(collection_name(Some("app.system.profile")), "system.profile");
        assert_eq!(collection_name(Some("admin.$cmd")), "$cmd");
        assert_eq!(collection_name(None), NO_COLLECTION);
    }

    #[test]
    fn present_namespace_never_maps_to_sentinel() {
        assert_eq!(collection_name(Some("admin")), "admin");
        assert_eq!(collection_name(Some("admin.")), "");
        assert_eq!(collection_name(Some("")), "");
        let rec = FingerprintedRecord::from_operation(doc! { "ns": "local", "secs_running": 6 });
        assert_eq!(rec.collection, "local");
    }

    #[test]
    fn plan_classes() {
        assert!(is_indexed(Some("IXSCAN { email: 1 }")));
        assert!(is_indexed(Some("IDHACK")));
        assert!(!is_indexed(Some("COLLSCAN")));
        assert!(is_collection_scan(Some("COLLSCAN")));
        assert!(!is_collection_scan(Some("IXSCAN { a: 1 }")));
        assert!(!is_indexed(None));
        assert!(!is_collection_scan(None));
    }

    #[test]
    fn shape_probe_order() {
        let op = doc! { "command": { "pipeline": [ { "$match": { "a": 1 } } ], "filter": { "b": 1 } } };
        assert_eq!(query_shape(&op), Bson::Document(doc! { "b": 1 }));

        let op = doc! { "query": { "x": 1 }, "command": { "filter": { "b": 1 } } };
        assert_eq!(query_shape(&op), Bson::Document(doc! { "x": 1 }));

        let op = doc! { "command": { "q": { "u": 1 }, "u": { "$set": { "v": 2 } } } };
        assert_eq!(query_shape(&op), Bson::Document(doc! { "u": 1 }));

        let op = doc! { "command": { "aggregate": "c", "pipeline": [] } };
        assert_eq!(query_shape(&op), Bson::Array(vec![]));

        assert_eq!(query_shape(&doc! { "op": "insert" }), Bson::Document(Document::new()));
    }

    #[test]
    fn record_without_plan_or_shape() {
        let rec = FingerprintedRecord::from_operation(doc! { "op": "command", "secs_running": 7 });
        assert_eq!(rec.fingerprint, "{  }");
        assert_eq!(rec.collection, NO_COLLECTION);
        assert!(!rec.is_indexed);
        assert!(!rec.is_collection_scan);
        assert_eq!(rec.waiting_for_lock, None);
        assert_eq!(rec.app_name, None);
        assert_eq!(rec.duration_millis, Some(7_000));
    }

    #[test]
    fn record_from_profile_entry() {
        let ts = DateTime::from_millis(1_700_000_000_000);
        let rec = FingerprintedRecord::from_operation(doc! {
            "op": "query",
            "ns": "shop.orders",
            "command": { "find": "orders", "filter": { "customer": "c-1", "status": { "$in": ["a", "b"] } } },
            "planSummary": "COLLSCAN",
            "millis": 812,
            "appName": "checkout",
            "waitingForLock": false,
            "ts": ts,
        });
        assert_eq!(rec.fingerprint, "{ customer, status: { $in: [  ] } }");
        assert_eq!(rec.collection, "orders");
        assert!(rec.is_collection_scan);
        assert!(!rec.is_indexed);
        assert_eq!(rec.app_name.as_deref(), Some("checkout"));
        assert_eq!(rec.waiting_for_lock, Some(false));
        assert_eq!(rec.operation_type.as_deref(), Some("query"));
        assert_eq!(rec.duration_millis, Some(812));
        assert_eq!(rec.timestamp, Some(ts));
    }

    #[test]
    fn micros_take_precedence_over_secs() {
        let op = doc! { "secs_running": 2, "microsecs_running": 2_750_000_i64 };
        assert_eq!(duration_millis(&op), Some(2_750));
    }
}
