//! Opsprint mongohub: access to the server's view of running and past operations.
//!
//! Two sources: the admin `currentOp` command (live) and the database
//! profiler's `system.profile` collection (historical). Both are exposed
//! behind [`OpsSource`] so the monitor can be driven by [`MockSource`] in tests.

#![forbid(unsafe_code)]

use std::time::Instant;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use metrics::histogram;
use mongodb::{options::FindOptions, Client, Collection, Database};
use tracing::{debug, info, warn};

mod mock;

pub use mock::{MockProfile, MockSource};

/// Name of the profiler collection inside every database.
pub const PROFILE_COLLECTION: &str = "system.profile";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("mongodb: {0}")]
    Driver(#[from] mongodb::error::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Parameters of a `currentOp` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentOpRequest {
    pub min_secs_running: u64,
}

impl CurrentOpRequest {
    /// Active operations running at least `min_secs_running`, idle entries (`op: "none"`) excluded.
    pub fn command(&self) -> Document {
        let secs = i64::try_from(self.min_secs_running).unwrap_or(i64::MAX);
        doc! {
            "currentOp": 1,
            "active": true,
            "secs_running": { "$gte": secs },
            "op": { "$ne": "none" },
        }
    }
}

/// Extract the `inprog` list from a `currentOp` reply. A missing list means no operations.
pub fn parse_inprog(mut reply: Document) -> Result<Vec<Document>, SourceError> {
    let items = match reply.remove("inprog") {
        None | Some(Bson::Null) => return Ok(Vec::new()),
        Some(Bson::Array(items)) => items,
        Some(other) => {
            return Err(SourceError::Malformed(format!("inprog is {:?}, expected array", other.element_type())))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d),
            other => Err(SourceError::Malformed(format!("inprog entry is {:?}, expected document", other.element_type()))),
        })
        .collect()
}

/// Server-side view of operations.
#[async_trait]
pub trait OpsSource: Send + Sync {
    type Profile: ProfileLog;

    /// Run `currentOp` and return the in-progress entries.
    async fn current_op(&self, req: CurrentOpRequest) -> Result<Vec<Document>, SourceError>;

    /// Open a handle on the profiler collection.
    async fn open_profile(&self) -> Result<Self::Profile, SourceError>;
}

/// Historical operations log.
#[async_trait]
pub trait ProfileLog: Send + Sync {
    /// Full namespace of the log itself, e.g. `app.system.profile`.
    fn namespace(&self) -> &str;

    /// Entries matching `filter`, oldest first.
    async fn find(&self, filter: Document) -> Result<Vec<Document>, SourceError>;
}

/// `mongodb`-driver backed source.
#[derive(Clone)]
pub struct MongoHub {
    client: Client,
    db: Database,
}

impl MongoHub {
    pub async fn connect(uri: &str, db: &str) -> Result<Self, SourceError> {
        let client = Client::with_uri_str(uri).await?;
        info!(db = %db, "mongodb client ready");
        Ok(Self::from_client(client, db))
    }

    pub fn from_client(client: Client, db: &str) -> Self {
        let db = client.database(db);
        Self { client, db }
    }

    pub fn database_name(&self) -> &str {
        self.db.name()
    }
}

#[async_trait]
impl OpsSource for MongoHub {
    type Profile = ProfileCollection;

    async fn current_op(&self, req: CurrentOpRequest) -> Result<Vec<Document>, SourceError> {
        let started = Instant::now();
        let reply = self.client.database("admin").run_command(req.command(), None).await?;
        let ops = parse_inprog(reply)?;
        histogram!("mongohub_current_op_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count = ops.len(), min_secs = req.min_secs_running, "currentOp returned");
        Ok(ops)
    }

    async fn open_profile(&self) -> Result<ProfileCollection, SourceError> {
        let names = self.db.list_collection_names(doc! { "name": PROFILE_COLLECTION }).await?;
        if names.is_empty() {
            warn!(db = %self.db.name(), "no system.profile collection; is profiling enabled?");
        }
        Ok(ProfileCollection {
            coll: self.db.collection::<Document>(PROFILE_COLLECTION),
            ns: format!("{}.{}", self.db.name(), PROFILE_COLLECTION),
        })
    }
}

/// Handle on `<db>.system.profile`.
#[derive(Clone)]
pub struct ProfileCollection {
    coll: Collection<Document>,
    ns: String,
}

#[async_trait]
impl ProfileLog for ProfileCollection {
    fn namespace(&self) -> &str {
        &self.ns
    }

    async fn find(&self, filter: Document) -> Result<Vec<Document>, SourceError> {
        let started = Instant::now();
        let opts = FindOptions::builder().sort(doc! { "ts": 1 }).build();
        let cursor = self.coll.find(filter, opts).await?;
        let rows: Vec<Document> = cursor.try_collect().await?;
        histogram!("mongohub_profile_find_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(ns = %self.ns, count = rows.len(), "profile query returned");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_op_command_shape() {
        let cmd = CurrentOpRequest { min_secs_running: 5 }.command();
        assert_eq!(cmd.keys().next().map(String::as_str), Some("currentOp"));
        assert_eq!(cmd.get_bool("active").ok(), Some(true));
        assert_eq!(cmd.get_document("secs_running").unwrap(), &doc! { "$gte": 5_i64 });
        assert_eq!(cmd.get_document("op").unwrap(), &doc! { "$ne": "none" });
    }

    #[test]
    fn inprog_missing_is_empty() {
        assert!(parse_inprog(doc! { "ok": 1.0 }).unwrap().is_empty());
        assert!(parse_inprog(doc! { "inprog": [], "ok": 1.0 }).unwrap().is_empty());
    }

    #[test]
    fn inprog_entries_are_returned_in_order() {
        let reply = doc! { "inprog": [ { "opid": 1 }, { "opid": 2 } ], "ok": 1.0 };
        let ops = parse_inprog(reply).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].get_i32("opid").unwrap(), 2);
    }

    #[test]
    fn inprog_wrong_type_is_malformed() {
        assert!(matches!(parse_inprog(doc! { "inprog": "nope" }), Err(SourceError::Malformed(_))));
        assert!(matches!(parse_inprog(doc! { "inprog": [1] }), Err(SourceError::Malformed(_))));
    }
}
