//! In-memory source for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::Document;

use crate::{CurrentOpRequest, OpsSource, ProfileLog, SourceError};

#[derive(Default)]
struct MockState {
    live: Vec<Document>,
    profile: Vec<Document>,
    fail_next: Option<String>,
    requests: Vec<CurrentOpRequest>,
    filters: Vec<Document>,
    opens: usize,
}

/// Scripted source. Returns whatever was pushed, ignoring server-side
/// filters, and records every request it receives.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_live(&self, op: Document) {
        self.state.lock().unwrap().live.push(op);
    }

    pub fn clear_live(&self) {
        self.state.lock().unwrap().live.clear();
    }

    pub fn push_profile(&self, entry: Document) {
        self.state.lock().unwrap().profile.push(entry);
    }

    /// Make the next call (of any kind) fail.
    pub fn fail_next(&self, msg: &str) {
        self.state.lock().unwrap().fail_next = Some(msg.to_string());
    }

    pub fn requests(&self) -> Vec<CurrentOpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Filters seen by the profile log, in call order.
    pub fn filters(&self) -> Vec<Document> {
        self.state.lock().unwrap().filters.clone()
    }

    pub fn profile_opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    fn take_failure(&self) -> Result<(), SourceError> {
        match self.state.lock().unwrap().fail_next.take() {
            Some(msg) => Err(SourceError::Malformed(msg)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OpsSource for MockSource {
    type Profile = MockProfile;

    async fn current_op(&self, req: CurrentOpRequest) -> Result<Vec<Document>, SourceError> {
        self.take_failure()?;
        let mut st = self.state.lock().unwrap();
        st.requests.push(req);
        Ok(st.live.clone())
    }

    async fn open_profile(&self) -> Result<MockProfile, SourceError> {
        self.take_failure()?;
        self.state.lock().unwrap().opens += 1;
        Ok(MockProfile { source: self.clone(), ns: "test.system.profile".to_string() })
    }
}

pub struct MockProfile {
    source: MockSource,
    ns: String,
}

#[async_trait]
impl ProfileLog for MockProfile {
    fn namespace(&self) -> &str {
        &self.ns
    }

    async fn find(&self, filter: Document) -> Result<Vec<Document>, SourceError> {
        self.source.take_failure()?;
        let mut st = self.source.state.lock().unwrap();
        st.filters.push(filter);
        Ok(st.profile.clone())
    }
}
