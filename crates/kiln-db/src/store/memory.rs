//! In-process implementation of BuildRequestStore.

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::change::{Change, ClassifiedChanges, NewChange, SourceStamp};
use kiln_core::ids::{BuildRequestId, ChangeId, SchedulerId, SourceStampId};
use kiln_core::ports::{BuildRequestStore, StoreTransaction};
use kiln_core::request::{BuildRequest, BuildRequestStatus, NewBuildRequest};
use kiln_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Ledger {
    watermark: Option<ChangeId>,
    important: BTreeSet<ChangeId>,
    unimportant: BTreeSet<ChangeId>,
}

impl Ledger {
    fn is_new(&self, id: ChangeId) -> bool {
        self.watermark.is_none_or(|w| id > w)
    }
}

#[derive(Debug, Default)]
struct State {
    last_change: i64,
    changes: BTreeMap<ChangeId, Change>,
    ledgers: HashMap<SchedulerId, Ledger>,
    stamp_ids: HashMap<String, SourceStampId>,
    stamps: HashMap<SourceStampId, SourceStamp>,
    requests: Vec<BuildRequest>,
}

/// Store holding all state behind one lock. Transactions stage writes and
/// apply them in a single critical section on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored build request, in submission order.
    pub async fn build_requests(&self) -> Vec<BuildRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Every stored source stamp.
    pub async fn source_stamps(&self) -> Vec<(SourceStampId, SourceStamp)> {
        self.state
            .lock()
            .await
            .stamps
            .iter()
            .map(|(id, stamp)| (*id, stamp.clone()))
            .collect()
    }

    pub async fn source_stamp(&self, id: SourceStampId) -> Option<SourceStamp> {
        self.state.lock().await.stamps.get(&id).cloned()
    }

    /// Move a request through its lifecycle, as build execution would.
    pub async fn set_request_status(
        &self,
        id: BuildRequestId,
        status: BuildRequestStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let request = state
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::Internal(format!("build request not found: {id}")))?;
        request.status = status;
        Ok(())
    }
}

#[async_trait]
impl BuildRequestStore for MemoryStore {
    async fn add_change(&self, change: NewChange) -> Result<Change> {
        let mut state = self.state.lock().await;
        state.last_change += 1;
        let change = change.into_change(ChangeId::new(state.last_change));
        state.changes.insert(change.id, change.clone());
        Ok(change)
    }

    async fn unseen_changes(&self, scheduler: &SchedulerId) -> Result<Vec<Change>> {
        let state = self.state.lock().await;
        let lower = match state.ledgers.get(scheduler).and_then(|l| l.watermark) {
            Some(watermark) => Bound::Excluded(watermark),
            None => Bound::Unbounded,
        };
        Ok(state
            .changes
            .range((lower, Bound::Unbounded))
            .map(|(_, change)| change.clone())
            .collect())
    }

    async fn record_classification(
        &self,
        scheduler: &SchedulerId,
        classified: &ClassifiedChanges,
        seen_up_to: ChangeId,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for change in classified.important.iter().chain(&classified.unimportant) {
            state
                .changes
                .entry(change.id)
                .or_insert_with(|| change.clone());
        }

        let ledger = state.ledgers.entry(scheduler.clone()).or_default();
        for change in &classified.important {
            if ledger.is_new(change.id) {
                ledger.unimportant.remove(&change.id);
                ledger.important.insert(change.id);
            }
        }
        for change in &classified.unimportant {
            if ledger.is_new(change.id) {
                ledger.important.remove(&change.id);
                ledger.unimportant.insert(change.id);
            }
        }
        ledger.watermark = Some(ledger.watermark.map_or(seen_up_to, |w| w.max(seen_up_to)));
        Ok(())
    }

    async fn get_classified_changes(&self, scheduler: &SchedulerId) -> Result<ClassifiedChanges> {
        let state = self.state.lock().await;
        let Some(ledger) = state.ledgers.get(scheduler) else {
            return Ok(ClassifiedChanges::default());
        };

        let lookup = |ids: &BTreeSet<ChangeId>| -> Result<Vec<Change>> {
            ids.iter()
                .map(|id| {
                    state
                        .changes
                        .get(id)
                        .cloned()
                        .ok_or_else(|| Error::ChangeNotFound(id.to_string()))
                })
                .collect()
        };

        Ok(ClassifiedChanges {
            important: lookup(&ledger.important)?,
            unimportant: lookup(&ledger.unimportant)?,
        })
    }

    async fn count_pending_requests(&self, builder_name: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.builder_name == builder_name && r.status == BuildRequestStatus::Pending)
            .count())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            stamps: Vec::new(),
            requests: Vec::new(),
            retirements: Vec::new(),
        }))
    }
}

/// Writes staged against a [`MemoryStore`]. Dropped uncommitted, it leaves
/// the store untouched.
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    stamps: Vec<(SourceStampId, SourceStamp)>,
    requests: Vec<BuildRequest>,
    retirements: Vec<(SchedulerId, Vec<ChangeId>)>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_or_create_source_stamp(&mut self, stamp: &SourceStamp) -> Result<SourceStampId> {
        let key = stamp.key();
        if let Some(id) = self.state.lock().await.stamp_ids.get(&key) {
            return Ok(*id);
        }
        if let Some((id, _)) = self.stamps.iter().find(|(_, s)| s.key() == key) {
            return Ok(*id);
        }

        let id = SourceStampId::new();
        self.stamps.push((id, stamp.clone()));
        Ok(id)
    }

    async fn create_build_request(
        &mut self,
        request: &NewBuildRequest,
    ) -> Result<Vec<BuildRequestId>> {
        if request.builder_names.is_empty() {
            return Err(Error::Internal("build request names no builders".into()));
        }
        let staged = self
            .stamps
            .iter()
            .any(|(id, _)| *id == request.source_stamp_id);
        if !staged
            && !self
                .state
                .lock()
                .await
                .stamps
                .contains_key(&request.source_stamp_id)
        {
            return Err(Error::SourceStampNotFound(
                request.source_stamp_id.to_string(),
            ));
        }

        let submitted_at = Utc::now();
        let mut ids = Vec::with_capacity(request.builder_names.len());
        for builder_name in &request.builder_names {
            let id = BuildRequestId::new();
            self.requests.push(BuildRequest {
                id,
                source_stamp_id: request.source_stamp_id,
                builder_name: builder_name.clone(),
                reason: request.reason.clone(),
                properties: request.properties.clone(),
                status: BuildRequestStatus::Pending,
                submitted_at,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn retire_changes(
        &mut self,
        scheduler: &SchedulerId,
        changes: &[ChangeId],
    ) -> Result<()> {
        self.retirements.push((scheduler.clone(), changes.to_vec()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.state.lock().await;

        // A concurrent transaction may have stored the same change set since
        // this one staged it; requests follow the id that won.
        let mut remap: HashMap<SourceStampId, SourceStampId> = HashMap::new();
        for (id, stamp) in this.stamps {
            let key = stamp.key();
            match state.stamp_ids.get(&key) {
                Some(existing) => {
                    remap.insert(id, *existing);
                }
                None => {
                    state.stamp_ids.insert(key, id);
                    state.stamps.insert(id, stamp);
                }
            }
        }

        let submitted = this.requests.len();
        for mut request in this.requests {
            if let Some(existing) = remap.get(&request.source_stamp_id) {
                request.source_stamp_id = *existing;
            }
            state.requests.push(request);
        }

        for (scheduler, ids) in this.retirements {
            if let Some(ledger) = state.ledgers.get_mut(&scheduler) {
                for id in &ids {
                    ledger.important.remove(id);
                    ledger.unimportant.remove(id);
                }
            }
        }

        debug!(submitted, remapped_stamps = remap.len(), "Committed memory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
