//! Port traits (hexagonal architecture).
//!
//! Schedulers never reach the persistence layer directly; they are handed a
//! [`BuildRequestStore`] at construction and do every mutation through a
//! [`StoreTransaction`].

use crate::Result;
use crate::change::{Change, ClassifiedChanges, NewChange, SourceStamp};
use crate::ids::{BuildRequestId, ChangeId, SchedulerId, SourceStampId};
use crate::request::NewBuildRequest;
use async_trait::async_trait;

/// Predicate deciding whether a change should trigger builds.
pub type ImportanceFn = dyn Fn(&Change) -> bool + Send + Sync;

/// Shared, transactional store of changes, scheduler ledgers, source stamps,
/// and build requests. Safe to share across every scheduler instance.
#[async_trait]
pub trait BuildRequestStore: Send + Sync {
    /// Record a change from a change source and assign its number.
    async fn add_change(&self, change: NewChange) -> Result<Change>;

    /// Changes numbered above the scheduler's watermark, oldest first.
    async fn unseen_changes(&self, scheduler: &SchedulerId) -> Result<Vec<Change>>;

    /// Persist a classification and advance the watermark to `seen_up_to`.
    /// Changes at or below the previous watermark are ignored.
    async fn record_classification(
        &self,
        scheduler: &SchedulerId,
        classified: &ClassifiedChanges,
        seen_up_to: ChangeId,
    ) -> Result<()>;

    /// Classify `changes` with `is_important` and persist the result.
    async fn classify_changes(
        &self,
        scheduler: &SchedulerId,
        changes: &[Change],
        is_important: &ImportanceFn,
    ) -> Result<ClassifiedChanges> {
        let Some(seen_up_to) = changes.iter().map(|c| c.id).max() else {
            return Ok(ClassifiedChanges::default());
        };
        let classified = ClassifiedChanges::partition(changes.iter().cloned(), is_important);
        self.record_classification(scheduler, &classified, seen_up_to)
            .await?;
        Ok(classified)
    }

    /// Unretired changes classified for a scheduler.
    async fn get_classified_changes(&self, scheduler: &SchedulerId) -> Result<ClassifiedChanges>;

    /// Number of pending build requests for a builder.
    async fn count_pending_requests(&self, builder_name: &str) -> Result<usize>;

    /// Start a transaction. Dropping it without [`StoreTransaction::commit`]
    /// discards everything done through it.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Writes applied atomically on commit.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Resolve a stamp to its stored id, creating it if needed. Equal change
    /// sets resolve to the same id, including across concurrent transactions.
    async fn get_or_create_source_stamp(&mut self, stamp: &SourceStamp) -> Result<SourceStampId>;

    /// Submit a request; returns one id per builder named.
    async fn create_build_request(
        &mut self,
        request: &NewBuildRequest,
    ) -> Result<Vec<BuildRequestId>>;

    /// Mark changes as consumed by a scheduler.
    async fn retire_changes(&mut self, scheduler: &SchedulerId, changes: &[ChangeId])
    -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
