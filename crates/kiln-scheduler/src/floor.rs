//! Keeps a floor of pending build requests on a set of builders.
//!
//! The maintainer is a leveling loop, not a guarantee: between polls a
//! builder may drop below its floor, and the next pass tops it back up.

use crate::gate::{later, recheck_margin};
use crate::multiplier::{RequestTemplate, check_builder_names};
use crate::scheduler::{Scheduler, TickOutcome};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use kiln_core::change::{Properties, SourceStamp};
use kiln_core::ids::SchedulerId;
use kiln_core::ports::BuildRequestStore;
use kiln_core::request::NewBuildRequest;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default time between reconciliation passes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Produces the stamp used for a builder's top-up requests.
#[async_trait]
pub trait StampFactory: Send + Sync {
    async fn stamp_for(&self, builder_name: &str) -> Result<SourceStamp>;
}

/// The empty stamp, for builders that always build the tip.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineStamp;

#[async_trait]
impl StampFactory for BaselineStamp {
    async fn stamp_for(&self, _builder_name: &str) -> Result<SourceStamp> {
        Ok(SourceStamp::baseline())
    }
}

/// A stamp pinned to a branch and revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedStamp {
    pub branch: Option<String>,
    pub revision: Option<String>,
}

#[async_trait]
impl StampFactory for FixedStamp {
    async fn stamp_for(&self, _builder_name: &str) -> Result<SourceStamp> {
        Ok(SourceStamp::pinned(self.branch.clone(), self.revision.clone()))
    }
}

/// Builders whose pending count is below `target`, with how many requests
/// each is short. Builders at or above the floor are left alone.
pub fn deficits(target: usize, pending: &[(String, usize)]) -> Vec<(String, usize)> {
    pending
        .iter()
        .filter(|(_, count)| *count < target)
        .map(|(builder, count)| (builder.clone(), target - count))
        .collect()
}

pub struct FloorMaintainer {
    id: SchedulerId,
    store: Arc<dyn BuildRequestStore>,
    builders: Vec<String>,
    num_pending: usize,
    poll_interval: TimeDelta,
    stamp_factory: Arc<dyn StampFactory>,
    template: RequestTemplate,
    last_check: Option<DateTime<Utc>>,
}

impl FloorMaintainer {
    pub fn new(
        id: SchedulerId,
        store: Arc<dyn BuildRequestStore>,
        builders: Vec<String>,
        num_pending: usize,
    ) -> Result<Self> {
        if id.as_str().trim().is_empty() {
            return Err(Error::InvalidConfig("scheduler name is empty".into()));
        }
        if builders.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "scheduler {id}: builder set is empty"
            )));
        }
        check_builder_names(&builders)
            .map_err(|e| Error::InvalidConfig(format!("scheduler {id}: {e}")))?;

        let template = RequestTemplate::for_scheduler(&id);
        Ok(Self {
            id,
            store,
            builders,
            num_pending,
            poll_interval: TimeDelta::seconds(DEFAULT_POLL_INTERVAL_SECS as i64),
            stamp_factory: Arc::new(BaselineStamp),
            template,
            last_check: None,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: TimeDelta) -> Result<Self> {
        if poll_interval <= TimeDelta::zero() {
            return Err(Error::InvalidConfig(format!(
                "scheduler {}: poll interval must be positive",
                self.id
            )));
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    pub fn with_stamp_factory(mut self, stamp_factory: Arc<dyn StampFactory>) -> Self {
        self.stamp_factory = stamp_factory;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.template = self.template.with_reason(reason);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.template = self.template.with_properties(properties);
        self
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
    }

    async fn pending_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut counts = Vec::with_capacity(self.builders.len());
        for builder in &self.builders {
            let count = self.store.count_pending_requests(builder).await?;
            counts.push((builder.clone(), count));
        }
        Ok(counts)
    }

    /// Count, then top up every short builder in one transaction.
    async fn reconcile(&self) -> Result<usize> {
        let to_create = deficits(self.num_pending, &self.pending_counts().await?);
        if to_create.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let mut submissions = 0;
        for (builder, count) in &to_create {
            let stamp = self
                .stamp_factory
                .stamp_for(builder)
                .await
                .map_err(|e| match e {
                    Error::StampFactoryFailed { .. } => e,
                    other => Error::StampFactoryFailed {
                        builder: builder.clone(),
                        message: other.to_string(),
                    },
                })?;
            let stamp_id = tx.get_or_create_source_stamp(&stamp).await?;
            for _ in 0..*count {
                tx.create_build_request(&NewBuildRequest {
                    source_stamp_id: stamp_id,
                    builder_names: vec![builder.clone()],
                    reason: self.template.reason.clone(),
                    properties: self.template.properties.clone(),
                })
                .await?;
                submissions += 1;
            }
        }
        tx.commit().await?;

        info!(
            scheduler = %self.id,
            topped_up = ?to_create,
            submissions,
            "Topped up pending build requests"
        );
        Ok(submissions)
    }
}

#[async_trait]
impl Scheduler for FloorMaintainer {
    fn id(&self) -> &SchedulerId {
        &self.id
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if let Some(last) = self.last_check {
            let due = later(last, self.poll_interval);
            if due > now {
                return Ok(TickOutcome::NotYet(later(due, recheck_margin())));
            }
        }

        let result = self.reconcile().await;
        self.last_check = Some(now);

        match result {
            Ok(submissions) => {
                debug!(scheduler = %self.id, submissions, "Floor reconciliation finished");
                Ok(TickOutcome::Reconciled {
                    submissions,
                    next_poll: later(now, self.poll_interval),
                })
            }
            Err(e) => {
                warn!(scheduler = %self.id, error = %e, "Floor reconciliation failed");
                Err(e)
            }
        }
    }
}
