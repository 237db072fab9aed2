//! Scheduler instances and their evaluation pass.

use crate::chooser::ChooserPlanner;
use crate::classifier::ChangeClassifier;
use crate::gate::{self, GateDecision, StabilityMode};
use crate::multiplier::{RequestMultiplier, RequestPlan, RequestTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::change::{Change, Properties};
use kiln_core::ids::{ChangeId, SchedulerId};
use kiln_core::ports::BuildRequestStore;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do until new changes arrive.
    Idle,
    /// Important changes are waiting for the tree to settle.
    RecheckAt(DateTime<Utc>),
    /// Requests were submitted and changes retired in one transaction.
    Scheduled { submissions: usize, retired: usize },
    /// The poll interval has not elapsed yet.
    NotYet(DateTime<Utc>),
    /// A floor reconciliation ran.
    Reconciled {
        submissions: usize,
        next_poll: DateTime<Utc>,
    },
}

impl TickOutcome {
    /// When the scheduler asked to be woken, if it did.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TickOutcome::RecheckAt(at) | TickOutcome::NotYet(at) => Some(*at),
            TickOutcome::Reconciled { next_poll, .. } => Some(*next_poll),
            TickOutcome::Idle | TickOutcome::Scheduled { .. } => None,
        }
    }
}

/// A scheduler instance. `tick` takes `&mut self`, so one instance can never
/// run two passes at once.
#[async_trait]
pub trait Scheduler: Send {
    fn id(&self) -> &SchedulerId;

    async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome>;
}

/// Where a change-driven scheduler sends its requests.
#[derive(Clone)]
pub enum Targeting {
    Fixed(RequestMultiplier),
    Chosen(ChooserPlanner),
}

impl Targeting {
    async fn plan(
        &self,
        scheduler: &SchedulerId,
        mode: StabilityMode,
        batch: &[Change],
    ) -> Result<RequestPlan> {
        match self {
            Targeting::Fixed(multiplier) => Ok(multiplier.plan(mode, batch)),
            Targeting::Chosen(planner) => planner.plan(scheduler, mode, batch).await,
        }
    }
}

/// Classifies incoming changes, waits for the tree to be stable, and turns
/// each stable batch into build requests.
pub struct ChangeScheduler {
    id: SchedulerId,
    store: Arc<dyn BuildRequestStore>,
    classifier: ChangeClassifier,
    mode: StabilityMode,
    targeting: Targeting,
    template: RequestTemplate,
}

impl ChangeScheduler {
    pub fn new(
        id: SchedulerId,
        store: Arc<dyn BuildRequestStore>,
        mode: StabilityMode,
        targeting: Targeting,
    ) -> Result<Self> {
        if id.as_str().trim().is_empty() {
            return Err(Error::InvalidConfig("scheduler name is empty".into()));
        }
        if let StabilityMode::Debounced(quiet) = mode
            && quiet < chrono::TimeDelta::zero()
        {
            return Err(Error::InvalidConfig(format!(
                "scheduler {id}: tree stable timer is negative"
            )));
        }

        let template = RequestTemplate::for_scheduler(&id);
        Ok(Self {
            id,
            store,
            classifier: ChangeClassifier::new(),
            mode,
            targeting,
            template,
        })
    }

    pub fn with_classifier(mut self, classifier: ChangeClassifier) -> Self {
        self.classifier = classifier;
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

    pub fn mode(&self) -> StabilityMode {
        self.mode
    }

    /// Pull unseen changes from the store and classify them.
    async fn observe_changes(&self) -> Result<()> {
        let unseen = self.store.unseen_changes(&self.id).await?;
        if unseen.is_empty() {
            return Ok(());
        }

        let classified = self
            .classifier
            .classify_changes(self.store.as_ref(), &self.id, &unseen)
            .await?;
        debug!(
            scheduler = %self.id,
            seen = unseen.len(),
            important = classified.important.len(),
            unimportant = classified.unimportant.len(),
            "Classified changes"
        );
        Ok(())
    }

    /// Submit the plan and retire its changes as one unit.
    async fn execute(&self, plan: &RequestPlan) -> Result<()> {
        let mut tx = self.store.begin().await?;
        plan.apply(tx.as_mut(), &self.id, &self.template).await?;
        tx.commit().await
    }
}

#[async_trait]
impl Scheduler for ChangeScheduler {
    fn id(&self) -> &SchedulerId {
        &self.id
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.observe_changes().await?;

        let classified = self.store.get_classified_changes(&self.id).await?;
        let batch = match gate::evaluate(self.mode, &classified, now) {
            GateDecision::Idle => return Ok(TickOutcome::Idle),
            GateDecision::RecheckAt(at) => {
                debug!(scheduler = %self.id, recheck_at = %at, "Tree not stable yet");
                return Ok(TickOutcome::RecheckAt(at));
            }
            GateDecision::Ready(batch) => batch,
        };
        let change_ids: Vec<ChangeId> = batch.iter().map(|c| c.id).collect();

        let result = async {
            let plan = self.targeting.plan(&self.id, self.mode, &batch).await?;
            self.execute(&plan).await?;
            Ok::<_, Error>(plan)
        }
        .await;

        match result {
            Ok(plan) => {
                info!(
                    scheduler = %self.id,
                    changes = ?change_ids,
                    submissions = plan.submission_count(),
                    stamps = plan.stamp_count(),
                    "Scheduled build requests"
                );
                Ok(TickOutcome::Scheduled {
                    submissions: plan.submission_count(),
                    retired: plan.retire.len(),
                })
            }
            Err(e) => {
                warn!(
                    scheduler = %self.id,
                    changes = ?change_ids,
                    error = %e,
                    "Scheduling pass abandoned; changes stay classified"
                );
                Err(e)
            }
        }
    }
}
