//! Request multiplication for a stable batch of changes.

use crate::gate::StabilityMode;
use kiln_core::change::{Change, Properties, SourceStamp};
use kiln_core::ids::{ChangeId, SchedulerId, SourceStampId};
use kiln_core::ports::StoreTransaction;
use kiln_core::request::{DEFAULT_REASON, NewBuildRequest};
use kiln_core::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Default number of requests created per stamp.
pub const DEFAULT_BUILDS_PER_CHANGE: usize = 3;

/// Reason and properties stamped onto every submission of a scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub reason: String,
    pub properties: Properties,
}

impl RequestTemplate {
    /// Template carrying a `scheduler` property naming the submitter.
    pub fn for_scheduler(scheduler: &SchedulerId) -> Self {
        let mut properties = Properties::new();
        properties.insert(
            "scheduler".to_string(),
            serde_json::Value::String(scheduler.to_string()),
        );
        Self {
            reason: DEFAULT_REASON.to_string(),
            properties,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Merge configured properties. The `scheduler` property is kept.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        for (key, value) in properties {
            if key != "scheduler" {
                self.properties.insert(key, value);
            }
        }
        self
    }
}

/// One planned submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSubmission {
    pub stamp: SourceStamp,
    pub builders: Vec<String>,
}

/// Everything one evaluation pass will write: the submissions and the
/// changes retired alongside them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPlan {
    pub submissions: Vec<PlannedSubmission>,
    pub retire: Vec<ChangeId>,
}

impl RequestPlan {
    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    /// Distinct stamps referenced by the plan.
    pub fn stamp_count(&self) -> usize {
        let mut keys: Vec<String> = self.submissions.iter().map(|s| s.stamp.key()).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    /// Write the plan through `tx`. Nothing is visible until the caller
    /// commits.
    pub async fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        scheduler: &SchedulerId,
        template: &RequestTemplate,
    ) -> Result<()> {
        let mut stamp_ids: HashMap<String, SourceStampId> = HashMap::new();

        for submission in &self.submissions {
            let key = submission.stamp.key();
            let stamp_id = match stamp_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = tx.get_or_create_source_stamp(&submission.stamp).await?;
                    stamp_ids.insert(key, id);
                    id
                }
            };

            tx.create_build_request(&NewBuildRequest {
                source_stamp_id: stamp_id,
                builder_names: submission.builders.clone(),
                reason: template.reason.clone(),
                properties: template.properties.clone(),
            })
            .await?;
        }

        if !self.retire.is_empty() {
            tx.retire_changes(scheduler, &self.retire).await?;
        }

        Ok(())
    }
}

/// Builder names must be non-blank and listed once.
pub(crate) fn check_builder_names(builders: &[String]) -> Result<()> {
    if builders.iter().any(|b| b.trim().is_empty()) {
        return Err(Error::InvalidConfig("builder names must not be blank".into()));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = builders.iter().find(|b| !seen.insert(b.as_str())) {
        return Err(Error::InvalidConfig(format!(
            "builder {duplicate} is listed more than once"
        )));
    }
    Ok(())
}

/// Creates `builds_per_change` requests against a fixed builder set.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMultiplier {
    builds_per_change: usize,
    builders: Vec<String>,
}

impl RequestMultiplier {
    pub fn new(builds_per_change: usize, builders: Vec<String>) -> Result<Self> {
        if builds_per_change == 0 {
            return Err(Error::InvalidConfig(
                "builds per change must be at least 1".into(),
            ));
        }
        if builders.is_empty() {
            return Err(Error::InvalidConfig("builder set is empty".into()));
        }
        check_builder_names(&builders)?;
        Ok(Self {
            builds_per_change,
            builders,
        })
    }

    pub fn builds_per_change(&self) -> usize {
        self.builds_per_change
    }

    pub fn builders(&self) -> &[String] {
        &self.builders
    }

    /// Plan the requests for a ready batch. Every change in the batch is
    /// retired.
    pub fn plan(&self, mode: StabilityMode, batch: &[Change]) -> RequestPlan {
        let mut submissions = Vec::new();

        for _ in 0..self.builds_per_change {
            match mode {
                StabilityMode::Immediate => {
                    for change in batch {
                        submissions.push(PlannedSubmission {
                            stamp: SourceStamp::for_change(change),
                            builders: self.builders.clone(),
                        });
                    }
                }
                StabilityMode::Debounced(_) => {
                    if !batch.is_empty() {
                        submissions.push(PlannedSubmission {
                            stamp: SourceStamp::for_changes(batch),
                            builders: self.builders.clone(),
                        });
                    }
                }
            }
        }

        RequestPlan {
            submissions,
            retire: batch.iter().map(|c| c.id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn change(id: i64) -> Change {
        Change {
            id: ChangeId::new(id),
            author: "dev".into(),
            branch: Some("release".into()),
            revision: Some(format!("rev{id}")),
            comments: String::new(),
            files: vec![],
            when: Utc::now(),
            properties: Properties::new(),
        }
    }

    fn builders(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_immediate_mode_builds_each_change_separately() {
        let multiplier = RequestMultiplier::new(3, builders(&["linux"])).unwrap();
        let batch: Vec<_> = (1..=5).map(change).collect();

        let plan = multiplier.plan(StabilityMode::Immediate, &batch);

        assert_eq!(plan.submission_count(), 15);
        assert_eq!(plan.stamp_count(), 5);
        assert!(plan.submissions.iter().all(|s| s.stamp.changes.len() == 1));
        assert_eq!(plan.retire.len(), 5);
    }

    #[test]
    fn test_debounced_mode_builds_one_batched_stamp() {
        let multiplier = RequestMultiplier::new(2, builders(&["linux", "win32"])).unwrap();
        let batch: Vec<_> = (1..=4).map(change).collect();

        let plan = multiplier.plan(StabilityMode::Debounced(TimeDelta::seconds(60)), &batch);

        assert_eq!(plan.submission_count(), 2);
        assert_eq!(plan.stamp_count(), 1);
        assert_eq!(plan.submissions[0].stamp.changes.len(), 4);
        assert_eq!(plan.submissions[0].builders, builders(&["linux", "win32"]));
        assert_eq!(plan.retire.len(), 4);
    }

    #[test]
    fn test_rejects_empty_builder_set() {
        assert!(matches!(
            RequestMultiplier::new(3, vec![]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            RequestMultiplier::new(0, builders(&["linux"])),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_repeated_builder() {
        let err = RequestMultiplier::new(1, builders(&["linux", "win32", "linux"])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("linux")));
    }

    #[test]
    fn test_template_keeps_scheduler_property() {
        let id = SchedulerId::new("release-tag");
        let mut extra = Properties::new();
        extra.insert("scheduler".into(), serde_json::json!("spoofed"));
        extra.insert("product".into(), serde_json::json!("firefox"));

        let template = RequestTemplate::for_scheduler(&id).with_properties(extra);

        assert_eq!(template.properties["scheduler"], serde_json::json!("release-tag"));
        assert_eq!(template.properties["product"], serde_json::json!("firefox"));
        assert_eq!(template.reason, DEFAULT_REASON);
    }
}
