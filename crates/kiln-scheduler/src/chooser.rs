//! Per-change builder selection.

use crate::gate::StabilityMode;
use crate::multiplier::{PlannedSubmission, RequestPlan, check_builder_names};
use crate::patterns::PathFilter;
use async_trait::async_trait;
use kiln_core::change::{Change, SourceStamp};
use kiln_core::ids::{ChangeId, SchedulerId};
use kiln_core::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Builders chosen for each change. A change missing from the map, or mapped
/// to an empty set, gets no builds.
pub type BuilderAssignment = BTreeMap<ChangeId, BTreeSet<String>>;

/// Policy deciding which builders each change should run on. May suspend,
/// e.g. to consult external state.
#[async_trait]
pub trait BuilderChooser: Send + Sync {
    async fn choose(&self, scheduler: &SchedulerId, changes: &[Change])
    -> Result<BuilderAssignment>;
}

/// Adapter for synchronous chooser closures.
pub struct FnChooser<F>(pub F);

#[async_trait]
impl<F> BuilderChooser for FnChooser<F>
where
    F: Fn(&SchedulerId, &[Change]) -> Result<BuilderAssignment> + Send + Sync,
{
    async fn choose(
        &self,
        scheduler: &SchedulerId,
        changes: &[Change],
    ) -> Result<BuilderAssignment> {
        (self.0)(scheduler, changes)
    }
}

/// A change matching `paths` is assigned `builders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PathRule {
    #[serde(flatten)]
    pub paths: PathFilter,
    pub builders: Vec<String>,
}

/// Chooser driven by an ordered list of path rules. Each change gets the
/// union of the builders of every rule it matches.
#[derive(Debug, Clone)]
pub struct PathRuleChooser {
    rules: Vec<PathRule>,
}

impl PathRuleChooser {
    pub fn new(rules: Vec<PathRule>) -> Result<Self> {
        if rules.is_empty() {
            return Err(Error::InvalidConfig("chooser has no rules".into()));
        }
        if let Some(rule) = rules.iter().find(|r| r.builders.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "chooser rule {:?} names no builders",
                rule.paths.include
            )));
        }
        for rule in &rules {
            check_builder_names(&rule.builders)?;
        }
        Ok(Self { rules })
    }

    pub fn assign(&self, change: &Change) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| rule.paths.matches(&change.files))
            .flat_map(|rule| rule.builders.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl BuilderChooser for PathRuleChooser {
    async fn choose(
        &self,
        _scheduler: &SchedulerId,
        changes: &[Change],
    ) -> Result<BuilderAssignment> {
        Ok(changes.iter().map(|c| (c.id, self.assign(c))).collect())
    }
}

/// Plans requests from a chooser's assignment instead of a fixed builder set.
#[derive(Clone)]
pub struct ChooserPlanner {
    builds_per_change: usize,
    chooser: Arc<dyn BuilderChooser>,
}

impl ChooserPlanner {
    pub fn new(builds_per_change: usize, chooser: Arc<dyn BuilderChooser>) -> Result<Self> {
        if builds_per_change == 0 {
            return Err(Error::InvalidConfig(
                "builds per change must be at least 1".into(),
            ));
        }
        Ok(Self {
            builds_per_change,
            chooser,
        })
    }

    pub fn builds_per_change(&self) -> usize {
        self.builds_per_change
    }

    /// Ask the chooser, then plan. A chooser failure leaves nothing planned.
    pub async fn plan(
        &self,
        scheduler: &SchedulerId,
        mode: StabilityMode,
        batch: &[Change],
    ) -> Result<RequestPlan> {
        let assignment = self.chooser.choose(scheduler, batch).await?;
        Ok(plan_from_assignment(
            self.builds_per_change,
            mode,
            batch,
            &assignment,
        ))
    }
}

/// Every change in `batch` is retired, whether or not it was assigned any
/// builders.
pub fn plan_from_assignment(
    builds_per_change: usize,
    mode: StabilityMode,
    batch: &[Change],
    assignment: &BuilderAssignment,
) -> RequestPlan {
    let mut submissions = Vec::new();

    match mode {
        StabilityMode::Immediate => {
            for _ in 0..builds_per_change {
                for change in batch {
                    let Some(builders) = assignment.get(&change.id).filter(|b| !b.is_empty())
                    else {
                        continue;
                    };
                    submissions.push(PlannedSubmission {
                        stamp: SourceStamp::for_change(change),
                        builders: builders.iter().cloned().collect(),
                    });
                }
            }
        }
        StabilityMode::Debounced(_) => {
            let union: BTreeSet<String> = batch
                .iter()
                .filter_map(|c| assignment.get(&c.id))
                .flatten()
                .cloned()
                .collect();
            if !union.is_empty() {
                let stamp = SourceStamp::for_changes(batch);
                for _ in 0..builds_per_change {
                    submissions.push(PlannedSubmission {
                        stamp: stamp.clone(),
                        builders: union.iter().cloned().collect(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use kiln_core::change::Properties;

    fn change(id: i64, files: &[&str]) -> Change {
        Change {
            id: ChangeId::new(id),
            author: "dev".into(),
            branch: None,
            revision: None,
            comments: String::new(),
            files: files.iter().map(|f| f.to_string()).collect(),
            when: Utc::now(),
            properties: Properties::new(),
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_immediate_mode_targets_each_changes_subset() {
        let batch = vec![change(1, &[]), change(2, &[]), change(3, &[])];
        let assignment: BuilderAssignment = [
            (ChangeId::new(1), set(&["linux"])),
            (ChangeId::new(2), set(&[])),
            (ChangeId::new(3), set(&["mac", "win32"])),
        ]
        .into_iter()
        .collect();

        let plan = plan_from_assignment(2, StabilityMode::Immediate, &batch, &assignment);

        assert_eq!(plan.submission_count(), 4);
        assert!(
            plan.submissions
                .iter()
                .all(|s| s.stamp.changes != vec![ChangeId::new(2)])
        );
        let mac_win: Vec<_> = plan
            .submissions
            .iter()
            .filter(|s| s.stamp.changes == vec![ChangeId::new(3)])
            .collect();
        assert_eq!(mac_win.len(), 2);
        assert_eq!(mac_win[0].builders, vec!["mac".to_string(), "win32".to_string()]);
        assert_eq!(plan.retire.len(), 3);
    }

    #[test]
    fn test_debounced_mode_unions_subsets() {
        let batch = vec![change(1, &[]), change(2, &[])];
        let assignment: BuilderAssignment = [
            (ChangeId::new(1), set(&["linux"])),
            (ChangeId::new(2), set(&["linux", "mac"])),
        ]
        .into_iter()
        .collect();

        let plan = plan_from_assignment(
            3,
            StabilityMode::Debounced(TimeDelta::seconds(10)),
            &batch,
            &assignment,
        );

        assert_eq!(plan.submission_count(), 3);
        assert_eq!(plan.stamp_count(), 1);
        assert_eq!(
            plan.submissions[0].builders,
            vec!["linux".to_string(), "mac".to_string()]
        );
    }

    #[test]
    fn test_empty_assignment_still_retires_everything() {
        let batch = vec![change(1, &[]), change(2, &[])];
        for mode in [
            StabilityMode::Immediate,
            StabilityMode::Debounced(TimeDelta::seconds(5)),
        ] {
            let plan = plan_from_assignment(3, mode, &batch, &BuilderAssignment::new());
            assert_eq!(plan.submission_count(), 0);
            assert_eq!(plan.retire, vec![ChangeId::new(1), ChangeId::new(2)]);
        }
    }

    #[tokio::test]
    async fn test_path_rules_collect_matching_builders() {
        let chooser = PathRuleChooser::new(vec![
            PathRule {
                paths: PathFilter::including(["l10n/**"]),
                builders: vec!["repack".into()],
            },
            PathRule {
                paths: PathFilter::including(["src/**"]),
                builders: vec!["linux".into(), "mac".into()],
            },
        ])
        .unwrap();

        let batch = vec![
            change(1, &["l10n/de/strings"]),
            change(2, &["src/main.c", "l10n/fr/strings"]),
            change(3, &["README"]),
        ];
        let assignment = chooser
            .choose(&SchedulerId::new("l10n"), &batch)
            .await
            .unwrap();

        assert_eq!(assignment[&ChangeId::new(1)], set(&["repack"]));
        assert_eq!(assignment[&ChangeId::new(2)], set(&["linux", "mac", "repack"]));
        assert!(assignment[&ChangeId::new(3)].is_empty());
    }

    #[test]
    fn test_rule_with_repeated_builder_rejected() {
        let result = PathRuleChooser::new(vec![PathRule {
            paths: PathFilter::including(["src/**"]),
            builders: vec!["linux".into(), "linux".into()],
        }]);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_chooser_failure_plans_nothing() {
        let planner = ChooserPlanner::new(
            3,
            Arc::new(FnChooser(
                |_: &SchedulerId, _: &[Change]| -> Result<BuilderAssignment> {
                    Err(Error::ChooserFailed("inventory unavailable".into()))
                },
            )),
        )
        .unwrap();

        let result = planner
            .plan(
                &SchedulerId::new("nightly"),
                StabilityMode::Immediate,
                &[change(1, &[])],
            )
            .await;
        assert!(matches!(result, Err(Error::ChooserFailed(_))));
    }
}
