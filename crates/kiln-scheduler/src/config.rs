//! Declarative scheduler configuration.

use crate::chooser::{ChooserPlanner, PathRule, PathRuleChooser};
use crate::classifier::ChangeClassifier;
use crate::floor::{DEFAULT_POLL_INTERVAL_SECS, FixedStamp, FloorMaintainer};
use crate::gate::{StabilityMode, seconds};
use crate::multiplier::{DEFAULT_BUILDS_PER_CHANGE, RequestMultiplier};
use crate::patterns::PathFilter;
use crate::scheduler::{ChangeScheduler, Scheduler, Targeting};
use kiln_core::change::Properties;
use kiln_core::ids::SchedulerId;
use kiln_core::ports::BuildRequestStore;
use kiln_core::request::DEFAULT_REASON;
use kiln_core::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// One scheduler instance, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Fixed builder set, `builds_per_change` requests per stamp.
    Multi(MultiSchedulerConfig),
    /// Builders picked per change by path rules.
    Chooser(ChooserSchedulerConfig),
    /// Keeps `num_pending` requests queued on each builder.
    Persistent(PersistentSchedulerConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MultiSchedulerConfig {
    pub name: String,
    /// Only changes on this branch are considered.
    #[serde(default)]
    pub branch: Option<String>,
    /// Quiet period in seconds. Absent means every change builds on its own.
    #[serde(default)]
    pub tree_stable_timer_secs: Option<u64>,
    #[serde(default = "default_builds_per_change")]
    pub builds_per_change: usize,
    pub builders: Vec<String>,
    /// Which changes trigger builds. Absent means all of them.
    #[serde(default)]
    pub important: Option<PathFilter>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default = "default_reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChooserSchedulerConfig {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tree_stable_timer_secs: Option<u64>,
    #[serde(default = "default_builds_per_change")]
    pub builds_per_change: usize,
    pub rules: Vec<PathRule>,
    #[serde(default)]
    pub important: Option<PathFilter>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default = "default_reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersistentSchedulerConfig {
    pub name: String,
    pub builders: Vec<String>,
    pub num_pending: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Stamp for top-up requests. Absent means the empty baseline stamp.
    #[serde(default)]
    pub stamp: Option<StampConfig>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default = "default_reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StampConfig {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

fn default_builds_per_change() -> usize {
    DEFAULT_BUILDS_PER_CHANGE
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_reason() -> String {
    DEFAULT_REASON.to_string()
}

fn classifier(branch: &Option<String>, important: &Option<PathFilter>) -> ChangeClassifier {
    let mut classifier = ChangeClassifier::new();
    if let Some(branch) = branch {
        classifier = classifier.with_branch(branch.clone());
    }
    if let Some(filter) = important {
        classifier = classifier.with_path_filter(filter.clone());
    }
    classifier
}

impl SchedulerConfig {
    pub fn name(&self) -> &str {
        match self {
            SchedulerConfig::Multi(c) => &c.name,
            SchedulerConfig::Chooser(c) => &c.name,
            SchedulerConfig::Persistent(c) => &c.name,
        }
    }

    /// Construct the scheduler. Configuration mistakes surface here, before
    /// anything is registered.
    pub fn build(&self, store: Arc<dyn BuildRequestStore>) -> Result<Box<dyn Scheduler>> {
        let id = SchedulerId::new(self.name());

        match self {
            SchedulerConfig::Multi(c) => {
                let multiplier = RequestMultiplier::new(c.builds_per_change, c.builders.clone())
                    .map_err(|e| prefixed(&id, e))?;
                let mode =
                    StabilityMode::from_secs(c.tree_stable_timer_secs).map_err(|e| prefixed(&id, e))?;
                let scheduler = ChangeScheduler::new(
                    id,
                    store,
                    mode,
                    Targeting::Fixed(multiplier),
                )?
                .with_classifier(classifier(&c.branch, &c.important))
                .with_reason(c.reason.clone())
                .with_properties(c.properties.clone());
                Ok(Box::new(scheduler))
            }
            SchedulerConfig::Chooser(c) => {
                let chooser = PathRuleChooser::new(c.rules.clone()).map_err(|e| prefixed(&id, e))?;
                let planner = ChooserPlanner::new(c.builds_per_change, Arc::new(chooser))
                    .map_err(|e| prefixed(&id, e))?;
                let mode =
                    StabilityMode::from_secs(c.tree_stable_timer_secs).map_err(|e| prefixed(&id, e))?;
                let scheduler = ChangeScheduler::new(
                    id,
                    store,
                    mode,
                    Targeting::Chosen(planner),
                )?
                .with_classifier(classifier(&c.branch, &c.important))
                .with_reason(c.reason.clone())
                .with_properties(c.properties.clone());
                Ok(Box::new(scheduler))
            }
            SchedulerConfig::Persistent(c) => {
                let poll_interval = seconds(c.poll_interval_secs).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "scheduler {id}: poll interval of {}s is out of range",
                        c.poll_interval_secs
                    ))
                })?;
                let mut maintainer =
                    FloorMaintainer::new(id, store, c.builders.clone(), c.num_pending)?
                        .with_poll_interval(poll_interval)?
                        .with_reason(c.reason.clone())
                        .with_properties(c.properties.clone());
                if let Some(stamp) = &c.stamp {
                    maintainer = maintainer.with_stamp_factory(Arc::new(FixedStamp {
                        branch: stamp.branch.clone(),
                        revision: stamp.revision.clone(),
                    }));
                }
                Ok(Box::new(maintainer))
            }
        }
    }
}

fn prefixed(id: &SchedulerId, err: Error) -> Error {
    match err {
        Error::InvalidConfig(message) => Error::InvalidConfig(format!("scheduler {id}: {message}")),
        other => other,
    }
}

/// Build every configured scheduler, rejecting duplicate names. Nothing is
/// returned unless every entry is valid.
pub fn build_all(
    configs: &[SchedulerConfig],
    store: Arc<dyn BuildRequestStore>,
) -> Result<Vec<Box<dyn Scheduler>>> {
    let mut names = HashSet::new();
    let mut schedulers = Vec::with_capacity(configs.len());

    for config in configs {
        if !names.insert(config.name()) {
            return Err(Error::InvalidConfig(format!(
                "duplicate scheduler name: {}",
                config.name()
            )));
        }
        schedulers.push(config.build(store.clone())?);
    }

    Ok(schedulers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kiln_db::MemoryStore;

    const CONFIG: &str = r#"
- kind: multi
  name: release-tag
  branch: releases/mozilla-release
  tree_stable_timer_secs: 300
  builders: [l10n_repack, release_tag]
  important:
    include: ["configs/**"]
- kind: chooser
  name: per-platform
  builds_per_change: 1
  rules:
    - include: ["widget/gtk/**"]
      builders: [linux]
    - include: ["widget/cocoa/**"]
      builders: [macosx]
- kind: persistent
  name: idle-fill
  builders: [linux, win32]
  num_pending: 2
  stamp:
    branch: mozilla-central
"#;

    fn store() -> Arc<dyn BuildRequestStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_parse_tagged_schedulers() {
        let configs: Vec<SchedulerConfig> = serde_yaml::from_str(CONFIG).unwrap();
        assert_eq!(configs.len(), 3);

        let SchedulerConfig::Multi(multi) = &configs[0] else {
            panic!("expected a multi scheduler");
        };
        assert_eq!(multi.tree_stable_timer_secs, Some(300));
        assert_eq!(multi.builds_per_change, DEFAULT_BUILDS_PER_CHANGE);
        assert_eq!(multi.reason, DEFAULT_REASON);

        let SchedulerConfig::Persistent(persistent) = &configs[2] else {
            panic!("expected a persistent scheduler");
        };
        assert_eq!(persistent.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(
            persistent.stamp.as_ref().and_then(|s| s.branch.as_deref()),
            Some("mozilla-central")
        );
    }

    #[test]
    fn test_build_all_keeps_order() {
        let configs: Vec<SchedulerConfig> = serde_yaml::from_str(CONFIG).unwrap();
        let schedulers = build_all(&configs, store()).unwrap();

        let names: Vec<_> = schedulers.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(names, vec!["release-tag", "per-platform", "idle-fill"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut configs: Vec<SchedulerConfig> = serde_yaml::from_str(CONFIG).unwrap();
        configs.push(configs[0].clone());

        let err = build_all(&configs, store()).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("release-tag")));
    }

    #[test]
    fn test_invalid_entry_names_the_scheduler() {
        let configs: Vec<SchedulerConfig> = serde_yaml::from_str(
            r#"
- kind: multi
  name: broken
  builds_per_change: 0
  builders: [linux]
"#,
        )
        .unwrap();

        let err = build_all(&configs, store()).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(m) if m.starts_with("scheduler broken")));
    }

    #[test]
    fn test_out_of_range_timers_rejected() {
        let configs: Vec<SchedulerConfig> = serde_yaml::from_str(
            r#"
- kind: multi
  name: forever
  tree_stable_timer_secs: 100000000000000000
  builders: [linux]
- kind: persistent
  name: glacial
  builders: [linux]
  num_pending: 1
  poll_interval_secs: 18446744073709551615
"#,
        )
        .unwrap();

        for config in &configs {
            let err = config.build(store()).err().unwrap();
            assert!(
                matches!(&err, Error::InvalidConfig(m) if m.contains(config.name())),
                "unexpected error: {err}"
            );
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let parsed: std::result::Result<Vec<SchedulerConfig>, _> =
            serde_yaml::from_str("- kind: nightly\n  name: x\n");
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_built_scheduler_runs() {
        let store = MemoryStore::new();
        let configs: Vec<SchedulerConfig> = serde_yaml::from_str(CONFIG).unwrap();
        let mut schedulers = build_all(&configs[2..], Arc::new(store.clone())).unwrap();

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let outcome = schedulers[0].tick(now).await.unwrap();

        assert!(matches!(outcome, crate::scheduler::TickOutcome::Reconciled { submissions: 4, .. }));
        let requests = store.build_requests().await;
        let stamp = store.source_stamp(requests[0].source_stamp_id).await.unwrap();
        assert_eq!(stamp.branch.as_deref(), Some("mozilla-central"));
    }
}
