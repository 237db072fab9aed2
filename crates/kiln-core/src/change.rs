//! Change events and the source stamps derived from them.

use crate::ids::ChangeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form properties carried by changes and build requests.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// A source modification observed by a change source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub author: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub comments: String,
    pub files: Vec<String>,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub properties: Properties,
}

/// A change as submitted by a change source, before the store numbers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChange {
    pub author: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub properties: Properties,
}

impl NewChange {
    pub fn into_change(self, id: ChangeId) -> Change {
        Change {
            id,
            author: self.author,
            branch: self.branch,
            revision: self.revision,
            comments: self.comments,
            files: self.files,
            when: self.when,
            properties: self.properties,
        }
    }
}

/// What to build: a branch/revision pair plus the changes it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub changes: Vec<ChangeId>,
}

impl SourceStamp {
    /// The empty stamp: no branch, no revision, no changes.
    pub fn baseline() -> Self {
        Self {
            branch: None,
            revision: None,
            changes: vec![],
        }
    }

    /// A stamp pinned to a branch and revision without any changes.
    pub fn pinned(branch: Option<String>, revision: Option<String>) -> Self {
        Self {
            branch,
            revision,
            changes: vec![],
        }
    }

    /// Stamp covering exactly one change.
    pub fn for_change(change: &Change) -> Self {
        Self::for_changes(std::slice::from_ref(change))
    }

    /// Stamp covering a batch. Branch and revision follow the newest change.
    pub fn for_changes(changes: &[Change]) -> Self {
        let latest = changes.iter().max_by_key(|c| c.id);
        let mut ids: Vec<ChangeId> = changes.iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();

        Self {
            branch: latest.and_then(|c| c.branch.clone()),
            revision: latest.and_then(|c| c.revision.clone()),
            changes: ids,
        }
    }

    /// Deduplication key. Equal keys must resolve to one stored stamp.
    pub fn key(&self) -> String {
        let mut ids: Vec<i64> = self.changes.iter().map(|c| c.get()).collect();
        ids.sort_unstable();
        ids.dedup();
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        format!(
            "{}|{}|{}",
            self.branch.as_deref().unwrap_or(""),
            self.revision.as_deref().unwrap_or(""),
            ids.join(",")
        )
    }
}

/// Unretired changes a scheduler has classified, split by importance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedChanges {
    pub important: Vec<Change>,
    pub unimportant: Vec<Change>,
}

impl ClassifiedChanges {
    /// Split `changes` by `is_important`. Every input lands in exactly one side.
    pub fn partition<F>(changes: impl IntoIterator<Item = Change>, is_important: F) -> Self
    where
        F: Fn(&Change) -> bool,
    {
        let (important, unimportant) = changes.into_iter().partition(|c| is_important(c));
        Self {
            important,
            unimportant,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.important.is_empty() && self.unimportant.is_empty()
    }

    pub fn len(&self) -> usize {
        self.important.len() + self.unimportant.len()
    }

    /// Timestamp of the newest important change.
    pub fn latest_important(&self) -> Option<DateTime<Utc>> {
        self.important.iter().map(|c| c.when).max()
    }

    /// All changes, important and not, ordered by change number.
    pub fn batch(&self) -> Vec<Change> {
        let mut all: Vec<Change> = self
            .important
            .iter()
            .chain(self.unimportant.iter())
            .cloned()
            .collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn ids(&self) -> Vec<ChangeId> {
        self.batch().iter().map(|c| c.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change(id: i64, branch: &str, revision: &str) -> Change {
        Change {
            id: ChangeId::new(id),
            author: "dev".into(),
            branch: Some(branch.into()),
            revision: Some(revision.into()),
            comments: String::new(),
            files: vec![],
            when: Utc::now(),
            properties: Properties::new(),
        }
    }

    #[test]
    fn test_batch_stamp_follows_newest_change() {
        let stamp = SourceStamp::for_changes(&[
            change(7, "release", "bbb"),
            change(3, "release", "aaa"),
        ]);
        assert_eq!(stamp.revision.as_deref(), Some("bbb"));
        assert_eq!(stamp.changes, vec![ChangeId::new(3), ChangeId::new(7)]);
    }

    #[test]
    fn test_stamp_key_ignores_change_order() {
        let a = SourceStamp {
            branch: None,
            revision: None,
            changes: vec![ChangeId::new(2), ChangeId::new(1)],
        };
        let b = SourceStamp {
            branch: None,
            revision: None,
            changes: vec![ChangeId::new(1), ChangeId::new(2)],
        };
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), SourceStamp::baseline().key());
    }

    #[test]
    fn test_partition_covers_every_change_once() {
        let input = vec![
            change(1, "a", "r1"),
            change(2, "b", "r2"),
            change(3, "a", "r3"),
        ];
        let classified = ClassifiedChanges::partition(input.clone(), |c| {
            c.branch.as_deref() == Some("a")
        });

        assert_eq!(classified.len(), input.len());
        assert_eq!(classified.batch(), input);
        assert!(
            classified
                .important
                .iter()
                .all(|c| !classified.unimportant.contains(c))
        );
    }
}
