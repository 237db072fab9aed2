//! Change classification.

use crate::patterns::PathFilter;
use kiln_core::Result;
use kiln_core::change::{Change, ClassifiedChanges};
use kiln_core::ids::SchedulerId;
use kiln_core::ports::{BuildRequestStore, ImportanceFn};
use std::fmt;
use std::sync::Arc;

/// Splits newly observed changes into important and unimportant sets and
/// persists the split against a scheduler.
#[derive(Clone)]
pub struct ChangeClassifier {
    branch: Option<String>,
    is_important: Arc<ImportanceFn>,
}

impl ChangeClassifier {
    /// Every change on every branch is important.
    pub fn new() -> Self {
        Self {
            branch: None,
            is_important: Arc::new(|_: &Change| true),
        }
    }

    /// Only consider changes on `branch`; others are skipped entirely.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_predicate<F>(mut self, is_important: F) -> Self
    where
        F: Fn(&Change) -> bool + Send + Sync + 'static,
    {
        self.is_important = Arc::new(is_important);
        self
    }

    /// Changes are important when their files pass `filter`.
    pub fn with_path_filter(self, filter: PathFilter) -> Self {
        self.with_predicate(move |change: &Change| filter.matches(&change.files))
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    fn on_branch(&self, change: &Change) -> bool {
        match &self.branch {
            Some(branch) => change.branch.as_deref() == Some(branch.as_str()),
            None => true,
        }
    }

    /// Pure classification of the changes on this classifier's branch.
    pub fn partition(&self, changes: &[Change]) -> ClassifiedChanges {
        ClassifiedChanges::partition(
            changes.iter().filter(|c| self.on_branch(c)).cloned(),
            &*self.is_important,
        )
    }

    /// Classify and persist. The scheduler's watermark moves past every
    /// change in `changes`, including those on other branches.
    pub async fn classify_changes(
        &self,
        store: &dyn BuildRequestStore,
        scheduler: &SchedulerId,
        changes: &[Change],
    ) -> Result<ClassifiedChanges> {
        let Some(seen_up_to) = changes.iter().map(|c| c.id).max() else {
            return Ok(ClassifiedChanges::default());
        };

        if changes.iter().all(|c| self.on_branch(c)) {
            return store
                .classify_changes(scheduler, changes, &*self.is_important)
                .await;
        }

        let classified = self.partition(changes);
        store
            .record_classification(scheduler, &classified, seen_up_to)
            .await?;
        Ok(classified)
    }
}

impl Default for ChangeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeClassifier")
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::change::Properties;
    use kiln_core::ids::ChangeId;

    fn change(id: i64, branch: &str, files: &[&str]) -> Change {
        Change {
            id: ChangeId::new(id),
            author: "dev".into(),
            branch: Some(branch.into()),
            revision: None,
            comments: String::new(),
            files: files.iter().map(|f| f.to_string()).collect(),
            when: Utc::now(),
            properties: Properties::new(),
        }
    }

    #[test]
    fn test_classification_is_total_and_disjoint() {
        let classifier = ChangeClassifier::new().with_path_filter(PathFilter::including(["src/**"]));
        let input = vec![
            change(1, "main", &["src/lib.rs"]),
            change(2, "main", &["README"]),
            change(3, "main", &["src/a.rs", "docs/a"]),
            change(4, "main", &[]),
        ];

        let classified = classifier.partition(&input);

        assert_eq!(classified.batch(), input);
        let important: Vec<_> = classified.important.iter().map(|c| c.id.get()).collect();
        let unimportant: Vec<_> = classified.unimportant.iter().map(|c| c.id.get()).collect();
        assert_eq!(important, vec![1, 3]);
        assert_eq!(unimportant, vec![2, 4]);
    }

    #[test]
    fn test_branch_filter_drops_foreign_changes() {
        let classifier = ChangeClassifier::new().with_branch("release");
        let classified = classifier.partition(&[
            change(1, "release", &[]),
            change(2, "default", &[]),
        ]);
        assert_eq!(classified.len(), 1);
        assert_eq!(classified.important[0].id, ChangeId::new(1));
    }
}
