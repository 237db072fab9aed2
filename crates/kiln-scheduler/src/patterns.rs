//! File pattern matching for change filtering.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Include/exclude globs applied to the files touched by a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PathFilter {
    /// A change matches if any file matches one of these. Empty matches all.
    #[serde(default)]
    pub include: Vec<String>,
    /// A change is rejected if it touches files and every file matches one
    /// of these. A change with no files is never excluded.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl PathFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Filter that only looks at includes.
    pub fn including<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: patterns.into_iter().map(Into::into).collect(),
            exclude: vec![],
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Check the files of one change against the filter.
    pub fn matches(&self, files: &[String]) -> bool {
        if self.is_unrestricted() {
            return true;
        }

        let included = if self.include.is_empty() {
            true
        } else {
            files
                .iter()
                .any(|path| self.include.iter().any(|p| glob_match(p, path)))
        };

        let excluded = !self.exclude.is_empty()
            && !files.is_empty()
            && files
                .iter()
                .all(|path| self.exclude.iter().any(|p| glob_match(p, path)));

        included && !excluded
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(&format!("{}/", prefix));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if let Some(rest) = text.strip_prefix(&prefix_slash) {
            return !rest.contains('/');
        }
        return false;
    }
    if let Some((head, tail)) = pattern.split_once('*')
        && !tail.contains('*')
    {
        return text.len() >= head.len() + tail.len()
            && text.starts_with(head)
            && text.ends_with(tail);
    }
    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_glob_exact_and_wildcards() {
        assert!(glob_match("configs/release.yml", "configs/release.yml"));
        assert!(glob_match("mozilla/**", "mozilla/release/firefox.py"));
        assert!(!glob_match("mozilla/**", "mozilla2/firefox.py"));
        assert!(glob_match("l10n/*", "l10n/de"));
        assert!(!glob_match("l10n/*", "l10n/de/strings"));
        assert!(glob_match("*.py", "release.py"));
        assert!(!glob_match("a*a", "a"));
    }

    #[test]
    fn test_unrestricted_filter_matches_everything() {
        assert!(PathFilter::default().matches(&[]));
        assert!(PathFilter::default().matches(&files(&["any/file"])));
    }

    #[test]
    fn test_include_requires_one_matching_file() {
        let filter = PathFilter::including(["mozilla/**"]);
        assert!(filter.matches(&files(&["docs/readme", "mozilla/config.py"])));
        assert!(!filter.matches(&files(&["docs/readme"])));
        assert!(!filter.matches(&[]));
    }

    #[test]
    fn test_exclude_rejects_only_when_all_files_excluded() {
        let filter = PathFilter::new(vec![], vec!["docs/**".into()]);
        assert!(!filter.matches(&files(&["docs/a", "docs/b"])));
        assert!(filter.matches(&files(&["docs/a", "src/b"])));
    }

    #[test]
    fn test_change_without_files_is_not_excluded() {
        let exclude_only = PathFilter::new(vec![], vec!["docs/**".into()]);
        assert!(exclude_only.matches(&[]));

        let both = PathFilter::new(vec!["src/**".into()], vec!["docs/**".into()]);
        assert!(!both.matches(&[]));
    }
}
