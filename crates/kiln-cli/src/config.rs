//! Daemon configuration.

use anyhow::{Context, bail};
use kiln_scheduler::SchedulerConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level `kiln.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KilnConfig {
    #[serde(default)]
    pub store: StoreConfig,
    /// Longest sleep between two ticks of an instance, in seconds.
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    #[serde(default)]
    pub schedulers: Vec<SchedulerConfig>,
}

/// Where changes, stamps and build requests live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store; state is lost on exit.
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_idle_interval_secs() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    10
}

impl KilnConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.idle_interval_secs == 0 {
            bail!("idle_interval_secs must be at least 1");
        }
        if let StoreConfig::Postgres {
            max_connections: 0, ..
        } = self.store
        {
            bail!("store.max_connections must be at least 1");
        }
        Ok(())
    }

    /// Replace the postgres URL, typically with `DATABASE_URL`.
    pub fn with_database_url(mut self, database_url: Option<String>) -> Self {
        if let (StoreConfig::Postgres { url, .. }, Some(database_url)) =
            (&mut self.store, database_url)
        {
            *url = database_url;
        }
        self
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = KilnConfig::from_yaml("schedulers: []\n").unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.idle_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_postgres_store_and_schedulers() {
        let config = KilnConfig::from_yaml(
            r#"
store:
  kind: postgres
  url: postgres://kiln@localhost/kiln
idle_interval_secs: 15
schedulers:
  - kind: multi
    name: per-commit
    builders: [linux]
"#,
        )
        .unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                url: "postgres://kiln@localhost/kiln".into(),
                max_connections: 10,
            }
        );
        assert_eq!(config.idle_interval_secs, 15);
        assert_eq!(config.schedulers[0].name(), "per-commit");
    }

    #[test]
    fn test_zero_idle_interval_rejected() {
        assert!(KilnConfig::from_yaml("idle_interval_secs: 0\n").is_err());
    }

    #[test]
    fn test_database_url_override() {
        let config = KilnConfig::from_yaml(
            "store:\n  kind: postgres\n  url: postgres://localhost/dev\n",
        )
        .unwrap()
        .with_database_url(Some("postgres://db.internal/kiln".into()));

        assert!(matches!(
            config.store,
            StoreConfig::Postgres { ref url, .. } if url == "postgres://db.internal/kiln"
        ));
    }

    #[test]
    fn test_database_url_ignored_for_memory_store() {
        let config = KilnConfig::from_yaml("{}")
            .unwrap()
            .with_database_url(Some("postgres://db.internal/kiln".into()));
        assert_eq!(config.store, StoreConfig::Memory);
    }
}
