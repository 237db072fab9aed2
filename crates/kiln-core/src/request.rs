//! Build request types.

use crate::change::Properties;
use crate::ids::{BuildRequestId, SourceStampId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason recorded on requests when a scheduler is not configured otherwise.
pub const DEFAULT_REASON: &str = "scheduler";

/// A stored unit of scheduled work for one builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub source_stamp_id: SourceStampId,
    pub builder_name: String,
    pub reason: String,
    pub properties: Properties,
    pub status: BuildRequestStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildRequestStatus {
    Pending,
    Started,
    Finished,
}

impl BuildRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildRequestStatus::Pending => "pending",
            BuildRequestStatus::Started => "started",
            BuildRequestStatus::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BuildRequestStatus::Pending),
            "started" => Some(BuildRequestStatus::Started),
            "finished" => Some(BuildRequestStatus::Finished),
            _ => None,
        }
    }
}

/// One submission: a stamp and the builders that should build it. The store
/// expands it into one [`BuildRequest`] per builder.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuildRequest {
    pub source_stamp_id: SourceStampId,
    pub builder_names: Vec<String>,
    pub reason: String,
    pub properties: Properties,
}
