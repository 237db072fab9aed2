//! Error types for kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    // Lookup errors
    #[error("Scheduler not found: {0}")]
    SchedulerNotFound(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    #[error("Source stamp not found: {0}")]
    SourceStampNotFound(String),

    // Policy errors
    #[error("Builder chooser failed: {0}")]
    ChooserFailed(String),

    #[error("Stamp factory failed for builder {builder}: {message}")]
    StampFactoryFailed { builder: String, message: String },

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the next scheduling tick may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ChooserFailed(_)
                | Error::StampFactoryFailed { .. }
                | Error::Database(_)
                | Error::TransactionAborted(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_retried() {
        assert!(!Error::InvalidConfig("no builders".into()).is_transient());
        assert!(Error::Database("connection reset".into()).is_transient());
        assert!(Error::ChooserFailed("timeout".into()).is_transient());
    }
}
