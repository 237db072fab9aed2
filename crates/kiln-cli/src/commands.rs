//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run every configured scheduler until interrupted
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: PathBuf,
    },

    /// Validate a configuration file without starting anything
    Check {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: PathBuf,
    },

    /// Apply database migrations
    Migrate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: PathBuf,
    },

    /// Record a change in the configured store
    AddChange {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: PathBuf,

        /// Change author
        #[arg(long)]
        author: String,

        /// Branch the change landed on
        #[arg(short, long)]
        branch: Option<String>,

        /// Revision identifier
        #[arg(short, long)]
        revision: Option<String>,

        /// Commit message
        #[arg(long, default_value = "")]
        comments: String,

        /// Touched file (repeatable)
        #[arg(short, long = "file")]
        files: Vec<String>,
    },

    /// Print the JSON schema of the configuration file
    Schema,
}
