//! Kiln daemon entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;
use handlers::NewChangeArgs;

#[derive(Parser)]
#[command(name = "kilnd")]
#[command(author, version, about = "Change-triggered build scheduler", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run { config } => handlers::run(&config).await?,
        Commands::Check { config } => handlers::check(&config).await?,
        Commands::Migrate { config } => handlers::migrate(&config).await?,
        Commands::AddChange {
            config,
            author,
            branch,
            revision,
            comments,
            files,
        } => {
            handlers::add_change(
                &config,
                NewChangeArgs {
                    author,
                    branch,
                    revision,
                    comments,
                    files,
                },
            )
            .await?
        }
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
