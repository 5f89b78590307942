//! kiln CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod collaborators;
mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "kiln build engine", long_about = None)]
struct Cli {
    /// Engine configuration file. Defaults apply when it is absent.
    #[arg(long, env = "KILN_CONFIG", default_value = "kiln.kdl")]
    config: PathBuf,

    /// Emit operator logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine on task envelopes read from stdin, one JSON object per line
    Worker {
        /// PostgreSQL URL. Without it, records are kept in memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Run a single task envelope from a file
    Run {
        /// Path to the JSON envelope
        path: PathBuf,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Validate the engine configuration
    ValidateConfig,
    /// Detect the language of a source directory
    Detect {
        /// Directory to inspect
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Print the cache root a repository is fetched into
    CachePath {
        /// Repository URL
        repo_url: String,
        #[arg(long, default_value = "")]
        branch: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        service: String,
        /// git, svn or oss. Inferred from the URL when empty.
        #[arg(long, default_value = "")]
        server_type: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries deliveries, so operator logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Worker { database_url } => {
            let config = commands::load_config(&cli.config)?;
            commands::worker::serve(config, database_url).await?;
        }
        Commands::Run { path, database_url } => {
            let config = commands::load_config(&cli.config)?;
            commands::worker::run_once(config, database_url, &path).await?;
        }
        Commands::ValidateConfig => {
            commands::validate(&cli.config)?;
        }
        Commands::Detect { dir } => {
            commands::detect(&dir).await?;
        }
        Commands::CachePath {
            repo_url,
            branch,
            tenant,
            service,
            server_type,
        } => {
            let config = commands::load_config(&cli.config)?;
            commands::cache_path(&config, &repo_url, &branch, &server_type, &tenant, &service)?;
        }
    }

    Ok(())
}
