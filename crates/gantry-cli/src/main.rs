//! Gantry CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Run and validate Gantry pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline locally, following auto promotions until the
    /// workflow settles
    Run {
        /// Path to the pipeline definition file
        #[arg(default_value = "gantry.kdl")]
        path: String,
        /// Pipeline to trigger (defaults to the first one in the file)
        #[arg(long)]
        pipeline: Option<String>,
        /// Branch recorded on the trigger
        #[arg(long, default_value = "master")]
        branch: String,
        /// Commit hash recorded on the trigger
        #[arg(long, default_value = "local")]
        commit: String,
        /// Secret bundle file
        #[arg(long, env = "GANTRY_SECRETS")]
        secrets: Option<String>,
        /// Persistent artifact cache directory (defaults to in-memory)
        #[arg(long, env = "GANTRY_CACHE_DIR")]
        cache_dir: Option<String>,
        /// Working directory for commands (defaults to the definition
        /// file's directory)
        #[arg(long)]
        workdir: Option<String>,
        /// Extra KEY=VALUE environment entries for every job
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },
    /// Validate a pipeline definition file
    Validate {
        /// Path to the definition file
        #[arg(default_value = "gantry.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean for event output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            path,
            pipeline,
            branch,
            commit,
            secrets,
            cache_dir,
            workdir,
            env,
        } => {
            commands::run::run_local(commands::run::RunArgs {
                path,
                pipeline,
                branch,
                commit,
                secrets,
                cache_dir,
                workdir,
                env,
            })
            .await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
