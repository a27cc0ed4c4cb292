mod cmd;
mod output;
mod setup;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tre",
    about = "Test remediation engine: reconcile Xray tests and preconditions with a catalog",
    version,
    propagate_version = true
)]
struct Cli {
    /// YAML config file (overlaid by TRE_* environment variables)
    #[arg(long, global = true, env = "TRE_CONFIG")]
    config: Option<PathBuf>,

    /// Jira project key (overrides config and environment)
    #[arg(long, global = true)]
    project: Option<String>,

    /// Tracker base URL (overrides config and environment)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate catalog files without touching the tracker
    Validate {
        #[arg(required = true)]
        catalogs: Vec<PathBuf>,
    },

    /// Snapshot the tracker and print the plan that would converge it
    Plan {
        #[arg(required = true)]
        catalogs: Vec<PathBuf>,

        #[command(flatten)]
        source: cmd::PlanSource,

        /// Write the plan JSON here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Plan and execute, or resume a checkpointed run
    Run {
        /// Catalog files (ignored with --resume-from)
        catalogs: Vec<PathBuf>,

        #[command(flatten)]
        source: cmd::PlanSource,

        #[command(flatten)]
        run: cmd::run::RunArgs,
    },

    /// Summarize a checkpoint file
    Status { checkpoint: PathBuf },

    /// Snapshot the tracker: counts, folders and standalone preconditions
    Inventory {
        /// Catalog files used to decide which step lists to fetch
        catalogs: Vec<PathBuf>,

        /// Write the snapshot JSON here (usable later with --snapshot)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Inventory { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let globals = setup::Globals {
        config: cli.config,
        project: cli.project,
        base_url: cli.base_url,
    };

    let result = match cli.command {
        Commands::Validate { catalogs } => cmd::validate::run(&catalogs, cli.json),
        Commands::Plan {
            catalogs,
            source,
            out,
        } => cmd::plan::run(&globals, &catalogs, &source, out.as_deref(), cli.json),
        Commands::Run {
            catalogs,
            source,
            run,
        } => cmd::run::run(&globals, &catalogs, &source, &run, cli.json),
        Commands::Status { checkpoint } => cmd::status::run(&checkpoint, cli.json),
        Commands::Inventory { catalogs, out } => {
            cmd::inventory::run(&globals, &catalogs, out.as_deref(), cli.json)
        }
    };

    match result {
        Ok(cmd::Exit::Clean) => {}
        Ok(cmd::Exit::Failures) => std::process::exit(2),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
