mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use cmd::hub::HubSubcommand;
use jupytercluster_core::config::CONFIG_FILE;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "jupytercluster",
    about = "Provision and manage notebook hubs on a shared Kubernetes cluster",
    version
)]
struct Cli {
    /// Path to the operator config file
    #[arg(long, global = true, env = "JUPYTERCLUSTER_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Identity to act as (defaults to $USER)
    #[arg(long, global = true, env = "JUPYTERCLUSTER_ACTOR")]
    actor: Option<String>,

    /// Output as JSON
    #[arg(long, short = 'j', global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the operator config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Create, start, stop, delete and inspect hubs
    Hub {
        #[command(subcommand)]
        subcommand: HubSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let actor = cli
        .actor
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "admin".to_string());

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Hub { subcommand } => cmd::hub::run(&cli.config, &actor, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
