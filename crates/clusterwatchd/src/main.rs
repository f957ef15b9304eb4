//! clusterwatchd — the clusterwatch daemon.
//!
//! Hosts one or more health manager engines on a shared redb registry and
//! an in-process notification bus.
//!
//! # Usage
//!
//! ```text
//! clusterwatchd standalone --config clusterwatch.toml --data-dir /var/lib/clusterwatch --engines 3
//! clusterwatchd list --data-dir /var/lib/clusterwatch
//! clusterwatchd scaffold-config > clusterwatch.toml
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,clusterwatchd=debug,clusterwatch=debug";

#[derive(Parser)]
#[command(name = "clusterwatchd", about = "clusterwatch health manager daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run health manager engines in this process until Ctrl-C.
    Standalone {
        /// Path to clusterwatch.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the registry database.
        #[arg(long, default_value = "/var/lib/clusterwatch")]
        data_dir: PathBuf,

        /// Number of engines to start.
        #[arg(long, default_value = "1")]
        engines: usize,
    },
    /// Print registered subscriptions and engine records as JSON.
    List {
        #[arg(long, default_value = "/var/lib/clusterwatch")]
        data_dir: PathBuf,
    },
    /// Print a config file with every default filled in.
    ScaffoldConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
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
        Command::Standalone {
            config,
            data_dir,
            engines,
        } => standalone::run_standalone(config, data_dir, engines).await,
        Command::List { data_dir } => standalone::list(&data_dir),
        Command::ScaffoldConfig => {
            let config = clusterwatch_core::ClusterwatchConfig::scaffold();
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
