//! EtherGuard launcher: edge, supernode, and solver modes in one binary.

mod solve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// EtherGuard - layer-2 overlay VPN with latency-based mesh routing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mesh participant
    Edge {
        /// Path to the EdgeConfig YAML
        #[arg(short, long, required_unless_present = "example")]
        config: Option<PathBuf>,

        /// Print an example config and exit
        #[arg(short, long)]
        example: bool,

        /// Do not start the UAPI control socket
        #[arg(long = "no-uapi")]
        no_uapi: bool,

        /// Socket bind implementation
        #[arg(long, default_value = "std")]
        bind: String,
    },
    /// Run the supernode coordinator
    Super {
        /// Path to the SuperConfig YAML
        #[arg(short, long, required_unless_present = "example")]
        config: Option<PathBuf>,

        /// Print an example config and exit
        #[arg(short, long)]
        example: bool,

        /// Do not start the UAPI control socket
        #[arg(long = "no-uapi")]
        no_uapi: bool,

        /// Socket bind implementation
        #[arg(long, default_value = "std")]
        bind: String,
    },
    /// Solve a latency matrix offline and print the routing tables
    Solve {
        /// Path to the whitespace weight matrix
        #[arg(short, long, required_unless_present = "example")]
        file: Option<PathBuf>,

        /// Print an example matrix and exit
        #[arg(short, long)]
        example: bool,
    },
}

fn init_logging(level: &str) {
    let filter = match level {
        "verbose" | "debug" => "debug",
        "normal" => "info",
        "silent" => "off",
        _ => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Edge {
            config,
            example,
            no_uapi: _,
            bind: _,
        } => {
            if example {
                print!(
                    "{}",
                    serde_yaml::to_string(&etherguard_edge::config::example_config())?
                );
                return Ok(());
            }
            let Some(config) = config else {
                anyhow::bail!("--config is required")
            };
            let cfg = etherguard_edge::config::load(&config)?;
            init_logging(&cfg.log_level.log_level);
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            etherguard_edge::runtime::run_edge(cfg, stop_rx).await
        }
        Command::Super {
            config,
            example,
            no_uapi: _,
            bind: _,
        } => {
            if example {
                print!(
                    "{}",
                    serde_yaml::to_string(&etherguard_super::config::example_config())?
                );
                return Ok(());
            }
            let Some(config) = config else {
                anyhow::bail!("--config is required")
            };
            let cfg = etherguard_super::config::load(&config)?;
            init_logging(&cfg.log_level.log_level);
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            etherguard_super::runtime::run_super(cfg, stop_rx).await
        }
        Command::Solve { file, example } => {
            if example {
                solve::print_example();
                return Ok(());
            }
            let Some(file) = file else {
                anyhow::bail!("--file is required")
            };
            solve::run(&file)
        }
    }
}
