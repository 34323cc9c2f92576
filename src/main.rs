use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "devplane")]
#[command(version, about = "Local development control plane")]
pub struct Cli {
    /// Path to devplane.toml. Defaults to ./.devplane/devplane.toml, then the user config dir.
    #[arg(long, global = true, env = "DEVPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane HTTP and WebSocket server
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any errors
    Validate,
    /// Write a default devplane.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            let _guard = cmd::init_tracing(cli.verbose, cli.log_format, cli.log_dir.as_deref())?;
            cmd::cmd_serve(
                &cwd,
                cli.config.as_deref(),
                cmd::serve::ServeArgs {
                    host: host.clone(),
                    port: *port,
                    dev: *dev,
                },
            )
            .await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cwd, cli.config.as_deref(), command.clone())?;
        }
    }

    Ok(())
}
