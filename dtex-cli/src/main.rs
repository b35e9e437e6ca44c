mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dtex")]
#[command(about = "Delegated token exchange for agent chains")]
#[command(version)]
pub struct Cli {
    /// Engine config file (TOML); DTEX_* variables override it
    #[arg(short, long, global = true, env = "DTEX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Exchange a subject token for a narrower token
    Exchange(ExchangeArgs),
    /// Verify a token and print its claims and delegation trail
    Inspect {
        /// Token, or @path to read it from a file
        token: String,
    },
    /// Check a token the way a receiving agent would
    Verify {
        /// Token, or @path to read it from a file
        token: String,

        /// Audience the token must be addressed to
        #[arg(short, long)]
        audience: String,

        /// Scope the token must carry (space-delimited)
        #[arg(short, long, default_value = "")]
        scope: String,
    },
}

#[derive(Args)]
pub struct ExchangeArgs {
    /// Subject token, or @path to read it from a file
    #[arg(long)]
    pub subject_token: String,

    /// Target audience
    #[arg(short, long)]
    pub audience: String,

    /// Requested scope (space-delimited); omit to keep the subject's scope
    #[arg(short, long)]
    pub scope: Option<String>,

    /// Actor token of the calling agent, or @path
    #[arg(long)]
    pub actor_token: Option<String>,

    /// Identity of the calling agent
    #[arg(long)]
    pub client_id: Option<String>,

    /// Pre-authorize this audience as the next hop
    #[arg(long, requires = "grant_scope")]
    pub grant_audience: Option<String>,

    /// Scope pre-authorized for the next hop
    #[arg(long, requires = "grant_audience")]
    pub grant_scope: Option<String>,

    /// Requested lifetime (e.g. "2m")
    #[arg(long, value_parser = parse_duration)]
    pub ttl: Option<Duration>,
}

fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let output = match cli.command {
        Commands::Exchange(args) => commands::execute_exchange(cli.config.as_deref(), args).await?,
        Commands::Inspect { token } => {
            commands::execute_inspect(cli.config.as_deref(), &token).await?
        }
        Commands::Verify {
            token,
            audience,
            scope,
        } => commands::execute_verify(cli.config.as_deref(), &token, &audience, &scope).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays machine-readable
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
