//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// RateLimiter - priority-queued API rate limiting
#[derive(Parser)]
#[command(
    name = "rl",
    about = "Priority-queued rate limiter with retry and backoff",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a synthetic workload through the limiter
    Simulate {
        /// Number of requests to schedule
        #[arg(short = 'n', long)]
        requests: Option<usize>,

        /// Max concurrently executing requests
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Requests allowed per window
        #[arg(long, requires = "interval_ms")]
        max_requests: Option<u64>,

        /// Window length in milliseconds
        #[arg(long, requires = "max_requests")]
        interval_ms: Option<u64>,

        /// Probability (0-1) that an attempt fails with a retryable status
        #[arg(long)]
        failure_rate: Option<f64>,

        /// Max retries per request
        #[arg(long)]
        max_retries: Option<u32>,

        /// Don't print events as they happen
        #[arg(short, long)]
        quiet: bool,

        /// Output format for the final stats
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

/// Output format for simulation stats
#[derive(Clone, Debug, Default, PartialEq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
