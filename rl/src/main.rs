//! RateLimiter CLI
//!
//! Runs synthetic workloads through a limiter and inspects configuration.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use ratelimiter::cli::{Cli, Command, OutputFormat};
use ratelimiter::config::Config;
use ratelimiter::events::LimiterEvent;
use ratelimiter::limiter::{RateLimiter, StaticRateLimitConfig};
use ratelimiter::simulate::{self, SimulationReport};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (WARN)
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to WARN", s);
                tracing::Level::WARN
            }
        },
        None => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Simulate {
            requests,
            concurrency,
            max_requests,
            interval_ms,
            failure_rate,
            max_retries,
            quiet,
            format,
        }) => {
            let mut config = config;
            if let Some(n) = requests {
                config.simulation.requests = n;
            }
            if let Some(j) = concurrency {
                config.limiter.max_concurrent = j;
            }
            if let (Some(max_requests), Some(interval_ms)) = (max_requests, interval_ms) {
                config.limiter.static_limit = Some(StaticRateLimitConfig {
                    max_requests,
                    interval_ms,
                });
            }
            if let Some(rate) = failure_rate {
                config.simulation.failure_rate = rate;
            }
            if let Some(retries) = max_retries {
                config.limiter.retry.max_retries = retries;
            }
            cmd_simulate(&config, quiet, format).await
        }
        Some(Command::Config) => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
        None => {
            debug!("main: no command specified, printing config");
            cmd_config(&config)
        }
    }
}

/// Run a synthetic workload and print the outcome
async fn cmd_simulate(config: &Config, quiet: bool, format: OutputFormat) -> Result<()> {
    debug!(quiet, ?format, "cmd_simulate: called");
    config.validate().context("Invalid configuration")?;

    let settings = &config.limiter;
    let limiter = RateLimiter::with_store(settings.to_limiter_config(), settings.build_store());

    // Events go to stdout only in text mode so JSON output stays parseable
    let subscription = if !quiet && format == OutputFormat::Text {
        Some(limiter.on(|event| {
            println!("{}", format_event(event));
            Ok(())
        }))
    } else {
        None
    };

    let report = simulate::run(&limiter, &config.simulation).await;

    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }
    limiter.destroy().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

/// Print the effective configuration as YAML
fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(id.len().saturating_sub(8)..).unwrap_or(id)
}

fn format_event(event: &LimiterEvent) -> String {
    let label = format!("{:<18}", event.event_type());
    match event {
        LimiterEvent::RateLimited { wait_ms, queue_size, .. } => {
            format!("{} wait={}ms queued={}", label.yellow(), wait_ms, queue_size)
        }
        LimiterEvent::RequestQueued {
            request_id,
            priority,
            queue_size,
            ..
        } => format!(
            "{} {} priority={} queued={}",
            label.dimmed(),
            short_id(request_id),
            priority,
            queue_size
        ),
        LimiterEvent::RequestStarted {
            request_id,
            queue_time_ms,
            active,
            ..
        } => format!(
            "{} {} waited={}ms active={}",
            label.cyan(),
            short_id(request_id),
            queue_time_ms,
            active
        ),
        LimiterEvent::RequestCompleted {
            request_id,
            execution_time_ms,
            retries,
            ..
        } => format!(
            "{} {} took={}ms retries={}",
            label.green(),
            short_id(request_id),
            execution_time_ms,
            retries
        ),
        LimiterEvent::RequestFailed {
            request_id,
            error,
            attempts,
            ..
        } => format!(
            "{} {} attempts={} {}",
            label.red().bold(),
            short_id(request_id),
            attempts,
            error
        ),
        LimiterEvent::RequestRequeued {
            request_id,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "{} {} attempt={} backoff={}ms {}",
            label.magenta(),
            short_id(request_id),
            attempt,
            delay_ms,
            error
        ),
        LimiterEvent::RequestExpired { request_id, .. } => {
            format!("{} {}", label.red(), short_id(request_id))
        }
        LimiterEvent::Error { context, message, .. } => {
            format!("{} {}: {}", label.red().bold(), context, message)
        }
    }
}

fn print_report(report: &SimulationReport) {
    let stats = &report.stats;
    println!();
    println!("{}", "Simulation Summary".bold());
    println!("------------------");
    println!("Requests:   {}", report.requests);
    println!("  Succeeded: {}", report.succeeded.to_string().green());
    println!("  Failed:    {}", report.failed.to_string().red());
    println!("  Expired:   {}", report.expired);
    println!("  Rejected:  {}", report.rejected);
    println!("Elapsed:    {}ms", report.elapsed_ms);
    println!();
    println!("Total processed:    {}", stats.total_processed);
    println!("Total rejected:     {}", stats.total_rejected);
    println!("Total retries:      {}", stats.total_retries);
    println!("Times rate limited: {}", stats.total_rate_limited);
    println!("Avg queue time:     {:.1}ms", stats.avg_queue_time_ms);
    println!("Avg execution time: {:.1}ms", stats.avg_execution_time_ms);
    println!("Peak concurrency:   {}", stats.peak_concurrent);
    println!("Peak queue depth:   {}", stats.peak_queue_depth);
}
