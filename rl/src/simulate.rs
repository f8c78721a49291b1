//! Synthetic workloads for exercising a limiter from the CLI

use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{RateLimitError, WorkError};
use crate::limiter::{RateLimiter, RateLimiterStats, ScheduleOptions};

/// Status returned by simulated upstream failures
pub const SIMULATED_FAILURE_STATUS: u16 = 503;

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub rejected: usize,
    pub elapsed_ms: u64,
    pub stats: RateLimiterStats,
}

/// Schedule `config.requests` synthetic requests and wait for all of them
///
/// Each attempt sleeps for `work_ms` and then fails with a retryable status
/// with probability `failure_rate`. Priorities are drawn uniformly from
/// `0..=max_priority`.
pub async fn run(limiter: &RateLimiter, config: &SimulationConfig) -> SimulationReport {
    debug!(?config, "simulate::run: called");
    info!(requests = config.requests, limiter = %limiter.id(), "Starting simulation");

    let started = Instant::now();
    let work_time = Duration::from_millis(config.work_ms);
    let failure_rate = config.failure_rate;

    let mut handles = Vec::with_capacity(config.requests);
    let mut rejected = 0;
    for index in 0..config.requests {
        let priority = rand::rng().random_range(0..=config.max_priority);
        let mut options = ScheduleOptions::default()
            .with_priority(priority)
            .with_metadata("index", index);
        if let Some(ms) = config.deadline_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }

        let work = move || async move {
            tokio::time::sleep(work_time).await;
            if rand::rng().random_bool(failure_rate) {
                Err(WorkError::status(SIMULATED_FAILURE_STATUS, "simulated upstream failure"))
            } else {
                Ok(index)
            }
        };

        match limiter.submit(work, options) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                debug!(index, error = %e, "simulate::run: submit rejected");
                rejected += 1;
            }
        }
    }

    let mut report = SimulationReport {
        requests: config.requests,
        succeeded: 0,
        failed: 0,
        expired: 0,
        rejected,
        elapsed_ms: 0,
        stats: RateLimiterStats::default(),
    };

    for outcome in join_all(handles).await {
        match outcome {
            Ok(_) => report.succeeded += 1,
            Err(RateLimitError::Work(_)) => report.failed += 1,
            Err(RateLimitError::Expired { .. }) => report.expired += 1,
            Err(_) => report.rejected += 1,
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report.stats = limiter.stats();
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );
    report
}
