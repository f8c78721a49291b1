//! Results and statistics reported by the limiter

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of a successfully executed request
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResult<T> {
    pub value: T,

    /// Time spent waiting in the queue
    pub queue_time: Duration,

    /// Time spent executing, including retries and backoff
    pub execution_time: Duration,

    /// Retries consumed before success
    pub retries: u32,
}

impl<T> ScheduleResult<T> {
    /// Convert the value while keeping the timings
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScheduleResult<U> {
        ScheduleResult {
            value: f(self.value),
            queue_time: self.queue_time,
            execution_time: self.execution_time,
            retries: self.retries,
        }
    }
}

/// Snapshot of limiter statistics
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub queue_size: usize,
    pub active: usize,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub total_retries: u64,
    pub total_rate_limited: u64,
    pub total_expired: u64,
    pub avg_queue_time_ms: f64,
    pub avg_execution_time_ms: f64,
    pub peak_concurrent: usize,
    pub peak_queue_depth: usize,
}

/// Cumulative counters behind [`RateLimiterStats`]
#[derive(Debug, Default, Clone)]
pub(crate) struct StatsTracker {
    pub total_processed: u64,
    pub total_rejected: u64,
    pub total_retries: u64,
    pub total_rate_limited: u64,
    pub total_expired: u64,
    pub peak_concurrent: usize,
    pub peak_queue_depth: usize,
    avg_queue_time_ms: f64,
    avg_execution_time_ms: f64,
    queue_samples: u64,
    execution_samples: u64,
}

impl StatsTracker {
    /// Fold a queue wait into the running average
    pub fn record_queue_time(&mut self, queue_time: Duration) {
        self.queue_samples += 1;
        self.avg_queue_time_ms = running_average(self.avg_queue_time_ms, queue_time, self.queue_samples);
    }

    /// Fold an execution into the running average and count it as processed
    pub fn record_processed(&mut self, execution_time: Duration) {
        self.total_processed += 1;
        self.execution_samples += 1;
        self.avg_execution_time_ms =
            running_average(self.avg_execution_time_ms, execution_time, self.execution_samples);
    }

    pub fn observe_concurrency(&mut self, active: usize) {
        self.peak_concurrent = self.peak_concurrent.max(active);
    }

    pub fn observe_queue_depth(&mut self, depth: usize) {
        self.peak_queue_depth = self.peak_queue_depth.max(depth);
    }

    pub fn snapshot(&self, queue_size: usize, active: usize) -> RateLimiterStats {
        RateLimiterStats {
            queue_size,
            active,
            total_processed: self.total_processed,
            total_rejected: self.total_rejected,
            total_retries: self.total_retries,
            total_rate_limited: self.total_rate_limited,
            total_expired: self.total_expired,
            avg_queue_time_ms: self.avg_queue_time_ms,
            avg_execution_time_ms: self.avg_execution_time_ms,
            peak_concurrent: self.peak_concurrent,
            peak_queue_depth: self.peak_queue_depth,
        }
    }
}

fn running_average(avg: f64, sample: Duration, count: u64) -> f64 {
    let sample_ms = sample.as_secs_f64() * 1000.0;
    avg + (sample_ms - avg) / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_averages() {
        let mut tracker = StatsTracker::default();
        tracker.record_queue_time(Duration::from_millis(100));
        tracker.record_queue_time(Duration::from_millis(300));
        tracker.record_processed(Duration::from_millis(50));

        let stats = tracker.snapshot(4, 1);
        assert_eq!(stats.queue_size, 4);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total_processed, 1);
        assert!((stats.avg_queue_time_ms - 200.0).abs() < 1e-9);
        assert!((stats.avg_execution_time_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_peaks() {
        let mut tracker = StatsTracker::default();
        tracker.observe_concurrency(2);
        tracker.observe_concurrency(1);
        tracker.observe_queue_depth(7);
        tracker.observe_queue_depth(3);

        let stats = tracker.snapshot(0, 0);
        assert_eq!(stats.peak_concurrent, 2);
        assert_eq!(stats.peak_queue_depth, 7);
    }

    #[test]
    fn test_schedule_result_map() {
        let result = ScheduleResult {
            value: 21,
            queue_time: Duration::from_millis(5),
            execution_time: Duration::from_millis(7),
            retries: 1,
        };
        let doubled = result.map(|v| v * 2);
        assert_eq!(doubled.value, 42);
        assert_eq!(doubled.retries, 1);
        assert_eq!(doubled.queue_time, Duration::from_millis(5));
    }
}
