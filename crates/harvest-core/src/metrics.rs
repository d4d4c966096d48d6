use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::task::{ResultStatus, UrlResult};
use crate::traits::PageMetrics;

/// Terminal status of a run, as reported in the `finish` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    NoWork,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::NoWork => "no_work",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Linear-interpolated percentile; 0.0 for no samples.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (sorted.len() - 1) as f64 * p.clamp(0.0, 100.0) / 100.0;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

/// Counters for the batch currently being processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub claimed: usize,
    pub processed: usize,
    pub timeouts: usize,
}

/// Run-wide worker counters. Lives behind its own lock in the worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    pub batches: u32,
    pub claimed_total: u64,
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub blocked: u64,
    pub failed_by_code: BTreeMap<ErrorCode, u64>,
    pub internal_errors: u64,
    pub requests_blocked: u64,
    pub requests_allowed: u64,
    goto_ms: Vec<f64>,
    parse_ms: Vec<f64>,
    pub batch: BatchCounters,
}

impl WorkerMetrics {
    pub fn start_batch(&mut self, claimed: usize) {
        self.batch = BatchCounters {
            claimed,
            ..BatchCounters::default()
        };
        self.claimed_total += claimed as u64;
    }

    pub fn record_page(&mut self, page: PageMetrics, elapsed: Duration) {
        self.goto_ms
            .push(page.goto_ms.unwrap_or(elapsed.as_secs_f64() * 1000.0));
        if let Some(parse) = page.parse_ms {
            self.parse_ms.push(parse);
        }
        self.requests_blocked += page.requests_blocked;
        self.requests_allowed += page.requests_allowed;
    }

    /// Count one task outcome. Successful saves are counted separately in
    /// [`WorkerMetrics::record_saved`].
    pub fn record_outcome(&mut self, result: &UrlResult) {
        self.total_processed += 1;
        self.batch.processed += 1;
        match result.status {
            ResultStatus::Failed => self.failed += 1,
            ResultStatus::Blocked => self.blocked += 1,
            ResultStatus::Done => {}
        }
        if let Some(code) = result.error_code {
            *self.failed_by_code.entry(code).or_insert(0) += 1;
            if code == ErrorCode::NavTimeout {
                self.batch.timeouts += 1;
            }
        }
    }

    pub fn record_saved(&mut self, count: usize) {
        self.successful += count as u64;
    }

    pub fn record_save_failure(&mut self, count: usize) {
        *self.failed_by_code.entry(ErrorCode::SaveError).or_insert(0) += count as u64;
    }

    pub fn record_internal_error(&mut self) {
        self.internal_errors += 1;
    }

    pub fn summary(
        &self,
        status: RunStatus,
        elapsed: Duration,
        dynamic_delay: Duration,
        failure_reason: Option<String>,
    ) -> RunSummary {
        let wall_ms = elapsed.as_secs_f64() * 1000.0;
        let throughput = if wall_ms > 0.0 {
            self.total_processed as f64 / (wall_ms / 60_000.0)
        } else {
            0.0
        };
        let requests = (self.requests_blocked + self.requests_allowed).max(1);
        RunSummary {
            status,
            batches: self.batches,
            claimed_total: self.claimed_total,
            total_processed: self.total_processed,
            successful: self.successful,
            failed: self.failed,
            blocked: self.blocked,
            failed_by_code: self
                .failed_by_code
                .iter()
                .map(|(code, n)| (code.as_str().to_string(), *n))
                .collect(),
            goto_ms_p50: percentile(&self.goto_ms, 50.0),
            goto_ms_p95: percentile(&self.goto_ms, 95.0),
            parse_ms_p50: percentile(&self.parse_ms, 50.0),
            parse_ms_p95: percentile(&self.parse_ms, 95.0),
            wall_time_ms: wall_ms,
            throughput_urls_per_min: throughput,
            requests_blocked: self.requests_blocked,
            requests_allowed: self.requests_allowed,
            block_ratio: self.requests_blocked as f64 / requests as f64 * 100.0,
            internal_errors_count: self.internal_errors,
            dynamic_delay_ms: u64::try_from(dynamic_delay.as_millis()).unwrap_or(u64::MAX),
            failure_reason,
        }
    }
}

/// End-of-run worker report, logged and sent with the `finish` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub batches: u32,
    pub claimed_total: u64,
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub blocked: u64,
    pub failed_by_code: BTreeMap<String, u64>,
    pub goto_ms_p50: f64,
    pub goto_ms_p95: f64,
    pub parse_ms_p50: f64,
    pub parse_ms_p95: f64,
    pub wall_time_ms: f64,
    pub throughput_urls_per_min: f64,
    pub requests_blocked: u64,
    pub requests_allowed: u64,
    /// Percent of sub-resource requests that were blocked.
    pub block_ratio: f64,
    pub internal_errors_count: u64,
    pub dynamic_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::testutil::{make_test_record, make_test_task};

    #[test]
    fn percentile_interpolates() {
        let data = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&data, 50.0), 25.0);
        assert_eq!(percentile(&data, 0.0), 10.0);
        assert_eq!(percentile(&data, 100.0), 40.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.0], 95.0), 7.0);
    }

    #[test]
    fn outcomes_feed_batch_timeouts_and_codes() {
        let mut metrics = WorkerMetrics::default();
        metrics.start_batch(5);
        for id in 1..=5u64 {
            let task = make_test_task(id, &format!("https://shop.example/p/{id}"));
            let result = if id == 3 {
                UrlResult::from_error(&task, &ExtractError::NavTimeout(15_000))
            } else {
                UrlResult::from_record(&task, make_test_record(&task.url))
            };
            metrics.record_outcome(&result);
        }
        assert_eq!(metrics.batch.processed, 5);
        assert_eq!(metrics.batch.timeouts, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.failed_by_code.get(&ErrorCode::NavTimeout), Some(&1));
    }

    #[test]
    fn summary_reports_ratios() {
        let mut metrics = WorkerMetrics::default();
        metrics.record_page(
            PageMetrics {
                goto_ms: Some(100.0),
                parse_ms: Some(20.0),
                requests_blocked: 3,
                requests_allowed: 1,
            },
            Duration::from_millis(150),
        );
        metrics.record_page(PageMetrics::default(), Duration::from_millis(300));
        metrics.total_processed = 2;

        let summary = metrics.summary(
            RunStatus::Completed,
            Duration::from_secs(60),
            Duration::from_millis(300),
            None,
        );
        assert_eq!(summary.block_ratio, 75.0);
        assert_eq!(summary.goto_ms_p50, 200.0);
        assert_eq!(summary.parse_ms_p50, 20.0);
        assert_eq!(summary.throughput_urls_per_min, 2.0);
        assert_eq!(summary.dynamic_delay_ms, 300);

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], "completed");
        assert!(value.get("failure_reason").is_none());
    }
}
