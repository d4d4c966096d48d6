use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::backoff::{AdaptiveBackoff, Adjustment, BackoffConfig, timeout_ratio};
use crate::callback::{CallbackChannel, CallbackEvent};
use crate::context::{ContextPool, RunContext};
use crate::error::{AppError, ErrorCode, ExtractError};
use crate::metrics::{RunStatus, RunSummary, WorkerMetrics};
use crate::models::ProductRecord;
use crate::task::{ResultStatus, UrlResult, UrlTask, WorkerConfig};
use crate::traits::{Extractor, TaskStore};
use crate::util::lock_or_recover;

/// Failure reason of a strict run whose first claim came back empty.
pub const EMPTY_FIRST_CLAIM: &str = "FULL_SCAN_RESET_DID_NOT_CREATE_PENDING";

const PHASE: &str = "parsing";

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Claiming {
        batch: u32,
    },
    EmptyClaim {
        streak: u32,
        limit: u32,
    },
    BatchClaimed {
        batch: u32,
        count: usize,
    },
    TaskStarted {
        task_id: u64,
        url: &'a str,
    },
    TaskCompleted {
        task_id: u64,
        status: ResultStatus,
    },
    TaskFailed {
        task_id: u64,
        url: &'a str,
        code: ErrorCode,
        error: &'a str,
    },
    Saved {
        count: usize,
    },
    SaveFailed {
        count: usize,
        error: &'a str,
    },
    BatchFinished {
        batch: u32,
        timeout_ratio: f64,
        dynamic_delay: Duration,
        adjustment: Adjustment,
    },
    ShuttingDown {
        worker_id: &'a str,
        released: bool,
    },
    Stopped {
        worker_id: &'a str,
        summary: &'a RunSummary,
    },
}

impl WorkerEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Claiming { .. } => "claiming",
            WorkerEvent::EmptyClaim { .. } => "empty_claim",
            WorkerEvent::BatchClaimed { .. } => "batch_claimed",
            WorkerEvent::TaskStarted { .. } => "task_started",
            WorkerEvent::TaskCompleted { .. } => "task_completed",
            WorkerEvent::TaskFailed { .. } => "task_failed",
            WorkerEvent::Saved { .. } => "saved",
            WorkerEvent::SaveFailed { .. } => "save_failed",
            WorkerEvent::BatchFinished { .. } => "batch_finished",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Claiming { batch } => {
                tracing::debug!(batch, "Claiming batch");
            }
            WorkerEvent::EmptyClaim { streak, limit } => {
                tracing::info!(streak, limit, "Empty claim");
            }
            WorkerEvent::BatchClaimed { batch, count } => {
                tracing::info!(batch, count, "Batch claimed");
            }
            WorkerEvent::TaskStarted { task_id, url } => {
                tracing::debug!(task_id, %url, "Processing task");
            }
            WorkerEvent::TaskCompleted { task_id, status } => {
                tracing::debug!(task_id, %status, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                url,
                code,
                error,
            } => {
                tracing::warn!(task_id, %url, %code, %error, "Task failed");
            }
            WorkerEvent::Saved { count } => {
                tracing::info!(count, "Materials saved");
            }
            WorkerEvent::SaveFailed { count, error } => {
                tracing::error!(count, %error, "Batch save failed");
            }
            WorkerEvent::BatchFinished {
                batch,
                timeout_ratio,
                dynamic_delay,
                adjustment,
            } => {
                tracing::info!(
                    batch,
                    timeout_ratio,
                    dynamic_delay_ms = dynamic_delay.as_millis() as u64,
                    ?adjustment,
                    "Batch finished"
                );
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                released,
            } => {
                tracing::info!(%worker_id, %released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id, summary } => {
                tracing::info!(
                    %worker_id,
                    status = %summary.status,
                    processed = summary.total_processed,
                    successful = summary.successful,
                    failed = summary.failed,
                    blocked = summary.blocked,
                    "Worker stopped"
                );
            }
        }
    }
}

/// State shared by the tasks of one run.
struct Shared<S, E> {
    store: S,
    pool: ContextPool<E>,
    ctx: RunContext,
    callbacks: CallbackChannel,
    config: WorkerConfig,
    queue: Mutex<VecDeque<UrlTask>>,
    buffer: Mutex<Vec<UrlResult>>,
    metrics: Mutex<WorkerMetrics>,
}

/// Claim-process-report worker over a fixed pool of execution contexts.
pub struct QueueWorker<S, E>
where
    S: TaskStore,
    E: Extractor,
{
    store: S,
    pool: ContextPool<E>,
    config: WorkerConfig,
    backoff: BackoffConfig,
}

impl<S, E> QueueWorker<S, E>
where
    S: TaskStore + 'static,
    E: Extractor + 'static,
{
    /// Build a worker. Fails on an invalid config or a pool that does not
    /// match the configured concurrency.
    pub fn new(store: S, pool: ContextPool<E>, config: WorkerConfig) -> Result<Self, AppError> {
        config.validate()?;
        if pool.len() != config.concurrency {
            return Err(AppError::ConfigError(format!(
                "context pool holds {} contexts, concurrency is {}",
                pool.len(),
                config.concurrency
            )));
        }
        Ok(Self {
            store,
            pool,
            config,
            backoff: BackoffConfig::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run claim/process/report cycles until the queue is exhausted, the
    /// batch cap is hit, or the run halts. Returns the run summary, which
    /// has also been sent as the `finish` event.
    pub async fn run<R>(
        &self,
        ctx: &RunContext,
        callbacks: &CallbackChannel,
        reporter: &R,
    ) -> RunSummary
    where
        R: WorkerReporter + Clone + 'static,
    {
        let started = Instant::now();
        let shared = Arc::new(Shared {
            store: self.store.clone(),
            pool: self.pool.clone(),
            ctx: ctx.clone(),
            callbacks: callbacks.clone(),
            config: self.config.clone(),
            queue: Mutex::new(VecDeque::new()),
            buffer: Mutex::new(Vec::new()),
            metrics: Mutex::new(WorkerMetrics::default()),
        });
        let mut backoff = AdaptiveBackoff::new(self.backoff.clone());
        let mut empty_streak = 0u32;
        let mut first_claim = true;
        let mut strict_failure = false;

        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });
        callbacks.send(CallbackEvent::PhaseStarted {
            phase: PHASE.into(),
        });

        loop {
            if ctx.is_halted() {
                break;
            }
            let batches = lock_or_recover(&shared.metrics, "worker.metrics").batches;
            if let Some(max) = self.config.max_batches
                && batches >= max
            {
                tracing::info!(max_batches = max, "Batch cap reached");
                break;
            }

            reporter.report(WorkerEvent::Claiming { batch: batches + 1 });
            let tasks = match self.store.claim(&self.config.claim_request()).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim batch");
                    Vec::new()
                }
            };

            if tasks.is_empty() {
                if first_claim && self.config.strict {
                    tracing::error!(reason = EMPTY_FIRST_CLAIM, "Strict run has no pending work");
                    callbacks.log("error", EMPTY_FIRST_CLAIM);
                    strict_failure = true;
                    break;
                }
                first_claim = false;
                empty_streak += 1;
                reporter.report(WorkerEvent::EmptyClaim {
                    streak: empty_streak,
                    limit: self.config.max_empty_claims,
                });
                if empty_streak >= self.config.max_empty_claims {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(self.config.empty_claim_delay) => {}
                    () = ctx.halt_token().cancelled() => break,
                }
                continue;
            }

            first_claim = false;
            empty_streak = 0;
            self.process_batch(&shared, tasks, &mut backoff, reporter)
                .await;
        }

        let failure = ctx.failure();
        let interrupted = ctx.is_interrupted();
        let released = if failure.is_some() || interrupted {
            match self.store.release(&self.config.worker_id).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to release claimed tasks");
                    false
                }
            }
        } else {
            false
        };
        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            released,
        });

        let metrics = lock_or_recover(&shared.metrics, "worker.metrics").clone();
        let (status, reason) = if let Some(reason) = failure {
            (RunStatus::Failed, Some(reason))
        } else if strict_failure {
            (RunStatus::Failed, Some(EMPTY_FIRST_CLAIM.to_string()))
        } else if interrupted {
            (RunStatus::Failed, Some("INTERRUPTED".to_string()))
        } else if metrics.claimed_total == 0 {
            (RunStatus::NoWork, None)
        } else {
            (RunStatus::Completed, None)
        };
        let summary = metrics.summary(
            status,
            started.elapsed(),
            ctx.rate_limiter().dynamic_delay(),
            reason,
        );

        callbacks.send(CallbackEvent::Finish {
            status,
            summary: serde_json::to_value(&summary).unwrap_or_default(),
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
            summary: &summary,
        });
        summary
    }

    async fn process_batch<R>(
        &self,
        shared: &Arc<Shared<S, E>>,
        tasks: Vec<UrlTask>,
        backoff: &mut AdaptiveBackoff,
        reporter: &R,
    ) where
        R: WorkerReporter + Clone + 'static,
    {
        let claimed = tasks.len();
        let (batch, claimed_total, processed_total) = {
            let mut metrics = lock_or_recover(&shared.metrics, "worker.metrics");
            metrics.start_batch(claimed);
            (metrics.batches + 1, metrics.claimed_total, metrics.total_processed)
        };
        reporter.report(WorkerEvent::BatchClaimed {
            batch,
            count: claimed,
        });
        shared.callbacks.send(CallbackEvent::TotalUrls {
            total: claimed_total,
        });
        shared
            .callbacks
            .send_progress(PHASE, processed_total, claimed_total, None, true);

        lock_or_recover(&shared.queue, "worker.queue").extend(tasks);

        let mut set = JoinSet::new();
        for _ in 0..self.config.concurrency.min(claimed) {
            let shared = Arc::clone(shared);
            let reporter = reporter.clone();
            set.spawn(async move { run_tasks(shared, reporter).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task aborted");
                lock_or_recover(&shared.metrics, "worker.metrics").record_internal_error();
                shared.ctx.fail_fast(format!("INTERNAL_RUNTIME_ERROR: {e}"));
            }
        }
        lock_or_recover(&shared.queue, "worker.queue").clear();

        if shared.ctx.failure().is_some() {
            return;
        }
        flush_buffer(shared, true, reporter).await;

        let (counters, processed_total, claimed_total) = {
            let mut metrics = lock_or_recover(&shared.metrics, "worker.metrics");
            metrics.batches += 1;
            (metrics.batch, metrics.total_processed, metrics.claimed_total)
        };
        shared
            .callbacks
            .send_progress(PHASE, processed_total, claimed_total, None, true);

        let ratio = timeout_ratio(counters.timeouts, counters.claimed);
        let adjustment = backoff.observe(ratio);
        shared.ctx.rate_limiter().set_dynamic_delay(backoff.delay());
        reporter.report(WorkerEvent::BatchFinished {
            batch,
            timeout_ratio: ratio,
            dynamic_delay: backoff.delay(),
            adjustment,
        });
    }
}

/// Pull tasks from the local queue until it is empty or the run halts.
async fn run_tasks<S, E, R>(shared: Arc<Shared<S, E>>, reporter: R)
where
    S: TaskStore,
    E: Extractor,
    R: WorkerReporter,
{
    loop {
        if shared.ctx.is_halted() {
            break;
        }
        let Some(task) = lock_or_recover(&shared.queue, "worker.queue").pop_front() else {
            break;
        };
        process_task(&shared, &task, &reporter).await;
    }
}

async fn process_task<S, E, R>(shared: &Shared<S, E>, task: &UrlTask, reporter: &R)
where
    S: TaskStore,
    E: Extractor,
    R: WorkerReporter,
{
    let mut slot = match shared.pool.checkout().await {
        Ok(slot) => slot,
        Err(e) => {
            escalate(shared, &format!("context checkout failed: {e}"));
            return;
        }
    };
    let _permit = match shared.ctx.rate_limiter().acquire(&task.url).await {
        Ok(permit) => permit,
        Err(e) => {
            escalate(shared, &format!("rate limiter closed: {e}"));
            return;
        }
    };
    reporter.report(WorkerEvent::TaskStarted {
        task_id: task.id,
        url: &task.url,
    });

    let started = Instant::now();
    let outcome = extract_with_retry(
        &mut *slot,
        &task.url,
        shared.config.nav_timeout,
        shared.config.nav_retries,
    )
    .await;
    let page = slot.take_metrics();
    lock_or_recover(&shared.metrics, "worker.metrics").record_page(page, started.elapsed());

    match outcome {
        Err(e) if e.is_environment_failure() => {
            escalate(shared, &e.to_string());
        }
        Err(e) => {
            let result = UrlResult::from_error(task, &e);
            lock_or_recover(&shared.metrics, "worker.metrics").record_outcome(&result);
            reporter.report(WorkerEvent::TaskFailed {
                task_id: task.id,
                url: &task.url,
                code: e.code(),
                error: &e.to_string(),
            });
            if let Err(report_err) = shared.store.report(&[result]).await {
                tracing::warn!(task_id = task.id, error = %report_err, "Failed to report result");
            }
        }
        Ok(record) => {
            let result = UrlResult::from_record(task, record);
            lock_or_recover(&shared.metrics, "worker.metrics").record_outcome(&result);
            reporter.report(WorkerEvent::TaskCompleted {
                task_id: task.id,
                status: result.status,
            });
            let buffered = {
                let mut buffer = lock_or_recover(&shared.buffer, "worker.buffer");
                buffer.push(result);
                buffer.len()
            };
            if buffered >= shared.config.flush_threshold {
                flush_buffer(shared, false, reporter).await;
            }
        }
    }

    let (processed, claimed) = {
        let metrics = lock_or_recover(&shared.metrics, "worker.metrics");
        (metrics.total_processed, metrics.claimed_total)
    };
    shared
        .callbacks
        .send_progress(PHASE, processed, claimed, None, false);
}

/// Extract with a bounded number of extra attempts, spent on timeouts only.
async fn extract_with_retry<E: Extractor>(
    extractor: &mut E,
    url: &str,
    timeout: Duration,
    retries: u32,
) -> Result<ProductRecord, ExtractError> {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, extractor.extract(url, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExtractError::NavTimeout(timeout_ms)),
        };
        match outcome {
            Err(e) if e.is_timeout() && attempt < retries => {
                attempt += 1;
                tracing::warn!(%url, attempt, "Navigation timed out, retrying");
            }
            other => return other,
        }
    }
}

/// Save buffered records. A non-forced flush takes exactly one threshold's
/// worth; a forced flush takes everything.
async fn flush_buffer<S, E, R>(shared: &Shared<S, E>, force: bool, reporter: &R)
where
    S: TaskStore,
    E: Extractor,
    R: WorkerReporter,
{
    let items: Vec<UrlResult> = {
        let mut buffer = lock_or_recover(&shared.buffer, "worker.buffer");
        let threshold = shared.config.flush_threshold;
        if buffer.is_empty() || (!force && buffer.len() < threshold) {
            return;
        }
        let take = if force {
            buffer.len()
        } else {
            threshold.min(buffer.len())
        };
        buffer.drain(..take).collect()
    };
    let records: Vec<ProductRecord> = items.iter().filter_map(|r| r.record.clone()).collect();

    match shared.store.save_materials(&records).await {
        Ok(summary) => {
            if summary.failed > 0 {
                tracing::warn!(
                    success = summary.success,
                    failed = summary.failed,
                    "Store rejected part of the batch"
                );
            }
            let done = items
                .iter()
                .filter(|r| r.status == ResultStatus::Done)
                .count();
            lock_or_recover(&shared.metrics, "worker.metrics").record_saved(done);
            reporter.report(WorkerEvent::Saved {
                count: records.len(),
            });
            let reports: Vec<UrlResult> = items.iter().map(UrlResult::to_report).collect();
            if let Err(e) = shared.store.report(&reports).await {
                tracing::warn!(count = reports.len(), error = %e, "Failed to report saved results");
            }
        }
        Err(e) => {
            let message = format!("Batch save failed: {e}");
            reporter.report(WorkerEvent::SaveFailed {
                count: items.len(),
                error: &message,
            });
            lock_or_recover(&shared.metrics, "worker.metrics").record_save_failure(items.len());
            let reports: Vec<UrlResult> = items.iter().map(|r| r.save_error(&message)).collect();
            if let Err(report_err) = shared.store.report(&reports).await {
                tracing::warn!(error = %report_err, "Failed to report save errors");
            }
            shared
                .callbacks
                .log("error", format!("{}: {message}", ErrorCode::SaveError));
            shared.ctx.fail_fast(ErrorCode::SaveError.as_str());
        }
    }
}

fn escalate<S, E>(shared: &Shared<S, E>, detail: &str) {
    lock_or_recover(&shared.metrics, "worker.metrics").record_internal_error();
    shared
        .callbacks
        .log("error", format!("INTERNAL_RUNTIME_ERROR: {detail}"));
    shared
        .ctx
        .fail_fast(format!("INTERNAL_RUNTIME_ERROR: {detail}"));
}
