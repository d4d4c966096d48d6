//! Telemetry channel to the orchestrator.
//!
//! Events are queued on a bounded channel and delivered in order by a
//! background task, so callers never wait on telemetry. Each delivery follows
//! a fixed retry schedule on timeouts and server errors. An authorization
//! failure (401/422) opens the circuit for the rest of the run: it is logged
//! once and every later event is dropped silently.
//!
//! ```text
//! send() --try_send--> [queue] --> delivery task --deliver()--> transport
//!                                     |  5xx/timeout: sleep 1s,3s,10s,30s,30s
//!                                     |  401/422: disable, log once
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics::RunStatus;
use crate::traits::CallbackTransport;
use crate::util::lock_or_recover;

/// Typed callback events. Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallbackEvent {
    PhaseStarted {
        phase: String,
    },
    PhaseProgress {
        phase: String,
        processed: u64,
        total: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<serde_json::Value>,
    },
    TotalUrls {
        total: u64,
    },
    Log {
        level: String,
        message: String,
    },
    Finish {
        status: RunStatus,
        summary: serde_json::Value,
    },
}

impl CallbackEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CallbackEvent::PhaseStarted { .. } => "phase_started",
            CallbackEvent::PhaseProgress { .. } => "phase_progress",
            CallbackEvent::TotalUrls { .. } => "total_urls",
            CallbackEvent::Log { .. } => "log",
            CallbackEvent::Finish { .. } => "finish",
        }
    }
}

/// What goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub session_id: String,
    pub token: String,
    pub timestamp: i64,
    /// `{session}:{type}:{seq}`; the receiver's idempotency key.
    pub event_id: String,
    #[serde(flatten)]
    pub event: CallbackEvent,
}

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Sleep before each retry; its length bounds the attempts.
    pub retry_schedule: Vec<Duration>,
    pub progress_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            retry_schedule: [1, 3, 10, 30, 30].map(Duration::from_secs).to_vec(),
            progress_interval: Duration::from_secs(20),
            queue_capacity: 256,
        }
    }
}

impl CallbackConfig {
    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

struct ChannelInner {
    session_id: String,
    token: String,
    progress_interval: Duration,
    tx: Mutex<Option<mpsc::Sender<CallbackEnvelope>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
    disabled: Arc<AtomicBool>,
    last_progress: Mutex<Option<Instant>>,
}

/// Cheaply cloneable handle to the run's callback channel.
#[derive(Clone, Default)]
pub struct CallbackChannel {
    inner: Option<Arc<ChannelInner>>,
}

impl CallbackChannel {
    /// A channel that drops everything (no session or no callback URL).
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn<T: CallbackTransport + 'static>(
        transport: T,
        session_id: impl Into<String>,
        token: impl Into<String>,
        config: CallbackConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let disabled = Arc::new(AtomicBool::new(false));
        let delivery = tokio::spawn(run_delivery(
            transport,
            rx,
            config.retry_schedule.clone(),
            disabled.clone(),
        ));
        Self {
            inner: Some(Arc::new(ChannelInner {
                session_id: session_id.into(),
                token: token.into(),
                progress_interval: config.progress_interval,
                tx: Mutex::new(Some(tx)),
                delivery: Mutex::new(Some(delivery)),
                seq: AtomicU64::new(0),
                disabled,
                last_progress: Mutex::new(None),
            })),
        }
    }

    /// True once the circuit is open (or the channel was never enabled).
    pub fn is_disabled(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|inner| inner.disabled.load(Ordering::Relaxed))
    }

    /// Queue an event. Never blocks and never fails.
    pub fn send(&self, event: CallbackEvent) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.disabled.load(Ordering::Relaxed) {
            return;
        }
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = CallbackEnvelope {
            session_id: inner.session_id.clone(),
            token: inner.token.clone(),
            timestamp: Utc::now().timestamp(),
            event_id: format!("{}:{}:{}", inner.session_id, event.kind(), seq),
            event,
        };
        let tx = lock_or_recover(&inner.tx, "callback.tx");
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(envelope) {
            tracing::warn!(error = %e, "Callback queue full or closed, event dropped");
        }
    }

    /// Throttled progress. Always emitted when forced, at zero and at
    /// completion.
    pub fn send_progress(
        &self,
        phase: &str,
        processed: u64,
        total: u64,
        extra: Option<serde_json::Value>,
        force: bool,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };
        let force = force || processed == 0 || processed >= total;
        {
            let mut last = lock_or_recover(&inner.last_progress, "callback.last_progress");
            let now = Instant::now();
            if !force && last.is_some_and(|t| now.duration_since(t) < inner.progress_interval) {
                return;
            }
            *last = Some(now);
        }
        self.send(CallbackEvent::PhaseProgress {
            phase: phase.to_string(),
            processed: processed.min(total),
            total,
            extra,
        });
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.send(CallbackEvent::Log {
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Stop accepting events and wait until the queue is delivered.
    pub async fn close(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        lock_or_recover(&inner.tx, "callback.tx").take();
        let delivery = lock_or_recover(&inner.delivery, "callback.delivery").take();
        if let Some(handle) = delivery
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Callback delivery task ended abnormally");
        }
    }
}

async fn run_delivery<T: CallbackTransport>(
    transport: T,
    mut rx: mpsc::Receiver<CallbackEnvelope>,
    schedule: Vec<Duration>,
    disabled: Arc<AtomicBool>,
) {
    while let Some(envelope) = rx.recv().await {
        if disabled.load(Ordering::Relaxed) {
            continue;
        }
        deliver_with_retry(&transport, &envelope, &schedule, &disabled).await;
    }
}

async fn deliver_with_retry<T: CallbackTransport>(
    transport: &T,
    envelope: &CallbackEnvelope,
    schedule: &[Duration],
    disabled: &AtomicBool,
) {
    let attempts = schedule.len().max(1);
    for attempt in 1..=attempts {
        match transport.deliver(envelope).await {
            Ok(()) => return,
            Err(e) if e.is_auth_failure() => {
                if !disabled.swap(true, Ordering::Relaxed) {
                    tracing::error!(
                        event_id = %envelope.event_id,
                        error = %e,
                        "Callback rejected, callbacks disabled for this run"
                    );
                }
                return;
            }
            Err(e) if e.is_retryable() => {
                if attempt < attempts {
                    let delay = schedule.get(attempt - 1).copied().unwrap_or_default();
                    tracing::debug!(
                        event_id = %envelope.event_id,
                        attempt,
                        error = %e,
                        "Callback failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "Callback retries exhausted, callbacks disabled for this run"
                );
                disabled.store(true, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!(event_id = %envelope.event_id, error = %e, "Callback failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::testutil::MockTransport;

    fn status(status: u16) -> AppError {
        AppError::HttpStatus {
            status,
            message: String::new(),
        }
    }

    fn channel(transport: MockTransport) -> CallbackChannel {
        CallbackChannel::spawn(transport, "77", "secret", CallbackConfig::default())
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = CallbackEnvelope {
            session_id: "77".into(),
            token: "t".into(),
            timestamp: 1,
            event_id: "77:total_urls:3".into(),
            event: CallbackEvent::TotalUrls { total: 20 },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "total_urls");
        assert_eq!(value["payload"]["total"], 20);
        assert_eq!(value["event_id"], "77:total_urls:3");
        assert_eq!(value["session_id"], "77");
    }

    #[tokio::test(start_paused = true)]
    async fn event_ids_increase_monotonically() {
        let transport = MockTransport::new();
        let channel = channel(transport.clone());
        channel.send(CallbackEvent::PhaseStarted {
            phase: "parse".into(),
        });
        channel.send(CallbackEvent::TotalUrls { total: 5 });
        channel.log("info", "hello");
        channel.close().await;

        let ids: Vec<String> = transport.delivered().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["77:phase_started:1", "77:total_urls:2", "77:log:3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let transport = MockTransport::with_responses(vec![Err(status(503)), Err(status(500))]);
        let channel = channel(transport.clone());
        channel.send(CallbackEvent::TotalUrls { total: 1 });
        channel.close().await;

        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.delivered().len(), 1);
        assert!(!channel.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_opens_circuit() {
        let transport = MockTransport::with_responses(vec![Err(status(401))]);
        let channel = channel(transport.clone());
        channel.send(CallbackEvent::TotalUrls { total: 1 });
        channel.send(CallbackEvent::TotalUrls { total: 2 });
        channel.close().await;

        assert_eq!(transport.attempts(), 1);
        assert!(transport.delivered().is_empty());
        assert!(channel.is_disabled());
        channel.send(CallbackEvent::TotalUrls { total: 3 });
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_disable_channel() {
        let transport = MockTransport::with_responses((0..5).map(|_| Err(status(502))).collect());
        let channel = channel(transport.clone());
        channel.send(CallbackEvent::TotalUrls { total: 1 });
        channel.close().await;
        assert_eq!(transport.attempts(), 5);
        assert!(channel.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let transport = MockTransport::with_responses(vec![Err(status(400))]);
        let channel = channel(transport.clone());
        channel.send(CallbackEvent::TotalUrls { total: 1 });
        channel.send(CallbackEvent::TotalUrls { total: 2 });
        channel.close().await;
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.delivered().len(), 1);
        assert!(!channel.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_throttled_unless_forced() {
        let transport = MockTransport::new();
        let channel = channel(transport.clone());
        channel.send_progress("parse", 0, 10, None, false);
        channel.send_progress("parse", 3, 10, None, false);
        channel.send_progress("parse", 4, 10, None, true);
        tokio::time::advance(Duration::from_secs(21)).await;
        channel.send_progress("parse", 6, 10, None, false);
        channel.send_progress("parse", 10, 10, None, false);
        channel.close().await;

        let processed: Vec<u64> = transport
            .delivered()
            .into_iter()
            .filter_map(|e| match e.event {
                CallbackEvent::PhaseProgress { processed, .. } => Some(processed),
                _ => None,
            })
            .collect();
        assert_eq!(processed, vec![0, 4, 6, 10]);
    }

    #[tokio::test]
    async fn disabled_channel_is_a_no_op() {
        let channel = CallbackChannel::disabled();
        assert!(channel.is_disabled());
        channel.send(CallbackEvent::TotalUrls { total: 1 });
        channel.close().await;
    }
}
