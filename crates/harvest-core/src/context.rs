//! Per-run shared state and execution contexts.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dedup::DedupIndex;
use crate::error::AppError;
use crate::rate_limit::{DomainRateLimiter, RateLimitConfig};
use crate::util::lock_or_recover;

/// How worker tasks are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Interleaved tasks on a single-threaded event loop.
    #[default]
    Cooperative,
    /// One OS thread per execution context.
    ThreadPool,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "cooperative" | "async" => Ok(ExecutionMode::Cooperative),
            "thread_pool" | "threads" => Ok(ExecutionMode::ThreadPool),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Fixed set of execution contexts (one extractor each) shared by the
/// worker tasks of a run.
pub struct ContextPool<E> {
    contexts: Arc<Vec<Arc<tokio::sync::Mutex<E>>>>,
    permits: Arc<Semaphore>,
}

impl<E> Clone for ContextPool<E> {
    fn clone(&self) -> Self {
        Self {
            contexts: self.contexts.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<E> ContextPool<E> {
    pub fn new(contexts: Vec<E>) -> Self {
        let permits = Arc::new(Semaphore::new(contexts.len()));
        Self {
            contexts: Arc::new(
                contexts
                    .into_iter()
                    .map(|c| Arc::new(tokio::sync::Mutex::new(c)))
                    .collect(),
            ),
            permits,
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Contexts currently idle in the pool.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for an idle context. It returns to the pool when the slot drops.
    pub async fn checkout(&self) -> Result<ContextSlot<E>, AppError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::ExtractorError(format!("Context pool closed: {e}")))?;
        // Holding a permit guarantees at least one unlocked context.
        let guard = self
            .contexts
            .iter()
            .find_map(|c| c.clone().try_lock_owned().ok())
            .ok_or_else(|| AppError::ExtractorError("No idle execution context".into()))?;
        Ok(ContextSlot {
            guard,
            _permit: permit,
        })
    }

    /// Check out every context, waiting for in-flight ones to come back.
    pub async fn drain(&self) -> Vec<ContextSlot<E>> {
        let mut slots = Vec::with_capacity(self.contexts.len());
        for _ in 0..self.contexts.len() {
            match self.checkout().await {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not drain execution context");
                    break;
                }
            }
        }
        slots
    }
}

/// A checked-out execution context.
pub struct ContextSlot<E> {
    guard: OwnedMutexGuard<E>,
    _permit: OwnedSemaphorePermit,
}

impl<E> Deref for ContextSlot<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.guard
    }
}

impl<E> DerefMut for ContextSlot<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.guard
    }
}

/// Shared state of one run, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub session_id: Option<String>,
    shutdown: CancellationToken,
    halt: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    dedup: Arc<Mutex<DedupIndex>>,
    rate_limiter: DomainRateLimiter,
}

impl RunContext {
    pub fn new(session_id: Option<String>, rate_limit: RateLimitConfig) -> Self {
        Self::with_shutdown(session_id, rate_limit, CancellationToken::new())
    }

    /// Build a context whose halt signal also fires when `shutdown` is
    /// cancelled (e.g. on Ctrl-C).
    pub fn with_shutdown(
        session_id: Option<String>,
        rate_limit: RateLimitConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let run_id = session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let halt = shutdown.child_token();
        Self {
            run_id,
            session_id,
            shutdown,
            halt,
            failure: Arc::new(Mutex::new(None)),
            dedup: Arc::new(Mutex::new(DedupIndex::new())),
            rate_limiter: DomainRateLimiter::new(rate_limit),
        }
    }

    pub fn dedup(&self) -> Arc<Mutex<DedupIndex>> {
        self.dedup.clone()
    }

    pub fn rate_limiter(&self) -> &DomainRateLimiter {
        &self.rate_limiter
    }

    /// Raise fail-fast. The first reason wins.
    pub fn fail_fast(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut failure = lock_or_recover(&self.failure, "run_context.failure");
        if failure.is_none() {
            tracing::error!(reason = %reason, "Fail-fast raised");
            *failure = Some(reason);
        }
        self.halt.cancel();
    }

    pub fn failure(&self) -> Option<String> {
        lock_or_recover(&self.failure, "run_context.failure").clone()
    }

    /// True once no new work may start: fail-fast or external shutdown.
    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn halt_token(&self) -> &CancellationToken {
        &self.halt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_hands_out_each_context_once() {
        let pool = ContextPool::new(vec![1, 2]);
        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        assert_ne!(*a, *b);
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.checkout().await.unwrap();
        drop((b, c));
        let mut all: Vec<i32> = pool.drain().await.iter().map(|slot| **slot).collect();
        all.sort();
        assert_eq!(all, vec![1, 2]);
    }

    #[tokio::test]
    async fn slot_is_mutable_and_returned() {
        let pool = ContextPool::new(vec![String::from("ctx")]);
        {
            let mut slot = pool.checkout().await.unwrap();
            slot.push_str("-used");
        }
        let drained = pool.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].as_str(), "ctx-used");
    }

    #[test]
    fn fail_fast_keeps_first_reason() {
        let ctx = RunContext::new(None, RateLimitConfig::default());
        assert!(!ctx.is_halted());
        ctx.fail_fast("event loop is closed");
        ctx.fail_fast("second");
        assert!(ctx.is_halted());
        assert!(!ctx.is_interrupted());
        assert_eq!(ctx.failure().as_deref(), Some("event loop is closed"));
    }

    #[test]
    fn shutdown_halts_without_failure() {
        let shutdown = CancellationToken::new();
        let ctx = RunContext::with_shutdown(
            Some("42".into()),
            RateLimitConfig::default(),
            shutdown.clone(),
        );
        assert_eq!(ctx.run_id, "42");
        shutdown.cancel();
        assert!(ctx.is_halted());
        assert!(ctx.is_interrupted());
        assert_eq!(ctx.failure(), None);
    }

    #[test]
    fn execution_mode_parses() {
        assert_eq!(
            "thread-pool".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::ThreadPool
        );
        assert_eq!(
            "cooperative".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Cooperative
        );
        assert!("fibers".parse::<ExecutionMode>().is_err());
    }
}
