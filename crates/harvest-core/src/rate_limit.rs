//! Per-domain admission control for extraction requests.
//!
//! Every request first takes a permit from its domain's semaphore (capping
//! in-flight requests per domain), then waits until the domain's spacing has
//! elapsed since the previous request. Spacing is `base_interval` plus the
//! run-wide dynamic delay set by [`crate::backoff::AdaptiveBackoff`].
//!
//! Both maps are keyed by domain and filled lazily. A slow domain only ever
//! holds its own lock, so requests to other domains are never serialized
//! behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::AppError;
use crate::util::{domain_key, lock_or_recover};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between requests to one domain.
    pub base_interval: Duration,
    /// Concurrent in-flight requests allowed per domain.
    pub domain_limit: usize,
}

impl RateLimitConfig {
    pub fn new(base_interval: Duration, domain_limit: usize) -> Self {
        Self {
            base_interval,
            domain_limit,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::ZERO,
            domain_limit: 3,
        }
    }
}

/// Admission for one request. Dropping it frees the domain slot.
#[derive(Debug)]
pub struct DomainPermit {
    pub domain: String,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct DomainRateLimiter {
    config: RateLimitConfig,
    dynamic_delay_ms: Arc<AtomicU64>,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    /// Next instant at which each domain may be hit.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            dynamic_delay_ms: Arc::new(AtomicU64::new(0)),
            semaphores: Arc::new(Mutex::new(HashMap::new())),
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn dynamic_delay(&self) -> Duration {
        Duration::from_millis(self.dynamic_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_dynamic_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.dynamic_delay_ms.store(millis, Ordering::Relaxed);
    }

    /// Effective spacing between two requests to the same domain.
    pub fn spacing(&self) -> Duration {
        self.config.base_interval + self.dynamic_delay()
    }

    fn semaphore_for(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = lock_or_recover(&self.semaphores, "rate_limiter.semaphores");
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.domain_limit.max(1))))
            .clone()
    }

    /// Reserve the next request slot for `domain` and return how long the
    /// caller must wait before using it.
    fn reserve_slot(&self, domain: &str) -> Duration {
        let spacing = self.spacing();
        let now = Instant::now();
        let mut map = lock_or_recover(&self.next_slot, "rate_limiter.next_slot");
        let slot = match map.get(domain) {
            Some(&next) if next > now => next,
            _ => now,
        };
        map.insert(domain.to_string(), slot + spacing);
        slot - now
    }

    /// Wait for admission to the domain of `url`.
    pub async fn acquire(&self, url: &str) -> Result<DomainPermit, AppError> {
        let domain = domain_key(url);
        let permit = self
            .semaphore_for(&domain)
            .acquire_owned()
            .await
            .map_err(|e| AppError::Generic(format!("Domain semaphore closed: {e}")))?;

        let wait = self.reserve_slot(&domain);
        if !wait.is_zero() {
            tracing::debug!(
                domain = %domain,
                sleep_ms = %wait.as_millis(),
                "Rate limiting request"
            );
            tokio::time::sleep(wait).await;
        }

        Ok(DomainPermit {
            domain,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_domain_requests_are_spaced() {
        let limiter = DomainRateLimiter::new(RateLimitConfig::new(Duration::from_secs(1), 3));

        let start = Instant::now();
        let first = limiter.acquire("https://shop.example/p/1").await.unwrap();
        let first_at = start.elapsed();
        let second = limiter.acquire("https://shop.example/p/2").await.unwrap();
        let second_at = start.elapsed();

        assert_eq!(first.domain, "shop.example");
        assert!(
            second_at - first_at >= Duration::from_secs(1),
            "expected >= 1s spacing, got {:?}",
            second_at - first_at
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_domain_requests_stay_spaced() {
        let limiter = DomainRateLimiter::new(RateLimitConfig::new(Duration::from_secs(1), 3));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let _permit = limiter
                        .acquire(&format!("https://shop.example/p/{i}"))
                        .await
                        .unwrap();
                    start.elapsed()
                })
            })
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn different_domains_are_not_serialized() {
        let limiter = DomainRateLimiter::new(RateLimitConfig::new(Duration::from_secs(1), 3));
        let start = Instant::now();
        let _a = limiter.acquire("https://a.example/1").await.unwrap();
        let _b = limiter.acquire("https://b.example/1").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_delay_extends_spacing() {
        let limiter = DomainRateLimiter::new(RateLimitConfig::new(Duration::from_millis(500), 3));
        limiter.set_dynamic_delay(Duration::from_millis(300));
        assert_eq!(limiter.spacing(), Duration::from_millis(800));

        let start = Instant::now();
        drop(limiter.acquire("https://shop.example/1").await.unwrap());
        drop(limiter.acquire("https://shop.example/2").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn domain_limit_caps_in_flight_requests() {
        let limiter = DomainRateLimiter::new(RateLimitConfig::new(Duration::ZERO, 1));
        let held = limiter.acquire("https://shop.example/1").await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            limiter.acquire("https://shop.example/2"),
        )
        .await;
        assert!(blocked.is_err(), "second request should wait for the slot");

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            limiter.acquire("https://other.example/1"),
        )
        .await;
        assert!(other.is_ok(), "other domains have their own slots");

        drop(held);
        assert!(limiter.acquire("https://shop.example/3").await.is_ok());
    }
}
