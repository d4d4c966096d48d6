//! Buffered, resumable delivery of discovered URLs.
//!
//! URLs are accepted one by one, de-duplicated against the run's
//! [`DedupIndex`] and buffered. The buffer is sent to a [`UrlSink`] in chunks
//! of at most `chunk_size`. A failed chunk goes back to the *front* of the
//! buffer so the next attempt resends it in discovery order.
//!
//! Flush rules, in priority order:
//! 1. a final flush always sends whatever is buffered;
//! 2. otherwise a buffer below `min_chunk_size` is never sent;
//! 3. otherwise send once the buffer reaches `chunk_size` or `interval` has
//!    passed since the last successful send.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::dedup::DedupIndex;
use crate::error::AppError;
use crate::models::CandidateUrl;
use crate::traits::UrlSink;
use crate::util::lock_or_recover;

/// Payload of one `save-urls` request.
///
/// Fields are declared in key order: serializing the struct directly yields
/// sorted keys and compact separators, which is the form that gets signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlChunk {
    pub collected_at: DateTime<Utc>,
    pub supplier: String,
    pub urls: Vec<CandidateUrl>,
}

impl UrlChunk {
    /// The exact bytes to transmit and to sign.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub interval: Duration,
    pub min_chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 300,
            interval: Duration::from_secs(60),
            min_chunk_size: 50,
        }
    }
}

impl ChunkConfig {
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_min_chunk_size(mut self, size: usize) -> Self {
        self.min_chunk_size = size;
        self
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    pub urls_found_total: u64,
    pub urls_unique_total: u64,
    pub urls_sent_total: u64,
    pub global_duplicates_dropped: u64,
    pub chunks_sent: u64,
    pub chunk_send_attempted: u64,
    pub chunk_send_success: u64,
    pub chunk_send_failed: u64,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
}

/// What a flush call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    /// Below a trigger; nothing sent.
    Held,
    Sent(usize),
    Failed,
}

pub struct ChunkSender<S> {
    sink: S,
    supplier: String,
    config: ChunkConfig,
    dedup: Arc<Mutex<DedupIndex>>,
    pending: Mutex<VecDeque<CandidateUrl>>,
    stats: Mutex<ChunkStats>,
    last_success: Mutex<Instant>,
}

impl<S: UrlSink> ChunkSender<S> {
    pub fn new(
        sink: S,
        supplier: impl Into<String>,
        config: ChunkConfig,
        dedup: Arc<Mutex<DedupIndex>>,
    ) -> Self {
        Self {
            sink,
            supplier: supplier.into(),
            config,
            dedup,
            pending: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ChunkStats::default()),
            last_success: Mutex::new(Instant::now()),
        }
    }

    pub fn stats(&self) -> ChunkStats {
        lock_or_recover(&self.stats, "chunk.stats").clone()
    }

    /// URLs accepted so far (size of the dedup index).
    pub fn unique_count(&self) -> usize {
        lock_or_recover(&self.dedup, "chunk.dedup").len()
    }

    pub fn pending_len(&self) -> usize {
        lock_or_recover(&self.pending, "chunk.pending").len()
    }

    /// Normalize, de-duplicate and buffer one URL. Returns true if the URL
    /// was new. May trigger a non-final flush.
    pub async fn accept(&self, url: &str, material_type: Option<String>) -> bool {
        let inserted = lock_or_recover(&self.dedup, "chunk.dedup").insert(url);
        {
            let mut stats = lock_or_recover(&self.stats, "chunk.stats");
            stats.urls_found_total += 1;
            match inserted {
                Some(_) => stats.urls_unique_total += 1,
                None => stats.global_duplicates_dropped += 1,
            }
        }
        let Some(normalized) = inserted else {
            return false;
        };

        lock_or_recover(&self.pending, "chunk.pending")
            .push_back(CandidateUrl::new(normalized, material_type));
        self.flush(false).await;
        true
    }

    fn interval_elapsed(&self) -> bool {
        lock_or_recover(&self.last_success, "chunk.last_success").elapsed() >= self.config.interval
    }

    /// Take the next chunk to send, or say why there is none.
    fn take_chunk(&self, final_flush: bool) -> Result<Vec<CandidateUrl>, FlushOutcome> {
        let mut pending = lock_or_recover(&self.pending, "chunk.pending");
        if pending.is_empty() {
            return Err(FlushOutcome::Empty);
        }
        if !final_flush {
            if pending.len() < self.config.min_chunk_size {
                return Err(FlushOutcome::Held);
            }
            if pending.len() < self.config.chunk_size && !self.interval_elapsed() {
                return Err(FlushOutcome::Held);
            }
        }
        let take = pending.len().min(self.config.chunk_size);
        Ok(pending.drain(..take).collect())
    }

    /// Send buffered URLs according to the flush rules. A final flush keeps
    /// sending chunks until the buffer is empty or a send fails.
    pub async fn flush(&self, final_flush: bool) -> FlushOutcome {
        let mut sent_total = 0;
        loop {
            let chunk = match self.take_chunk(final_flush) {
                Ok(chunk) => chunk,
                Err(outcome) if sent_total == 0 => return outcome,
                Err(_) => return FlushOutcome::Sent(sent_total),
            };
            match self.send(chunk).await {
                Some(count) => sent_total += count,
                None => return FlushOutcome::Failed,
            }
            if !final_flush {
                return FlushOutcome::Sent(sent_total);
            }
        }
    }

    async fn send(&self, urls: Vec<CandidateUrl>) -> Option<usize> {
        let count = urls.len();
        let chunk = UrlChunk {
            collected_at: Utc::now(),
            supplier: self.supplier.clone(),
            urls,
        };
        lock_or_recover(&self.stats, "chunk.stats").chunk_send_attempted += 1;
        tracing::debug!(count, "Sending URL chunk");

        match self.sink.send_chunk(&chunk).await {
            Ok(status) => {
                *lock_or_recover(&self.last_success, "chunk.last_success") = Instant::now();
                let mut stats = lock_or_recover(&self.stats, "chunk.stats");
                stats.urls_sent_total += count as u64;
                stats.chunks_sent += 1;
                stats.chunk_send_success += 1;
                stats.last_status_code = Some(status);
                stats.last_error = None;
                tracing::info!(
                    chunk = stats.chunks_sent,
                    count,
                    total_sent = stats.urls_sent_total,
                    "URL chunk sent"
                );
                Some(count)
            }
            Err(e) => {
                {
                    let mut pending = lock_or_recover(&self.pending, "chunk.pending");
                    for url in chunk.urls.into_iter().rev() {
                        pending.push_front(url);
                    }
                }
                let mut stats = lock_or_recover(&self.stats, "chunk.stats");
                stats.chunk_send_failed += 1;
                stats.last_status_code = e.status_code();
                stats.last_error = Some(e.to_string());
                tracing::warn!(count, error = %e, "URL chunk send failed, re-buffered");
                None
            }
        }
    }
}
