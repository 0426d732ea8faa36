//! Rolling provider health.
//!
//! Each provider owns a ring of `B` 64-bit words recording its last `B * 64`
//! outcomes, one bit per call (1 = failure). A per-provider cursor picks the
//! bit to overwrite. The provider is healthy while at most 10% of the ring is
//! set; crossing that line flips it unhealthy inline with the failing call.
//!
//! Only the health monitor flips a provider back to healthy, after a successful
//! probe. The ring itself is never reset, so a provider that is still failing
//! drops out again after a few calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use herald_common::error::AppResult;
use herald_common::types::{Notification, SendResponse};

use super::Provider;

/// Share of failed calls (percent) a provider may accumulate and stay healthy.
pub const FAILURE_THRESHOLD_PCT: u64 = 10;

/// Default ring size in 64-bit words.
pub const DEFAULT_BITMAP_WORDS: usize = 2;

/// Fixed-size lock-free failure ring.
#[derive(Debug)]
pub struct HealthBitmap {
    words: Box<[AtomicU64]>,
    cursor: AtomicU64,
    threshold: u32,
}

impl HealthBitmap {
    pub fn new(words: usize) -> Self {
        let words = words.max(1);
        let capacity = (words * 64) as u64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicU64::new(0),
            threshold: (capacity * FAILURE_THRESHOLD_PCT / 100) as u32,
        }
    }

    /// Number of outcomes the ring remembers.
    pub fn capacity(&self) -> u64 {
        (self.words.len() * 64) as u64
    }

    /// Maximum number of set bits that still counts as healthy.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Overwrite the oldest slot with this outcome.
    pub fn record(&self, failed: bool) {
        let pos = self.cursor.fetch_add(1, Ordering::Relaxed) % self.capacity();
        let word = &self.words[(pos >> 6) as usize];
        let mask = 1u64 << (pos & 63);
        if failed {
            word.fetch_or(mask, Ordering::AcqRel);
        } else {
            word.fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Failures currently held in the ring.
    pub fn failures(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }

    pub fn within_threshold(&self) -> bool {
        self.failures() <= self.threshold
    }
}

impl Default for HealthBitmap {
    fn default() -> Self {
        Self::new(DEFAULT_BITMAP_WORDS)
    }
}

/// A provider wrapped with its health ring and `healthy` flag.
pub struct TrackedProvider {
    inner: Arc<dyn Provider>,
    bitmap: HealthBitmap,
    healthy: AtomicBool,
}

impl TrackedProvider {
    pub fn new(inner: Arc<dyn Provider>, bitmap_words: usize) -> Self {
        Self {
            inner,
            bitmap: HealthBitmap::new(bitmap_words),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn bitmap(&self) -> &HealthBitmap {
        &self.bitmap
    }

    /// Send through the wrapped provider and record the outcome.
    pub async fn send(&self, notification: &Notification) -> AppResult<SendResponse> {
        let result = self.inner.send(notification).await;
        match &result {
            Ok(_) => self.mark_success(),
            Err(e) => {
                tracing::debug!(
                    provider = %self.name(),
                    notification_id = %notification.id,
                    error = %e,
                    "Provider send failed"
                );
                self.mark_failure();
            }
        }
        result
    }

    pub fn mark_success(&self) {
        self.bitmap.record(false);
    }

    pub fn mark_failure(&self) {
        self.bitmap.record(true);
        let failures = self.bitmap.failures();
        if failures > self.bitmap.threshold() && self.healthy.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                provider = %self.name(),
                failures,
                window = self.bitmap.capacity(),
                "Provider marked unhealthy"
            );
        }
    }

    /// Probe the provider with a bounded timeout; on success mark it healthy.
    ///
    /// Returns `true` when the provider was reinstated by this probe.
    pub async fn probe(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.inner.check_health()).await {
            Ok(Ok(())) => {
                let reinstated = !self.healthy.swap(true, Ordering::AcqRel);
                if reinstated {
                    tracing::info!(provider = %self.name(), "Provider recovered");
                }
                reinstated
            }
            Ok(Err(e)) => {
                tracing::debug!(provider = %self.name(), error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(
                    provider = %self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Health probe timed out"
                );
                false
            }
        }
    }
}
