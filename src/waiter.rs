//! Long-poll waiting for new mail.
//!
//! [`MailWaiter`] polls the [`MailCache`] at the configured interval until a
//! mail newer than a given timestamp shows up, the timeout elapses, or the
//! caller cancels.
//!
//! # Example
//!
//! ```
//! use tempmail_sync::{CacheConfig, MailCache, MailWaiter, PollingConfig, WaitOutcome};
//! use tempmail_sync::provider::FnProvider;
//! use chrono::Utc;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let provider = FnProvider::new("empty", |_| async { Ok(Vec::new()) });
//! let cache = Arc::new(MailCache::new(Arc::new(provider), CacheConfig::default()));
//! let waiter = MailWaiter::new(cache, PollingConfig::default());
//!
//! let outcome = waiter
//!     .wait_for_new_mail("me@example.com", Utc::now(), Duration::from_secs(1), None)
//!     .await;
//! assert_eq!(outcome, WaitOutcome::TimedOut);
//! # }
//! ```

use crate::cache::MailCache;
use crate::config::PollingConfig;
use crate::error::Result;
use crate::extract::ExtractionPipeline;
use crate::model::{ExtractionMethod, ExtractionStats, MailRecord};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Cooperative cancellation signal shared between a waiter and its caller.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The waiter stops before its next sleep.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// Mails received after the `since` timestamp, in provider order.
    Found(Vec<MailRecord>),
    /// The timeout elapsed without new mail.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

impl WaitOutcome {
    /// Returns `true` for [`WaitOutcome::Found`].
    #[must_use]
    pub fn is_found(&self) -> bool {
        matches!(self, WaitOutcome::Found(_))
    }

    /// The new mails; empty on timeout or cancellation.
    #[must_use]
    pub fn into_mails(self) -> Vec<MailRecord> {
        match self {
            WaitOutcome::Found(mails) => mails,
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => Vec::new(),
        }
    }
}

/// Extraction settings for [`MailWaiter::wait_for_new_mail_with_codes`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionRequest {
    /// Run only this strategy; `None` runs the cascade.
    pub method: Option<ExtractionMethod>,
    /// Codes below this confidence are dropped.
    pub min_confidence: f64,
}

impl Default for ExtractionRequest {
    fn default() -> Self {
        Self {
            method: None,
            min_confidence: 0.8,
        }
    }
}

impl From<&crate::config::ExtractionConfig> for ExtractionRequest {
    fn from(config: &crate::config::ExtractionConfig) -> Self {
        Self {
            method: None,
            min_confidence: config.min_confidence,
        }
    }
}

/// Blocks callers until new mail arrives for an address.
#[derive(Debug, Clone)]
pub struct MailWaiter {
    cache: Arc<MailCache>,
    polling: PollingConfig,
}

impl MailWaiter {
    /// Creates a waiter polling `cache`.
    #[must_use]
    pub fn new(cache: Arc<MailCache>, polling: PollingConfig) -> Self {
        Self { cache, polling }
    }

    /// Polls until a mail with `received_at > since` appears.
    ///
    /// `timeout` is a hard wall-clock limit, capped at
    /// [`PollingConfig::max_wait`]. Neither a slow upstream fetch nor the last
    /// sleep can overrun it. `cancel` is checked before every sleep.
    #[instrument(
        name = "MailWaiter::wait_for_new_mail",
        skip(self, cancel),
        fields(timeout_secs = timeout.as_secs())
    )]
    pub async fn wait_for_new_mail(
        &self,
        address: &str,
        since: DateTime<Utc>,
        timeout: Duration,
        cancel: Option<&CancelFlag>,
    ) -> WaitOutcome {
        let timeout = self.effective_timeout(timeout);
        let deadline = Instant::now() + timeout;
        let mut polls = 0_u32;

        loop {
            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            // A poll that outlives the deadline is abandoned; its fetch task
            // still completes and fills the cache.
            let Ok(lookup) =
                tokio::time::timeout(remaining, self.cache.get_or_fetch(address, false)).await
            else {
                debug!(polls, "Wait timed out during fetch");
                return WaitOutcome::TimedOut;
            };
            let fresh: Vec<MailRecord> = lookup
                .mails
                .into_iter()
                .filter(|mail| mail.received_at > since)
                .collect();

            if !fresh.is_empty() {
                info!(count = fresh.len(), polls, "New mail arrived");
                return WaitOutcome::Found(fresh);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(polls, "Wait timed out");
                return WaitOutcome::TimedOut;
            }
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                debug!(polls, "Wait cancelled");
                return WaitOutcome::Cancelled;
            }

            tokio::time::sleep(self.polling.interval.min(deadline - now)).await;
        }
    }

    /// Same as [`wait_for_new_mail`](Self::wait_for_new_mail), then runs the
    /// extraction pipeline over every new mail.
    ///
    /// Each mail's `codes` holds the candidates at or above
    /// `request.min_confidence`. The returned stats aggregate over all mails
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`](crate::Error::Extraction) when extraction
    /// fails for a mail (a failing preferred method, or a failing last
    /// cascade stage).
    #[instrument(
        name = "MailWaiter::wait_for_new_mail_with_codes",
        skip(self, pipeline, cancel),
        fields(timeout_secs = timeout.as_secs())
    )]
    pub async fn wait_for_new_mail_with_codes(
        &self,
        pipeline: &ExtractionPipeline,
        address: &str,
        since: DateTime<Utc>,
        timeout: Duration,
        request: ExtractionRequest,
        cancel: Option<&CancelFlag>,
    ) -> Result<(WaitOutcome, ExtractionStats)> {
        let mut stats = ExtractionStats {
            method_requested: request.method,
            ..ExtractionStats::default()
        };

        let mut mails = match self.wait_for_new_mail(address, since, timeout, cancel).await {
            WaitOutcome::Found(mails) => mails,
            other => return Ok((other, stats)),
        };

        for mail in &mut mails {
            let outcome = pipeline
                .annotate(mail, request.method, request.min_confidence)
                .await
                .inspect_err(|e| warn!(mail_id = %mail.id, error = %e, "Extraction failed"))?;
            stats.duration += outcome.duration;
            stats.record(outcome.method_used, outcome.codes.len());
        }

        debug!(
            mails = stats.mails_processed,
            codes = stats.codes_found,
            "Extraction over new mail finished"
        );
        Ok((WaitOutcome::Found(mails), stats))
    }

    /// The polling settings in use.
    #[must_use]
    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    fn effective_timeout(&self, requested: Duration) -> Duration {
        if requested > self.polling.max_wait {
            warn!(
                requested_secs = requested.as_secs(),
                max_secs = self.polling.max_wait.as_secs(),
                "Wait timeout capped"
            );
            self.polling.max_wait
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTier;
    use crate::config::CacheConfig;
    use crate::provider::FnProvider;

    fn waiter_over(mails: Vec<MailRecord>) -> MailWaiter {
        let provider = FnProvider::new("fixed", move |_| {
            let mails = mails.clone();
            async move { Ok(mails) }
        });
        let cache = Arc::new(MailCache::new(Arc::new(provider), CacheConfig::default()));
        MailWaiter::new(cache, PollingConfig::default())
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_mail_is_new() {
        let since = Utc::now() - chrono::Duration::minutes(1);
        let waiter = waiter_over(vec![MailRecord::new("a@x.com", "s", "t", "b", Utc::now())]);

        let started = Instant::now();
        let outcome = waiter
            .wait_for_new_mail("a@x.com", since, Duration::from_secs(30), None)
            .await;
        assert!(outcome.is_found());
        assert!(started.elapsed() < waiter.polling().interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_sleep() {
        let waiter = waiter_over(Vec::new());
        let flag = CancelFlag::new();
        flag.cancel();

        let outcome = waiter
            .wait_for_new_mail("a@x.com", Utc::now(), Duration::from_secs(30), Some(&flag))
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_capped_by_max_wait() {
        let waiter = waiter_over(Vec::new());
        let max_wait = waiter.polling().max_wait;

        let started = Instant::now();
        let outcome = waiter
            .wait_for_new_mail("a@x.com", Utc::now(), max_wait * 2, None)
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= max_wait);
        assert!(started.elapsed() < max_wait + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_does_not_overrun_timeout() {
        let provider = FnProvider::new("slow", |address| async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok(vec![MailRecord::new(address, "s", "t", "b", Utc::now())])
        });
        let cache = Arc::new(MailCache::new(Arc::new(provider), CacheConfig::default()));
        let waiter = MailWaiter::new(Arc::clone(&cache), PollingConfig::default());

        let started = Instant::now();
        let outcome = waiter
            .wait_for_new_mail("a@x.com", Utc::now(), Duration::from_secs(1), None)
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The abandoned fetch still lands in the cache
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(cache.entry("a@x.com", CacheTier::Hot).is_some());
    }

    #[test]
    fn test_into_mails() {
        assert!(WaitOutcome::TimedOut.into_mails().is_empty());
        assert!(WaitOutcome::Cancelled.into_mails().is_empty());
    }
}
