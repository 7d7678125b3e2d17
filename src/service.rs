//! Mailbox-level façade over the cache, store, waiter and extraction pipeline.
//!
//! [`MailService`] is what an HTTP layer calls: every operation takes a
//! mailbox token, resolves it through the [`MailStore`], and keeps the store
//! and the [`MailCache`] consistent.
//!
//! # Example
//!
//! ```no_run
//! use tempmail_sync::{MailService, SyncConfig, CodeWaitOutcome};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! # async fn example() -> tempmail_sync::Result<()> {
//! let service = MailService::new(SyncConfig::from_env()?)?;
//! let mailbox = service.open_mailbox("someone@mail.example.com").await?;
//!
//! // ... trigger a signup that sends a code ...
//!
//! match service
//!     .wait_for_code(&mailbox.token, Utc::now(), Duration::from_secs(120), None)
//!     .await?
//! {
//!     CodeWaitOutcome::Found(found) => println!("code: {}", found.code.value()),
//!     other => println!("no code: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheStats, MailCache};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::extract::{
    extract_links, ExtractedLink, ExtractionPipeline, PatternLibrary, PatternTemplate,
    PipelineStats,
};
use crate::model::{ExtractedCode, ExtractionMethod, ExtractionStats, MailRecord, Mailbox};
use crate::provider::{self, MailProvider};
use crate::store::{MailStore, StoreStats};
use crate::text::readable_body;
use crate::waiter::{CancelFlag, ExtractionRequest, MailWaiter, WaitOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// The best code found by [`MailService::wait_for_code`].
#[derive(Debug, Clone, PartialEq)]
pub struct CodeMatch {
    /// The code.
    pub code: ExtractedCode,
    /// The mail it came from, with all its kept codes.
    pub mail: MailRecord,
    /// Extraction stats over all new mails.
    pub stats: ExtractionStats,
}

/// How [`MailService::wait_for_code`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeWaitOutcome {
    /// New mail arrived and carried a code.
    Found(Box<CodeMatch>),
    /// New mail arrived but none of it carried a confident enough code.
    NoCode {
        /// The new mails.
        mails: Vec<MailRecord>,
        /// Extraction stats over them.
        stats: ExtractionStats,
    },
    /// The timeout elapsed without new mail.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

/// Combined counters of every component.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStats {
    /// Cache state.
    pub cache: CacheStats,
    /// Store contents.
    pub store: StoreStats,
    /// Extraction outcomes.
    pub extraction: PipelineStats,
}

/// Disposable mailbox operations.
#[derive(Debug, Clone)]
pub struct MailService {
    config: SyncConfig,
    cache: Arc<MailCache>,
    store: Arc<MailStore>,
    patterns: Arc<PatternLibrary>,
    pipeline: Arc<ExtractionPipeline>,
    waiter: MailWaiter,
}

impl MailService {
    /// Creates the service with the providers described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a provider or HTTP client cannot be built.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let provider = provider::from_config(&config)?;
        Self::with_provider(config, provider)
    }

    /// Creates the service over a custom provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the LLM HTTP client cannot be built.
    pub fn with_provider(config: SyncConfig, provider: Arc<dyn MailProvider>) -> Result<Self> {
        let cache = Arc::new(MailCache::new(provider, config.cache.clone()));
        let patterns = Arc::new(PatternLibrary::new());
        let pipeline = Arc::new(ExtractionPipeline::new(&config, Arc::clone(&patterns))?);
        let waiter = MailWaiter::new(Arc::clone(&cache), config.polling.clone());

        Ok(Self {
            config,
            cache,
            store: Arc::new(MailStore::new()),
            patterns,
            pipeline,
            waiter,
        })
    }

    /// Provisions a mailbox for `address` and warms the cache with its current mail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEmailFormat`] for malformed addresses.
    #[instrument(name = "MailService::open_mailbox", skip(self))]
    pub async fn open_mailbox(&self, address: &str) -> Result<Mailbox> {
        let mailbox = Mailbox::provision(address, self.config.mailbox_ttl)?;
        let token = mailbox.token.clone();
        self.store.register_mailbox(mailbox);

        let added = self.refresh(&token).await?;
        info!(address, mails = added, "Mailbox opened");
        self.store.mailbox(&token)
    }

    /// Fetches the mailbox's mail through the cache and stores what is new.
    ///
    /// Returns how many mails were added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    #[instrument(name = "MailService::refresh", skip_all, fields(token = %token))]
    pub async fn refresh(&self, token: &str) -> Result<usize> {
        let address = self.store.address_for(token)?;
        let lookup = self.cache.get_or_fetch(&address, false).await;
        debug!(source = ?lookup.source, count = lookup.mails.len(), "Mail fetched");
        self.store.save_mails(token, lookup.mails)
    }

    /// Refreshes, then returns one page of mail, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub async fn list_mails(
        &self,
        token: &str,
        limit: Option<usize>,
        offset: usize,
        unread_only: bool,
    ) -> Result<Vec<MailRecord>> {
        self.refresh(token).await?;
        if unread_only {
            let unread = self.store.get_unread(token)?;
            Ok(unread
                .into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .collect())
        } else {
            self.store.get_mails(token, limit, offset)
        }
    }

    /// Returns one mail and marks it read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] or [`Error::MailNotFound`].
    pub fn read_mail(&self, token: &str, mail_id: &str) -> Result<MailRecord> {
        let mut mail = self.store.get_by_id(token, mail_id)?;
        self.store.mark_read(token, mail_id)?;
        mail.is_read = true;
        Ok(mail)
    }

    /// Runs extraction over one stored mail, or over every stored mail when
    /// `mail_id` is `None`, and stores the codes on them.
    ///
    /// All candidates are kept, whatever their confidence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`], [`Error::MailNotFound`], or
    /// [`Error::Extraction`] when the requested method fails.
    #[instrument(name = "MailService::extract_codes", skip(self, token), fields(token = %token))]
    pub async fn extract_codes(
        &self,
        token: &str,
        mail_id: Option<&str>,
        method: Option<ExtractionMethod>,
    ) -> Result<(Vec<MailRecord>, ExtractionStats)> {
        let mut mails = match mail_id {
            Some(id) => vec![self.store.get_by_id(token, id)?],
            None => {
                self.refresh(token).await?;
                self.store.get_mails(token, None, 0)?
            }
        };

        let mut stats = ExtractionStats {
            method_requested: method,
            ..ExtractionStats::default()
        };
        for mail in &mut mails {
            let outcome = self.pipeline.annotate(mail, method, 0.0).await?;
            stats.duration += outcome.duration;
            stats.record(outcome.method_used, outcome.codes.len());
            self.store.set_codes(token, &mail.id, outcome.codes)?;
        }
        Ok((mails, stats))
    }

    /// Waits for mail newer than `since`, optionally extracting codes from it.
    ///
    /// New mail is stored before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens and
    /// [`Error::Extraction`] when extraction fails.
    #[instrument(name = "MailService::wait", skip(self, token, cancel), fields(token = %token))]
    pub async fn wait(
        &self,
        token: &str,
        since: DateTime<Utc>,
        timeout: Duration,
        extraction: Option<ExtractionRequest>,
        cancel: Option<&CancelFlag>,
    ) -> Result<(WaitOutcome, Option<ExtractionStats>)> {
        let address = self.store.address_for(token)?;

        let (outcome, stats) = match extraction {
            Some(request) => {
                let (outcome, stats) = self
                    .waiter
                    .wait_for_new_mail_with_codes(
                        &self.pipeline,
                        &address,
                        since,
                        timeout,
                        request,
                        cancel,
                    )
                    .await?;
                (outcome, Some(stats))
            }
            None => (
                self.waiter
                    .wait_for_new_mail(&address, since, timeout, cancel)
                    .await,
                None,
            ),
        };

        if let WaitOutcome::Found(mails) = &outcome {
            self.store.save_mails(token, mails.iter().cloned())?;
            for mail in mails {
                if let Some(codes) = &mail.codes {
                    self.store.set_codes(token, &mail.id, codes.clone())?;
                }
            }
        }
        Ok((outcome, stats))
    }

    /// Waits for new mail and returns the most confident code across it.
    ///
    /// `request` defaults to the cascade with the configured minimum confidence.
    /// On equal confidence the newer mail wins.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub async fn wait_for_code(
        &self,
        token: &str,
        since: DateTime<Utc>,
        timeout: Duration,
        request: Option<ExtractionRequest>,
    ) -> Result<CodeWaitOutcome> {
        self.wait_for_code_with_cancel(token, since, timeout, request, None)
            .await
    }

    /// [`wait_for_code`](Self::wait_for_code) with cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub async fn wait_for_code_with_cancel(
        &self,
        token: &str,
        since: DateTime<Utc>,
        timeout: Duration,
        request: Option<ExtractionRequest>,
        cancel: Option<&CancelFlag>,
    ) -> Result<CodeWaitOutcome> {
        let request = request.unwrap_or_else(|| ExtractionRequest::from(&self.config.extraction));
        let (outcome, stats) = self
            .wait(token, since, timeout, Some(request), cancel)
            .await?;
        let stats = stats.unwrap_or_default();

        let mails = match outcome {
            WaitOutcome::Found(mails) => mails,
            WaitOutcome::TimedOut => return Ok(CodeWaitOutcome::TimedOut),
            WaitOutcome::Cancelled => return Ok(CodeWaitOutcome::Cancelled),
        };

        let best = mails
            .iter()
            .filter_map(|mail| {
                let code = mail.codes.as_ref()?.first()?;
                Some((mail, code))
            })
            .max_by(|(a_mail, a), (b_mail, b)| {
                a.confidence()
                    .total_cmp(&b.confidence())
                    .then(a_mail.received_at.cmp(&b_mail.received_at))
            })
            .map(|(mail, code)| (mail.clone(), code.clone()));

        Ok(match best {
            Some((mail, code)) => {
                info!(mail_id = %mail.id, confidence = code.confidence(), "Code found");
                CodeWaitOutcome::Found(Box::new(CodeMatch { code, mail, stats }))
            }
            None => CodeWaitOutcome::NoCode { mails, stats },
        })
    }

    /// Learns an extraction template from a code highlighted in a stored mail.
    ///
    /// `position` is the byte offset of the code in the mail's readable body;
    /// when absent the first occurrence is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`], [`Error::MailNotFound`], or
    /// [`Error::Extraction`] when the code does not occur in the mail.
    pub fn learn_pattern(
        &self,
        token: &str,
        mail_id: &str,
        code: &str,
        position: Option<usize>,
    ) -> Result<PatternTemplate> {
        let mail = self.store.get_by_id(token, mail_id)?;
        let body = readable_body(&mail.text_body, mail.html_body.as_deref());
        let position = position.or_else(|| body.find(code)).unwrap_or(0);

        self.patterns
            .learn_from_highlight(&body, code, position)
            .map_err(|source| Error::Extraction {
                method: ExtractionMethod::Pattern,
                source,
            })
    }

    /// Returns the links of a stored mail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] or [`Error::MailNotFound`].
    pub fn links(&self, token: &str, mail_id: &str) -> Result<Vec<ExtractedLink>> {
        let mail = self.store.get_by_id(token, mail_id)?;
        Ok(extract_links(&mail.text_body, mail.html_body.as_deref()))
    }

    /// Deletes a mailbox and drops its cached mail. Returns `false` for unknown tokens.
    #[instrument(name = "MailService::delete_mailbox", skip_all, fields(token = %token))]
    pub fn delete_mailbox(&self, token: &str) -> bool {
        let Ok(address) = self.store.address_for(token) else {
            return false;
        };
        let deleted = self.store.delete_mailbox(token);
        self.cache.invalidate(&address);
        deleted
    }

    /// Removes expired mailboxes and their cache entries. Returns how many mailboxes were removed.
    #[instrument(name = "MailService::cleanup_expired", skip(self))]
    pub fn cleanup_expired(&self) -> usize {
        let expired = self.store.remove_expired_at(Utc::now());
        for mailbox in &expired {
            self.cache.invalidate(&mailbox.address);
        }
        let purged = self.cache.purge_expired();
        debug!(mailboxes = expired.len(), cache_slots = purged, "Cleanup finished");
        expired.len()
    }

    /// Returns counters of every component.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            store: self.store.stats(),
            extraction: self.pipeline.stats(),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The mail cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<MailCache> {
        &self.cache
    }

    /// The mail store.
    #[must_use]
    pub fn store(&self) -> &Arc<MailStore> {
        &self.store
    }

    /// The learned extraction templates.
    #[must_use]
    pub fn patterns(&self) -> &Arc<PatternLibrary> {
        &self.patterns
    }

    /// The extraction pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<ExtractionPipeline> {
        &self.pipeline
    }
}
