//! # tempmail-sync
//!
//! Async mail synchronization core for disposable inboxes.
//!
//! This crate provides:
//! - A two-tier [`MailCache`] in front of the upstream mail providers, with
//!   single-flight fetching so concurrent readers of one address share a request
//! - A [`MailStore`] of mailboxes and their deduplicated mail
//! - A [`MailWaiter`] that long-polls for mail newer than a timestamp
//! - A verification code [`ExtractionPipeline`]: learned templates, then an
//!   optional LLM, then built-in regex rules
//!
//! ## Quick Start
//!
//! ```no_run
//! use tempmail_sync::{CodeWaitOutcome, MailService, SyncConfig};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! # async fn example() -> tempmail_sync::Result<()> {
//! let config = SyncConfig::builder()
//!     .email_api_url("https://mail.example.com/api/emails")
//!     .build()?;
//!
//! let service = MailService::new(config)?;
//! let mailbox = service.open_mailbox("signup-42@mail.example.com").await?;
//!
//! if let CodeWaitOutcome::Found(found) = service
//!     .wait_for_code(&mailbox.token, Utc::now(), Duration::from_secs(120), None)
//!     .await?
//! {
//!     println!("Got code: {}", found.code.value());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Providers
//!
//! Anything implementing [`provider::MailProvider`] can feed the cache. For
//! tests and quick integrations a closure is enough:
//!
//! ```
//! use tempmail_sync::{MailRecord, MailService, SyncConfig};
//! use tempmail_sync::provider::FnProvider;
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! let provider = FnProvider::new("fixture", |address| async move {
//!     Ok(vec![MailRecord::new(address, "noreply@site.com", "Hi", "code: 482931", Utc::now())])
//! });
//! let service = MailService::with_provider(SyncConfig::default(), Arc::new(provider)).unwrap();
//! ```
//!
//! ## Extracting Codes Directly
//!
//! ```
//! use tempmail_sync::extract::{CodeExtractor, RegexExtractor};
//!
//! # async fn example() {
//! let codes = RegexExtractor::new()
//!     .extract("Your verification code is 482931. Valid until 2025.")
//!     .await
//!     .unwrap();
//! assert_eq!(codes.len(), 1);
//! assert_eq!(codes[0].value(), "482931");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All errors implement `std::error::Error` and provide context. Use [`Error::is_retryable`]
//! to determine if an operation can be retried:
//!
//! ```
//! use tempmail_sync::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_retryable() {
//!         println!("Transient error, can retry: {}", error);
//!     } else {
//!         println!("Permanent error: {}", error);
//!     }
//! }
//! ```
//!
//! Upstream failures never surface from cache reads: the cache degrades to
//! its stale tier, then to an empty list, and reports which through
//! [`LookupSource`].
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. All major operations emit spans with
//! structured fields.
//!
//! ### Span Naming Convention
//!
//! - `MailService::open_mailbox` - Mailbox provisioning
//! - `MailService::wait` - Waiting for new mail
//! - `MailCache::get_or_fetch` - Cached read of an address
//! - `MailWaiter::wait_for_new_mail` - Polling loop
//! - `ExtractionPipeline::extract_smart` - Extraction cascade
//! - `LlmExtractor::extract` - LLM request
//! - `ExternalApiProvider::fetch` / `KvProvider::fetch` - Upstream fetches
//!
//! ### Standard Fields
//!
//! - `address` - Mailbox address
//! - `token` - Mailbox token
//! - `force_refresh` - Whether the hot tier was bypassed
//! - `mail_id` - Mail identifier
//! - `method` - Extraction method
//! - `timeout_secs` - Effective wait timeout

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod provider;
pub mod store;
pub mod waiter;

// Internal modules
mod service;
mod text;

// Re-exports for ergonomic API
pub use cache::{CacheEntry, CacheLookup, CacheStats, CacheTier, LookupSource, MailCache};
pub use config::{
    CacheConfig, ExternalApiConfig, ExtractionConfig, KvConfig, LlmConfig, PollingConfig,
    SyncConfig, SyncConfigBuilder,
};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, ExtractionError, FetchError, Result};
pub use extract::{ExtractionPipeline, PatternLibrary};
pub use model::{CodeKind, ExtractedCode, ExtractionMethod, ExtractionStats, MailRecord, Mailbox};
pub use service::{CodeMatch, CodeWaitOutcome, MailService, ServiceStats};
pub use store::{MailStore, StoreStats};
pub use waiter::{CancelFlag, ExtractionRequest, MailWaiter, WaitOutcome};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        // Ensure all public types are accessible
        let _ = SyncConfig::builder();
        let _ = MailStore::new();
        let _ = CancelFlag::new();
        let _ = extract::RegexExtractor::new();
        let _ = PatternLibrary::new();
    }
}
