//! Mail providers: the upstream sources the cache fetches from.
//!
//! A [`MailProvider`] turns an address into its current list of mails. The
//! rest of the crate only sees this trait, so tests and embedders can inject
//! any source through [`FnProvider`].
//!
//! # Example
//!
//! ```
//! use tempmail_sync::provider::{FnProvider, MailProvider};
//! use tempmail_sync::MailRecord;
//! use chrono::Utc;
//!
//! # async fn example() {
//! let provider = FnProvider::new("static", |address: String| async move {
//!     Ok(vec![MailRecord::new(address, "bot@service.com", "Hi", "Code 123456", Utc::now())])
//! });
//!
//! let mails = provider.fetch("me@example.com").await.unwrap();
//! assert_eq!(mails.len(), 1);
//! # }
//! ```

mod external;
mod kv;
pub(crate) mod payload;
mod routing;

pub use external::ExternalApiProvider;
pub use kv::KvProvider;
pub use routing::{MailSource, RoutingProvider, SourceRegistry};

use crate::config::SyncConfig;
use crate::error::{Error, FetchError, Result};
use crate::model::MailRecord;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// An upstream source of mail.
///
/// Every failure mode (timeout, non-success status, malformed payload) is
/// reported as a [`FetchError`].
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Fetches the current mail list for `address`.
    async fn fetch(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<P: MailProvider + ?Sized> MailProvider for Arc<P> {
    async fn fetch(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        (**self).fetch(address).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Provider backed by an async closure.
pub struct FnProvider<F> {
    fetch_fn: F,
    name: String,
}

impl<F, Fut> FnProvider<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<MailRecord>, FetchError>> + Send,
{
    /// Creates a new closure-based provider.
    #[must_use]
    pub fn new(name: impl Into<String>, fetch_fn: F) -> Self {
        Self {
            fetch_fn,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<F, Fut> MailProvider for FnProvider<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<MailRecord>, FetchError>> + Send,
{
    async fn fetch(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        (self.fetch_fn)(address.to_string()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> std::fmt::Debug for FnProvider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Assembles the provider described by `config`.
///
/// Without KV the external API serves every address. With KV enabled a
/// [`RoutingProvider`] picks the source per address domain.
///
/// # Errors
///
/// Returns an error if an HTTP client cannot be built.
pub fn from_config(config: &SyncConfig) -> Result<Arc<dyn MailProvider>> {
    let external = ExternalApiProvider::new(config.external_api.clone())?;

    if !config.kv.enabled {
        return Ok(Arc::new(external));
    }

    let kv = KvProvider::new(config.kv.clone())?;
    let registry = SourceRegistry::from_kv_config(&config.kv);
    Ok(Arc::new(RoutingProvider::new(external, kv, registry)))
}

/// Builds the shared HTTP client used by the HTTP providers.
pub(crate) fn http_client(timeout: Duration, user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| Error::InvalidConfig {
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// Reads a response body, mapping non-success statuses to [`FetchError::Status`].
pub(crate) async fn read_json(
    url: &str,
    response: reqwest::Response,
) -> std::result::Result<serde_json::Value, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            status: status.as_u16(),
            body: crate::error::truncate_body(&body),
        });
    }

    let body = response.text().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;

    serde_json::from_str(&body)
        .map_err(|e| FetchError::payload(format!("invalid JSON from {url}: {e}")))
}
