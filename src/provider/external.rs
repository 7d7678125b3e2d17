//! Internal module for the external HTTP mail API.

use super::{http_client, payload, read_json, MailProvider};
use crate::config::ExternalApiConfig;
use crate::error::{FetchError, Result};
use crate::model::MailRecord;
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

/// Fetches mail from `GET {url}?email=<address>`.
///
/// In reliable mode retryable failures (timeouts, connection errors, 429 and
/// 5xx) are retried up to `max_retries` attempts with `retry_delay` between them.
#[derive(Debug, Clone)]
pub struct ExternalApiProvider {
    client: reqwest::Client,
    config: ExternalApiConfig,
}

impl ExternalApiProvider {
    /// Creates a provider from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ExternalApiConfig) -> Result<Self> {
        let client = http_client(config.effective_timeout(), &config.user_agent)?;
        Ok(Self { client, config })
    }

    fn request_url(&self, address: &str) -> String {
        let separator = if self.config.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}email={}",
            self.config.url,
            urlencoding::encode(address)
        )
    }

    async fn fetch_once(&self, url: &str, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: self.config.url.clone(),
                source,
            })?;

        let body = read_json(&self.config.url, response).await?;
        payload::parse_mail_list(address, &body)
    }
}

#[async_trait]
impl MailProvider for ExternalApiProvider {
    #[instrument(
        name = "ExternalApiProvider::fetch",
        skip(self),
        fields(reliable = self.config.reliable)
    )]
    async fn fetch(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        let url = self.request_url(address);
        let attempts = self.config.attempts();
        let mut attempt = 1;

        loop {
            match self.fetch_once(&url, address).await {
                Ok(mails) => {
                    debug!(attempt, count = mails.len(), "Fetched mail from external API");
                    return Ok(mails);
                }
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "External API fetch failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        "external-api"
    }
}
