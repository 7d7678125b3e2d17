//! Internal module for mail stored in a Cloudflare KV namespace.
//!
//! The mail worker writes two kinds of keys:
//!
//! - `index:{address}`: `{"mails": [{id, from, subject, receivedAt, content_preview, key}]}`
//! - `mail:{address}:{id}`: `{id, from, to, subject, content, html_content, received_at}`
//!
//! Reading the index costs one KV read per fetch; the per-mail keys are only
//! listed when no index exists (or when full content is requested).

use super::{http_client, payload, read_json, MailProvider};
use crate::config::KvConfig;
use crate::error::{FetchError, Result};
use crate::model::MailRecord;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Maximum number of per-mail keys listed on the fallback path.
const LIST_LIMIT: usize = 20;

/// Reads mail from the Cloudflare KV REST API.
#[derive(Debug, Clone)]
pub struct KvProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: SecretString,
    fetch_full_content: bool,
}

#[derive(Debug, Deserialize)]
struct KeyListResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

impl KvProvider {
    /// Creates a provider for the namespace described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: KvConfig) -> Result<Self> {
        let client = http_client(
            config.effective_timeout(),
            concat!("tempmail-sync/", env!("CARGO_PKG_VERSION")),
        )?;

        Ok(Self {
            client,
            base_url: config.namespace_url(),
            api_token: SecretString::from(config.api_token().unwrap_or_default().to_string()),
            fetch_full_content: false,
        })
    }

    /// Reads every indexed mail's full value instead of its preview.
    #[must_use]
    pub fn with_full_content(mut self, enabled: bool) -> Self {
        self.fetch_full_content = enabled;
        self
    }

    /// Lists one key to check that the credentials work.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`FetchError`] when the namespace is unreachable.
    pub async fn ping(&self) -> std::result::Result<(), FetchError> {
        self.list_keys("", 1).await.map(|_| ())
    }

    /// Reads one value; `Ok(None)` when the key does not exist.
    async fn get_value(&self, key: &str) -> std::result::Result<Option<Value>, FetchError> {
        let url = format!("{}/values/{}", self.base_url, urlencoding::encode(key));
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: self.base_url.clone(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        read_json(&self.base_url, response).await.map(Some)
    }

    async fn list_keys(&self, prefix: &str, limit: usize) -> std::result::Result<Vec<String>, FetchError> {
        let url = format!("{}/keys", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_token.expose_secret())
            .query(&[("prefix", prefix.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let body = read_json(&url, response).await?;
        let listing: KeyListResponse = serde_json::from_value(body)
            .map_err(|e| FetchError::payload(format!("invalid key listing: {e}")))?;

        if !listing.success {
            return Err(FetchError::payload("key listing reported failure"));
        }

        Ok(listing.result.into_iter().map(|entry| entry.name).collect())
    }

    async fn fetch_from_index(
        &self,
        address: &str,
        index: &Value,
    ) -> std::result::Result<Vec<MailRecord>, FetchError> {
        let items = payload::mail_items(index)?;
        let mut mails = Vec::with_capacity(items.len());

        for item in items {
            let full_key = item.get("key").and_then(Value::as_str);
            let full = match (self.fetch_full_content, full_key) {
                (true, Some(key)) => match self.get_value(key).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key, error = %e, "Failed to read full mail, using index preview");
                        None
                    }
                },
                _ => None,
            };

            let source = full.as_ref().unwrap_or(item);
            if let Some(mail) = payload::parse_mail_item(address, source) {
                mails.push(mail);
            }
        }

        Ok(mails)
    }

    async fn fetch_by_prefix(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        let keys = self.list_keys(&format!("mail:{address}:"), LIST_LIMIT).await?;
        debug!(count = keys.len(), "Listed per-mail keys");

        let mut mails = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_value(&key).await {
                Ok(Some(value)) => {
                    if let Some(mail) = payload::parse_mail_item(address, &value) {
                        mails.push(mail);
                    }
                }
                Ok(None) => debug!(key, "Mail key vanished between list and read"),
                Err(e) => warn!(key, error = %e, "Failed to read mail key, skipping"),
            }
        }

        Ok(mails)
    }
}

#[async_trait]
impl MailProvider for KvProvider {
    #[instrument(name = "KvProvider::fetch", skip(self))]
    async fn fetch(&self, address: &str) -> std::result::Result<Vec<MailRecord>, FetchError> {
        match self.get_value(&format!("index:{address}")).await? {
            Some(index) => {
                let mails = self.fetch_from_index(address, &index).await?;
                debug!(count = mails.len(), method = "index", "Fetched mail from KV");
                Ok(mails)
            }
            None => {
                let mails = self.fetch_by_prefix(address).await?;
                debug!(count = mails.len(), method = "prefix", "Fetched mail from KV");
                Ok(mails)
            }
        }
    }

    fn name(&self) -> &str {
        "cloudflare-kv"
    }
}
