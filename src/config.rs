//! Configuration for the mail synchronization core.
//!
//! Every component receives the section it needs at construction time. Use
//! [`SyncConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use tempmail_sync::SyncConfig;
//! use std::time::Duration;
//!
//! let config = SyncConfig::builder()
//!     .hot_ttl(Duration::from_secs(15))
//!     .poll_interval(Duration::from_secs(5))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.cache.stale_ttl, Duration::from_secs(300));
//! ```

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Top-level configuration.
///
/// Create using [`SyncConfig::builder()`] or [`SyncConfig::from_env()`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Two-tier cache settings.
    pub cache: CacheConfig,
    /// Long-poll settings.
    pub polling: PollingConfig,
    /// Cascade thresholds.
    pub extraction: ExtractionConfig,
    /// LLM strategy settings.
    pub llm: LlmConfig,
    /// External mail API settings.
    pub external_api: ExternalApiConfig,
    /// Cloudflare KV settings.
    pub kv: KvConfig,
    /// Lifetime of provisioned mailboxes.
    pub mailbox_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            polling: PollingConfig::default(),
            extraction: ExtractionConfig::default(),
            llm: LlmConfig::default(),
            external_api: ExternalApiConfig::default(),
            kv: KvConfig::default(),
            mailbox_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Cache TTLs and single-flight bounds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of the hot tier used on the normal read path.
    pub hot_ttl: Duration,
    /// Lifetime of the stale tier served only when the provider fails.
    pub stale_ttl: Duration,
    /// How long a caller waits on another caller's in-flight fetch.
    pub coalesce_wait: Duration,
    /// How long a completed fetch stays joinable for late callers.
    pub release_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(300),
            coalesce_wait: Duration::from_secs(3),
            release_grace: Duration::from_secs(1),
        }
    }
}

/// Polling configuration for wait operations.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval between polling attempts when waiting for mail.
    pub interval: Duration,
    /// Upper bound on any single wait; longer timeouts are capped.
    pub max_wait: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Confidence thresholds of the extraction cascade.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// A pattern result at or above this ends the cascade.
    pub pattern_threshold: f64,
    /// An LLM result at or above this ends the cascade.
    pub llm_threshold: f64,
    /// Codes below this are dropped by the waiter.
    pub min_confidence: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pattern_threshold: 0.85,
            llm_threshold: 0.80,
            min_confidence: 0.8,
        }
    }
}

/// Chat-completion endpoint used by the LLM strategy.
#[derive(Clone)]
pub struct LlmConfig {
    /// Whether the cascade may call the model at all.
    pub enabled: bool,
    /// Bearer key (protected from accidental logging).
    api_key: Option<SecretString>,
    /// Base URL; `/chat/completions` is appended.
    pub api_base: String,
    /// Model name.
    pub model: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_base: "https://api.openai.com/v1".into(),
            model: "gpt-3.5-turbo".into(),
            timeout: Duration::from_secs(30),
            temperature: 0.1,
            max_tokens: 500,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LlmConfig {
    /// Sets the API key.
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.api_key = (!key.trim().is_empty()).then(|| SecretString::from(key));
    }

    /// Returns the API key as a string slice.
    ///
    /// The key is intentionally not directly accessible to prevent accidental logging.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|secret| secret.expose_secret())
    }

    /// Returns `true` when the strategy is enabled and has a key.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }

    /// Full URL of the completion endpoint.
    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// External HTTP mail API.
#[derive(Debug, Clone)]
pub struct ExternalApiConfig {
    /// Endpoint queried with `?email=<address>`.
    pub url: String,
    /// Timeout of a single request.
    pub timeout: Duration,
    /// Retry retryable failures with a longer timeout.
    pub reliable: bool,
    /// Per-request timeout in reliable mode.
    pub reliable_timeout: Duration,
    /// Attempts in reliable mode.
    pub max_retries: u32,
    /// Delay between reliable-mode attempts.
    pub retry_delay: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for ExternalApiConfig {
    fn default() -> Self {
        Self {
            url: "https://mail.chatgpt.org.uk/api/get-emails".into(),
            timeout: Duration::from_secs(10),
            reliable: false,
            reliable_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            user_agent: concat!("tempmail-sync/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl ExternalApiConfig {
    /// Timeout applied to each request, depending on reliable mode.
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        if self.reliable {
            self.reliable_timeout
        } else {
            self.timeout
        }
    }

    /// Number of attempts per fetch, at least one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        if self.reliable {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

/// Cloudflare KV namespace holding routed mail.
#[derive(Clone, Default)]
pub struct KvConfig {
    /// Route addresses to KV at all.
    pub enabled: bool,
    /// Cloudflare account id.
    pub account_id: String,
    /// KV namespace id.
    pub namespace_id: String,
    /// API token (protected from accidental logging).
    pub(crate) api_token: Option<SecretString>,
    /// Domains served from KV. Empty means "see `custom_domains`".
    pub domains: Vec<String>,
    /// Custom domains the deployment owns; used when `domains` is empty.
    pub custom_domains: Vec<String>,
    /// Request timeout.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for KvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConfig")
            .field("enabled", &self.enabled)
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("domains", &self.domains)
            .field("custom_domains", &self.custom_domains)
            .finish_non_exhaustive()
    }
}

impl KvConfig {
    /// Sets the API token.
    pub fn set_api_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        self.api_token = (!token.trim().is_empty()).then(|| SecretString::from(token));
    }

    /// Returns the API token as a string slice.
    #[must_use]
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_ref().map(|secret| secret.expose_secret())
    }

    /// Base URL of the namespace REST API.
    #[must_use]
    pub fn namespace_url(&self) -> String {
        format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/storage/kv/namespaces/{}",
            self.account_id, self.namespace_id
        )
    }

    /// Request timeout, defaulting to 10 seconds.
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(10))
    }
}

impl SyncConfig {
    /// Creates a new configuration builder.
    ///
    /// # Example
    ///
    /// ```
    /// use tempmail_sync::SyncConfig;
    ///
    /// let config = SyncConfig::builder()
    ///     .llm_api_key("sk-test")
    ///     .use_llm(true)
    ///     .build()
    ///     .expect("valid config");
    /// assert!(config.llm.is_active());
    /// ```
    #[must_use]
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Reads configuration from process environment variables.
    ///
    /// Unset variables keep their defaults. See [`SyncConfig::from_env_with`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`, one variable name at a time.
    ///
    /// Recognized variables: `CACHE_HOT_TTL`, `CACHE_STALE_TTL`,
    /// `MAIL_CHECK_INTERVAL`, `EMAIL_TTL` (seconds), `USE_LLM_EXTRACTION`,
    /// `OPENAI_API_KEY`, `OPENAI_API_BASE`, `OPENAI_MODEL`, `EMAIL_API_URL`,
    /// `USE_CLOUDFLARE_KV`, `CF_ACCOUNT_ID`, `CF_KV_NAMESPACE_ID`,
    /// `CF_API_TOKEN`, `CF_KV_DOMAINS`, `CUSTOM_DOMAINS` (comma separated).
    ///
    /// # Errors
    ///
    /// Same as [`SyncConfig::from_env`].
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| Error::InvalidConfig {
                            message: format!("{key} must be a number of seconds, got '{raw}'"),
                        })
                })
                .transpose()
        };
        let flag = |key: &str| {
            lookup(key).map(|raw| {
                matches!(
                    raw.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
        };
        let list = |key: &str| {
            lookup(key)
                .map(|raw| {
                    raw.split(',')
                        .map(|d| d.trim().to_lowercase())
                        .filter(|d| !d.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let mut builder = SyncConfig::builder();

        if let Some(ttl) = secs("CACHE_HOT_TTL")? {
            builder = builder.hot_ttl(ttl);
        }
        if let Some(ttl) = secs("CACHE_STALE_TTL")? {
            builder = builder.stale_ttl(ttl);
        }
        if let Some(interval) = secs("MAIL_CHECK_INTERVAL")? {
            builder = builder.poll_interval(interval);
        }
        if let Some(ttl) = secs("EMAIL_TTL")? {
            builder = builder.mailbox_ttl(ttl);
        }
        if let Some(enabled) = flag("USE_LLM_EXTRACTION") {
            builder = builder.use_llm(enabled);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            builder = builder.llm_api_key(key);
        }
        if let Some(base) = lookup("OPENAI_API_BASE") {
            builder = builder.llm_api_base(base);
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            builder = builder.llm_model(model);
        }
        if let Some(url) = lookup("EMAIL_API_URL") {
            builder = builder.email_api_url(url);
        }

        if flag("USE_CLOUDFLARE_KV").unwrap_or(false) {
            let mut kv = KvConfig {
                enabled: true,
                account_id: lookup("CF_ACCOUNT_ID").unwrap_or_default(),
                namespace_id: lookup("CF_KV_NAMESPACE_ID").unwrap_or_default(),
                domains: list("CF_KV_DOMAINS"),
                custom_domains: list("CUSTOM_DOMAINS"),
                ..KvConfig::default()
            };
            kv.set_api_token(lookup("CF_API_TOKEN").unwrap_or_default());
            builder = builder.kv(kv);
        }

        builder.build()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    cache: Option<CacheConfig>,
    polling: Option<PollingConfig>,
    extraction: Option<ExtractionConfig>,
    llm: Option<LlmConfig>,
    external_api: Option<ExternalApiConfig>,
    kv: Option<KvConfig>,
    mailbox_ttl: Option<Duration>,
}

impl SyncConfigBuilder {
    /// Sets cache configuration.
    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the hot tier lifetime.
    #[must_use]
    pub fn hot_ttl(mut self, ttl: Duration) -> Self {
        self.cache.get_or_insert_with(CacheConfig::default).hot_ttl = ttl;
        self
    }

    /// Sets the stale tier lifetime.
    #[must_use]
    pub fn stale_ttl(mut self, ttl: Duration) -> Self {
        self.cache.get_or_insert_with(CacheConfig::default).stale_ttl = ttl;
        self
    }

    /// Sets polling configuration.
    #[must_use]
    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Sets the polling interval for wait operations.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .interval = interval;
        self
    }

    /// Sets the default wait time for wait operations.
    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .max_wait = max_wait;
        self
    }

    /// Sets extraction thresholds.
    #[must_use]
    pub fn extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = Some(extraction);
        self
    }

    /// Sets the minimum confidence kept by the waiter.
    #[must_use]
    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.extraction
            .get_or_insert_with(ExtractionConfig::default)
            .min_confidence = min_confidence;
        self
    }

    /// Sets LLM configuration.
    #[must_use]
    pub fn llm(mut self, llm: LlmConfig) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Enables or disables the LLM strategy.
    #[must_use]
    pub fn use_llm(mut self, enabled: bool) -> Self {
        self.llm.get_or_insert_with(LlmConfig::default).enabled = enabled;
        self
    }

    /// Sets the LLM API key.
    #[must_use]
    pub fn llm_api_key(mut self, key: impl Into<String>) -> Self {
        self.llm
            .get_or_insert_with(LlmConfig::default)
            .set_api_key(key);
        self
    }

    /// Sets the LLM API base URL.
    #[must_use]
    pub fn llm_api_base(mut self, base: impl Into<String>) -> Self {
        self.llm.get_or_insert_with(LlmConfig::default).api_base = base.into();
        self
    }

    /// Sets the LLM model name.
    #[must_use]
    pub fn llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm.get_or_insert_with(LlmConfig::default).model = model.into();
        self
    }

    /// Sets external mail API configuration.
    #[must_use]
    pub fn external_api(mut self, external_api: ExternalApiConfig) -> Self {
        self.external_api = Some(external_api);
        self
    }

    /// Sets the external mail API endpoint.
    #[must_use]
    pub fn email_api_url(mut self, url: impl Into<String>) -> Self {
        self.external_api
            .get_or_insert_with(ExternalApiConfig::default)
            .url = url.into();
        self
    }

    /// Enables retries with a longer timeout for the external API.
    #[must_use]
    pub fn reliable_fetch(mut self, reliable: bool) -> Self {
        self.external_api
            .get_or_insert_with(ExternalApiConfig::default)
            .reliable = reliable;
        self
    }

    /// Sets Cloudflare KV configuration.
    #[must_use]
    pub fn kv(mut self, kv: KvConfig) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Sets the lifetime of provisioned mailboxes.
    #[must_use]
    pub fn mailbox_ttl(mut self, ttl: Duration) -> Self {
        self.mailbox_ttl = Some(ttl);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a value is out of range or KV is
    /// enabled without credentials.
    pub fn build(self) -> Result<SyncConfig> {
        let cache = self.cache.unwrap_or_default();
        if cache.hot_ttl.is_zero() || cache.stale_ttl.is_zero() {
            return Err(invalid("cache TTLs must be non-zero"));
        }
        if cache.hot_ttl > cache.stale_ttl {
            return Err(invalid("hot TTL must not exceed stale TTL"));
        }

        let polling = self.polling.unwrap_or_default();
        if polling.interval.is_zero() {
            return Err(invalid("poll interval must be non-zero"));
        }

        let extraction = self.extraction.unwrap_or_default();
        for (name, value) in [
            ("pattern_threshold", extraction.pattern_threshold),
            ("llm_threshold", extraction.llm_threshold),
            ("min_confidence", extraction.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }

        let kv = self.kv.unwrap_or_default();
        if kv.enabled {
            if kv.account_id.trim().is_empty() || kv.namespace_id.trim().is_empty() {
                return Err(invalid("KV account id and namespace id are required"));
            }
            if kv.api_token.is_none() {
                return Err(invalid("KV api token is required"));
            }
        }

        let mailbox_ttl = self.mailbox_ttl.unwrap_or(Duration::from_secs(3600));
        if mailbox_ttl.is_zero() {
            return Err(invalid("mailbox ttl must be non-zero"));
        }

        Ok(SyncConfig {
            cache,
            polling,
            extraction,
            llm: self.llm.unwrap_or_default(),
            external_api: self.external_api.unwrap_or_default(),
            kv,
            mailbox_ttl,
        })
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}
