//! Per-domain routing between mail sources.
//!
//! Deployments that own custom domains receive their mail through a
//! Cloudflare worker into KV, while public disposable domains are read from the
//! external API. The [`SourceRegistry`] decides which source serves an address.
//!
//! # Example
//!
//! ```
//! use tempmail_sync::provider::{MailSource, SourceRegistry};
//!
//! let mut registry = SourceRegistry::new();
//! registry.register("mail.mycompany.com", MailSource::Kv);
//!
//! assert_eq!(registry.resolve("user@mail.mycompany.com"), MailSource::Kv);
//! assert_eq!(registry.resolve("user@other.org"), MailSource::ExternalApi);
//! ```

use super::MailProvider;
use crate::config::KvConfig;
use crate::error::FetchError;
use crate::model::MailRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Upstream source serving an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailSource {
    /// The external HTTP mail API.
    ExternalApi,
    /// The Cloudflare KV namespace.
    Kv,
}

/// A customizable registry for domain-to-source routing.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    custom: HashMap<String, MailSource>,
    fallback: MailSource,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    /// Creates a registry that sends every address to the external API.
    #[must_use]
    pub fn new() -> Self {
        Self {
            custom: HashMap::new(),
            fallback: MailSource::ExternalApi,
        }
    }

    /// Creates a registry that sends every unregistered address to `fallback`.
    #[must_use]
    pub fn with_fallback(fallback: MailSource) -> Self {
        Self {
            custom: HashMap::new(),
            fallback,
        }
    }

    /// Derives routing from KV settings.
    ///
    /// Resolution order:
    /// 1. KV disabled: everything goes to the external API
    /// 2. `domains` set: only those domains go to KV
    /// 3. `custom_domains` set: only those domains go to KV
    /// 4. Otherwise every address goes to KV
    #[must_use]
    pub fn from_kv_config(config: &KvConfig) -> Self {
        if !config.enabled {
            return Self::new();
        }

        let routed = if config.domains.is_empty() {
            &config.custom_domains
        } else {
            &config.domains
        };

        if routed.is_empty() {
            return Self::with_fallback(MailSource::Kv);
        }

        let mut registry = Self::new();
        registry.register_many(routed.iter().map(|domain| (domain.as_str(), MailSource::Kv)));
        registry
    }

    /// Registers a domain-to-source mapping, overriding any existing one.
    pub fn register(&mut self, domain: impl Into<String>, source: MailSource) {
        self.custom.insert(domain.into().trim().to_lowercase(), source);
    }

    /// Registers multiple domain mappings at once.
    pub fn register_many<I, D>(&mut self, mappings: I)
    where
        I: IntoIterator<Item = (D, MailSource)>,
        D: Into<String>,
    {
        for (domain, source) in mappings {
            self.register(domain, source);
        }
    }

    /// Removes a mapping.
    pub fn unregister(&mut self, domain: &str) -> Option<MailSource> {
        self.custom.remove(&domain.to_lowercase())
    }

    /// Resolves the source for an address (or a bare domain).
    #[must_use]
    pub fn resolve(&self, address: &str) -> MailSource {
        let domain = domain_of(address);
        self.custom.get(&domain).copied().unwrap_or(self.fallback)
    }

    /// Returns `true` if the domain has an explicit mapping.
    #[must_use]
    pub fn is_known(&self, domain: &str) -> bool {
        self.custom.contains_key(&domain.to_lowercase())
    }

    /// Returns all explicitly mapped domains.
    #[must_use]
    pub fn domains(&self) -> Vec<&str> {
        self.custom.keys().map(String::as_str).collect()
    }

    /// Returns the number of explicit mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.custom.len()
    }

    /// Returns `true` if the registry has no explicit mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.custom.is_empty()
    }
}

/// Lowercased domain part of an address.
fn domain_of(address: &str) -> String {
    address
        .rsplit_once('@')
        .map_or(address, |(_, domain)| domain)
        .trim()
        .to_lowercase()
}

/// Provider that dispatches each address to the external API or KV.
pub struct RoutingProvider {
    external: Arc<dyn MailProvider>,
    kv: Arc<dyn MailProvider>,
    registry: SourceRegistry,
}

impl RoutingProvider {
    /// Creates a routing provider.
    pub fn new(
        external: impl MailProvider + 'static,
        kv: impl MailProvider + 'static,
        registry: SourceRegistry,
    ) -> Self {
        Self {
            external: Arc::new(external),
            kv: Arc::new(kv),
            registry,
        }
    }

    /// The routing table in use.
    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }
}

#[async_trait]
impl MailProvider for RoutingProvider {
    async fn fetch(&self, address: &str) -> Result<Vec<MailRecord>, FetchError> {
        let source = self.registry.resolve(address);
        debug!(address, ?source, "Routing mail fetch");

        match source {
            MailSource::ExternalApi => self.external.fetch(address).await,
            MailSource::Kv => self.kv.fetch(address).await,
        }
    }

    fn name(&self) -> &str {
        "routing"
    }
}

impl std::fmt::Debug for RoutingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingProvider")
            .field("external", &self.external.name())
            .field("kv", &self.kv.name())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FnProvider;
    use chrono::Utc;

    fn kv_config(domains: &[&str], custom: &[&str]) -> KvConfig {
        KvConfig {
            enabled: true,
            domains: domains.iter().map(|d| (*d).to_string()).collect(),
            custom_domains: custom.iter().map(|d| (*d).to_string()).collect(),
            ..KvConfig::default()
        }
    }

    #[test]
    fn test_kv_disabled_routes_external() {
        let registry = SourceRegistry::from_kv_config(&KvConfig::default());
        assert_eq!(registry.resolve("a@anything.com"), MailSource::ExternalApi);
    }

    #[test]
    fn test_kv_without_domains_routes_everything() {
        let registry = SourceRegistry::from_kv_config(&kv_config(&[], &[]));
        assert_eq!(registry.resolve("a@anything.com"), MailSource::Kv);
    }

    #[test]
    fn test_kv_custom_domains_when_no_kv_domains() {
        let registry = SourceRegistry::from_kv_config(&kv_config(&[], &["mine.dev"]));
        assert_eq!(registry.resolve("a@mine.dev"), MailSource::Kv);
        assert_eq!(registry.resolve("a@public.com"), MailSource::ExternalApi);
    }

    #[test]
    fn test_kv_domains_case_insensitive() {
        let registry = SourceRegistry::from_kv_config(&kv_config(&["Mail.Example.com"], &["x.dev"]));
        assert_eq!(registry.resolve("A@MAIL.EXAMPLE.COM"), MailSource::Kv);
        // explicit KV domains take precedence over custom domains
        assert_eq!(registry.resolve("a@x.dev"), MailSource::ExternalApi);
        assert!(registry.is_known("mail.example.com"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_overrides_and_unregister() {
        let mut registry = SourceRegistry::with_fallback(MailSource::Kv);
        registry.register("public.com", MailSource::ExternalApi);
        assert_eq!(registry.resolve("a@public.com"), MailSource::ExternalApi);
        assert_eq!(registry.unregister("PUBLIC.com"), Some(MailSource::ExternalApi));
        assert_eq!(registry.resolve("a@public.com"), MailSource::Kv);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_routing_provider_dispatch() {
        let external = FnProvider::new("external", |address: String| async move {
            Ok(vec![MailRecord::new(address, "external", "s", "b", Utc::now())])
        });
        let kv = FnProvider::new("kv", |address: String| async move {
            Ok(vec![MailRecord::new(address, "kv", "s", "b", Utc::now())])
        });
        let mut registry = SourceRegistry::new();
        registry.register("mine.dev", MailSource::Kv);
        let provider = RoutingProvider::new(external, kv, registry);

        let mails = provider.fetch("a@mine.dev").await.unwrap();
        assert_eq!(mails[0].sender, "kv");

        let mails = provider.fetch("a@public.com").await.unwrap();
        assert_eq!(mails[0].sender, "external");
    }
}
