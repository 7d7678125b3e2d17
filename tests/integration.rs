//! Integration tests for tempmail-sync.
//!
//! The offline tests drive the public API over in-process providers with a
//! paused clock. The live tests talk to real services and are ignored by default.
//! To run them:
//!
//! ```bash
//! # Set environment variables (or put them in .env)
//! export EMAIL_API_URL="https://mail.example.com/api/emails"
//! export TEMPMAIL_SYNC_TEST_ADDRESS="someone@mail.example.com"
//!
//! # Optional: LLM extraction
//! export OPENAI_API_KEY="sk-..."
//!
//! cargo test --features integration-tests -- --ignored
//! ```

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempmail_sync::extract::{CodeExtractor, LlmExtractor, RegexExtractor};
use tempmail_sync::provider::{FnProvider, MailProvider};
use tempmail_sync::{
    CacheConfig, CancelFlag, CodeKind, CodeWaitOutcome, ExtractedCode, ExtractionConfig,
    ExtractionError, ExtractionMethod, ExtractionPipeline, FetchError, LookupSource, MailCache,
    MailRecord, MailService, MailStore, MailWaiter, Mailbox, PollingConfig, SyncConfig,
    WaitOutcome,
};
use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn mail(subject: &str, body: &str, age_secs: i64) -> MailRecord {
    MailRecord::new(
        "me@example.com",
        "noreply@site.com",
        subject,
        body,
        Utc::now() - ChronoDuration::seconds(age_secs),
    )
}

/// Provider that counts calls, sleeps `delay` per call, and fails while `failing` is set.
fn counting_provider(
    mails: Vec<MailRecord>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
) -> impl MailProvider {
    FnProvider::new("counting", move |_| {
        let mails = mails.clone();
        let calls = Arc::clone(&calls);
        let failing = Arc::clone(&failing);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            if failing.load(Ordering::SeqCst) {
                Err(FetchError::payload("upstream down"))
            } else {
                Ok(mails)
            }
        }
    })
}

struct FixedExtractor {
    method: ExtractionMethod,
    codes: Vec<ExtractedCode>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CodeExtractor for FixedExtractor {
    fn method(&self) -> ExtractionMethod {
        self.method
    }

    async fn extract(&self, _text: &str) -> Result<Vec<ExtractedCode>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.codes.clone())
    }
}

fn get_live_config() -> Option<(SyncConfig, String)> {
    dotenvy::dotenv().ok();
    let address = env::var("TEMPMAIL_SYNC_TEST_ADDRESS").ok()?;
    let config = SyncConfig::from_env().ok()?;
    Some((config, address))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = counting_provider(
        vec![mail("Hi", "hello", 5)],
        Duration::from_millis(200),
        Arc::clone(&calls),
        Arc::default(),
    );
    let cache = MailCache::new(Arc::new(provider), CacheConfig::default());

    let lookups = futures::future::join_all(
        (0..20).map(|_| {
            let cache = cache.clone();
            async move { cache.get_or_fetch("me@example.com", false).await }
        }),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(lookups.iter().all(|l| l.mails.len() == 1));
    assert_eq!(cache.stats().coalesced, 19);
}

#[tokio::test(start_paused = true)]
async fn test_failures_fall_back_to_stale_then_empty() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(AtomicBool::new(false));
    let provider = counting_provider(
        vec![mail("Hi", "hello", 5)],
        Duration::ZERO,
        Arc::clone(&calls),
        Arc::clone(&failing),
    );
    let config = CacheConfig::default();
    let cache = MailCache::new(Arc::new(provider), config.clone());

    let first = cache.get_or_fetch("me@example.com", false).await;
    assert_eq!(first.source, LookupSource::Upstream);

    failing.store(true, Ordering::SeqCst);
    tokio::time::advance(config.hot_ttl + Duration::from_secs(1)).await;
    let stale = cache.get_or_fetch("me@example.com", false).await;
    assert_eq!(stale.source, LookupSource::Stale);
    assert_eq!(stale.mails.len(), 1);

    tokio::time::advance(config.stale_ttl).await;
    let empty = cache.get_or_fetch("me@example.com", false).await;
    assert_eq!(empty.source, LookupSource::Empty);
    assert!(empty.mails.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Waiter Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_on_old_mail_only() {
    let provider = counting_provider(
        vec![mail("Old", "old news", 600)],
        Duration::ZERO,
        Arc::default(),
        Arc::default(),
    );
    let cache = Arc::new(MailCache::new(Arc::new(provider), CacheConfig::default()));
    let waiter = MailWaiter::new(cache, PollingConfig::default());

    let started = Instant::now();
    let outcome = waiter
        .wait_for_new_mail(
            "me@example.com",
            Utc::now() - ChronoDuration::seconds(60),
            Duration::from_secs(1),
            None,
        )
        .await;

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_wait_cancelled_from_another_task() {
    let provider = counting_provider(Vec::new(), Duration::ZERO, Arc::default(), Arc::default());
    let cache = Arc::new(MailCache::new(Arc::new(provider), CacheConfig::default()));
    let waiter = MailWaiter::new(cache, PollingConfig::default());

    let flag = CancelFlag::new();
    let remote = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        remote.cancel();
    });

    let started = Instant::now();
    let outcome = waiter
        .wait_for_new_mail("me@example.com", Utc::now(), Duration::from_secs(120), Some(&flag))
        .await;

    assert_eq!(outcome, WaitOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(30));
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_store_dedup_and_pagination() {
    let store = MailStore::new();
    let mailbox = Mailbox::provision("me@example.com", Duration::from_secs(3600)).unwrap();
    let token = mailbox.token.clone();
    store.register_mailbox(mailbox);

    let batch = vec![
        mail("third", "c", 10),
        mail("first", "a", 30),
        mail("second", "b", 20),
    ];
    assert_eq!(store.save_mails(&token, batch.clone()).unwrap(), 3);
    assert_eq!(store.save_mails(&token, batch).unwrap(), 0);

    let page: Vec<String> = store
        .get_mails(&token, Some(1), 1)
        .unwrap()
        .into_iter()
        .map(|m| m.subject)
        .collect();
    assert_eq!(page, ["second"]);

    let err = store.get_mails("missing", None, 0).unwrap_err();
    assert!(err.is_not_found());
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_builtin_rules_pick_keyword_code() {
    let codes = RegexExtractor::new()
        .extract("Your verification code is 482931. Valid until 2025.")
        .await
        .unwrap();

    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].value(), "482931");
    assert_eq!(codes[0].kind(), CodeKind::Numeric);
    assert_eq!(codes[0].length(), 6);
    assert!((codes[0].confidence() - 0.95).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_confident_pattern_skips_later_stages() {
    let llm_calls = Arc::new(AtomicUsize::new(0));
    let pattern: Arc<dyn CodeExtractor> = Arc::new(FixedExtractor {
        method: ExtractionMethod::Pattern,
        codes: vec![ExtractedCode::new("KX72QP", CodeKind::Alphanumeric, "user_pattern", 0.90)],
        calls: Arc::default(),
    });
    let llm: Arc<dyn CodeExtractor> = Arc::new(FixedExtractor {
        method: ExtractionMethod::Llm,
        codes: Vec::new(),
        calls: Arc::clone(&llm_calls),
    });
    let regex: Arc<dyn CodeExtractor> = Arc::new(RegexExtractor::new());
    let pipeline =
        ExtractionPipeline::with_extractors(&ExtractionConfig::default(), vec![pattern, llm, regex])
            .unwrap();

    let outcome = pipeline
        .extract_smart(&mail("Code", "Login key KX72QP", 1), None)
        .await
        .unwrap();

    assert_eq!(outcome.method_used, ExtractionMethod::Pattern);
    assert_eq!(outcome.best().unwrap().value(), "KX72QP");
    assert_eq!(llm_calls.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_service_wait_for_code_flow() {
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&delivered);
    let code_mail = mail("Your code", "验证码：836201，5分钟内有效", 0);
    let provider = FnProvider::new("late", move |_| {
        let mails = if flag.load(Ordering::SeqCst) {
            vec![code_mail.clone()]
        } else {
            Vec::new()
        };
        async move { Ok(mails) }
    });
    let service = MailService::with_provider(SyncConfig::default(), Arc::new(provider)).unwrap();
    let mailbox = service.open_mailbox("me@example.com").await.unwrap();
    let since = Utc::now() - ChronoDuration::seconds(5);

    let trigger = Arc::clone(&delivered);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        trigger.store(true, Ordering::SeqCst);
    });

    let outcome = service
        .wait_for_code(&mailbox.token, since, Duration::from_secs(120), None)
        .await
        .unwrap();
    let CodeWaitOutcome::Found(found) = outcome else {
        panic!("expected a code, got {outcome:?}");
    };
    assert_eq!(found.code.value(), "836201");
    assert_eq!(found.stats.method_used, Some(ExtractionMethod::Regex));

    let stored = service.read_mail(&mailbox.token, &found.mail.id).unwrap();
    assert!(stored.is_read);
    assert_eq!(stored.codes.unwrap()[0].value(), "836201");
}

#[tokio::test(start_paused = true)]
async fn test_service_degrades_when_provider_fails() {
    let provider = FnProvider::new("down", |_| async { Err(FetchError::payload("boom")) });
    let service = MailService::with_provider(SyncConfig::default(), Arc::new(provider)).unwrap();

    let mailbox = service.open_mailbox("me@example.com").await.unwrap();
    assert_eq!(mailbox.mail_count, 0);
    assert!(service
        .list_mails(&mailbox.token, None, 0, false)
        .await
        .unwrap()
        .is_empty());
    assert!(service.stats().cache.empty_served >= 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Live Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires a reachable mail API"]
async fn test_live_fetch_through_cache() {
    let Some((config, address)) = get_live_config() else {
        eprintln!("Skipping: TEMPMAIL_SYNC_TEST_ADDRESS not set");
        return;
    };

    let provider = tempmail_sync::provider::from_config(&config).expect("provider");
    let cache = MailCache::new(provider, config.cache.clone());

    let first = cache.get_or_fetch(&address, false).await;
    println!("Fetched {} mails from {:?}", first.mails.len(), first.source);

    let second = cache.get_or_fetch(&address, false).await;
    assert_eq!(second.source, LookupSource::Hot);
}

#[tokio::test]
#[ignore = "requires a reachable mail API"]
async fn test_live_wait_times_out() {
    let Some((config, address)) = get_live_config() else {
        eprintln!("Skipping: TEMPMAIL_SYNC_TEST_ADDRESS not set");
        return;
    };

    let service = MailService::new(config).expect("service");
    let mailbox = service.open_mailbox(&address).await.expect("mailbox");

    let started = std::time::Instant::now();
    let (outcome, _) = service
        .wait(&mailbox.token, Utc::now(), Duration::from_secs(5), None, None)
        .await
        .expect("wait");
    println!("Outcome after {:?}: {outcome:?}", started.elapsed());
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
#[ignore = "requires OPENAI_API_KEY"]
async fn test_live_llm_extraction() {
    dotenvy::dotenv().ok();
    let Ok(config) = SyncConfig::from_env() else {
        return;
    };
    if !config.llm.is_active() {
        eprintln!("Skipping: LLM extraction not configured");
        return;
    }

    let extractor = LlmExtractor::new(config.llm).expect("extractor");
    let codes = extractor
        .extract("Hello! Use 731904 to finish signing in. Do not share it.")
        .await
        .expect("llm call");

    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].value(), "731904");
}
