//! Example: Plugging a custom mail source into the service.
//!
//! Implements [`MailProvider`] over an in-memory inbox, then shows the cache
//! coalescing concurrent reads and the extraction cascade picking up a
//! learned template.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example custom_provider
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempmail_sync::provider::MailProvider;
use tempmail_sync::{FetchError, MailRecord, MailService, SyncConfig};

/// An inbox filled by the program itself.
#[derive(Default)]
struct MemoryInbox {
    mails: Mutex<Vec<MailRecord>>,
    fetches: AtomicUsize,
}

impl MemoryInbox {
    fn deliver(&self, mail: MailRecord) {
        self.mails.lock().expect("inbox lock").push(mail);
    }
}

#[async_trait]
impl MailProvider for MemoryInbox {
    async fn fetch(&self, address: &str) -> Result<Vec<MailRecord>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mails = self.mails.lock().expect("inbox lock");
        Ok(mails.iter().filter(|m| m.address == address).cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[tokio::main]
async fn main() -> tempmail_sync::Result<()> {
    let inbox = Arc::new(MemoryInbox::default());
    let service = MailService::with_provider(SyncConfig::default(), inbox.clone())?;

    let address = "demo@example.com";
    inbox.deliver(MailRecord::new(
        address,
        "accounts@shop.example",
        "Sign in to Shop",
        "Hello! Your login key -> 7Q4KZ2 <- expires soon.",
        Utc::now(),
    ));

    // Ten concurrent readers, one upstream fetch
    let readers = (0..10).map(|_| {
        let cache = Arc::clone(service.cache());
        tokio::spawn(async move { cache.get_or_fetch(address, false).await })
    });
    for reader in readers {
        let lookup = reader.await.expect("reader task");
        assert_eq!(lookup.mails.len(), 1);
    }
    println!("Upstream fetches: {}", inbox.fetches.load(Ordering::SeqCst));

    let mailbox = service.open_mailbox(address).await?;
    let mails = service.list_mails(&mailbox.token, Some(10), 0, false).await?;
    let mail = &mails[0];

    let (annotated, stats) = service.extract_codes(&mailbox.token, Some(&mail.id), None).await?;
    println!("Before learning: {:?} via {:?}", annotated[0].codes, stats.method_used);

    let template = service.learn_pattern(&mailbox.token, &mail.id, "7Q4KZ2", None)?;
    println!("Learned template {} ({} chars, {})", template.id, template.code_length, template.kind);

    let (annotated, stats) = service.extract_codes(&mailbox.token, Some(&mail.id), None).await?;
    println!("After learning: {:?} via {:?}", annotated[0].codes, stats.method_used);

    println!("{:#?}", service.stats());
    Ok(())
}
