//! Example: Wait for a verification code on a disposable address.
//!
//! Opens a mailbox, then long-polls until a mail carrying a code arrives.
//! Press Ctrl+C to cancel the wait.
//!
//! # Usage
//!
//! ```bash
//! export EMAIL_API_URL="https://mail.example.com/api/emails"
//! export TEMPMAIL_ADDRESS="signup-42@mail.example.com"
//! # Optional: LLM stage of the cascade
//! export USE_LLM_EXTRACTION=true
//! export OPENAI_API_KEY="sk-..."
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=tempmail_sync=debug
//!
//! cargo run --example wait_for_code
//! ```

use chrono::Utc;
use std::env;
use std::time::Duration;
use tempmail_sync::{CancelFlag, CodeWaitOutcome, MailService, SyncConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> tempmail_sync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tempmail_sync=info")),
        )
        .with_target(true)
        .init();

    dotenvy::dotenv().ok();
    let address =
        env::var("TEMPMAIL_ADDRESS").expect("TEMPMAIL_ADDRESS environment variable required");

    let config = SyncConfig::from_env()?;
    let max_wait = config.polling.max_wait;
    let service = MailService::new(config)?;

    let mailbox = service.open_mailbox(&address).await?;
    println!(
        "Mailbox {} ready ({} mails already there), waiting up to {}s...",
        mailbox.address,
        mailbox.mail_count,
        max_wait.as_secs()
    );

    let cancel = CancelFlag::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let outcome = service
        .wait_for_code_with_cancel(&mailbox.token, Utc::now(), max_wait, None, Some(&cancel))
        .await?;

    match outcome {
        CodeWaitOutcome::Found(found) => {
            println!(
                "Code {} ({}, confidence {:.2}) from {} via {:?}",
                found.code.value(),
                found.code.kind(),
                found.code.confidence(),
                found.mail.sender,
                found.stats.method_used,
            );
        }
        CodeWaitOutcome::NoCode { mails, .. } => {
            println!("{} new mails, none with a code", mails.len());
            for mail in mails {
                for link in service.links(&mailbox.token, &mail.id)? {
                    if link.verification {
                        println!("Verification link: {}", link.url);
                    }
                }
            }
        }
        CodeWaitOutcome::TimedOut => println!("No mail within {}s", max_wait.as_secs()),
        CodeWaitOutcome::Cancelled => println!("Cancelled"),
    }

    service.delete_mailbox(&mailbox.token);
    Ok(())
}
