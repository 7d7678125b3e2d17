//! In-memory, deduplicating mail store keyed by mailbox token.
//!
//! The store owns the authoritative mail list of every registered mailbox.
//! Each mailbox sits behind its own lock, so writes to one mailbox never wait
//! on another.
//!
//! ```
//! use tempmail_sync::{MailStore, Mailbox, MailRecord};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! let store = MailStore::new();
//! let mailbox = Mailbox::provision("me@example.com", Duration::from_secs(3600)).unwrap();
//! let token = mailbox.token.clone();
//! store.register_mailbox(mailbox);
//!
//! let mail = MailRecord::new("me@example.com", "bot@site.com", "Hi", "Code 123456", Utc::now());
//! assert_eq!(store.save_mails(&token, vec![mail.clone()]).unwrap(), 1);
//! assert_eq!(store.save_mails(&token, vec![mail]).unwrap(), 0);
//! ```

use crate::cache::lock;
use crate::error::{Error, Result};
use crate::model::{ExtractedCode, MailRecord, Mailbox};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

#[derive(Debug)]
struct MailboxState {
    mailbox: Mailbox,
    mails: Vec<MailRecord>,
    ids: HashSet<String>,
}

impl MailboxState {
    fn snapshot(&self) -> Mailbox {
        let mut mailbox = self.mailbox.clone();
        mailbox.mail_count = self.mails.len();
        mailbox
    }

    /// Mails newest first. Equal timestamps keep insertion order.
    fn sorted(&self) -> Vec<&MailRecord> {
        let mut mails: Vec<&MailRecord> = self.mails.iter().collect();
        mails.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        mails
    }
}

type SharedState = Arc<Mutex<MailboxState>>;

/// Snapshot of store contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Registered mailboxes.
    pub mailboxes: usize,
    /// Stored mails across all mailboxes.
    pub mails: usize,
    /// Stored mails not yet marked read.
    pub unread: usize,
}

/// Deduplicating, paginated mail store.
#[derive(Debug, Default)]
pub struct MailStore {
    mailboxes: Mutex<HashMap<String, SharedState>>,
    addresses: Mutex<HashMap<String, String>>,
}

impl MailStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mailbox, replacing any mailbox previously holding its address.
    pub fn register_mailbox(&self, mailbox: Mailbox) {
        let token = mailbox.token.clone();
        let address = mailbox.address.to_lowercase();
        let state = Arc::new(Mutex::new(MailboxState {
            mailbox,
            mails: Vec::new(),
            ids: HashSet::new(),
        }));

        let previous = lock(&self.addresses).insert(address.clone(), token.clone());
        let mut mailboxes = lock(&self.mailboxes);
        if let Some(old_token) = previous.filter(|old| *old != token) {
            mailboxes.remove(&old_token);
        }
        mailboxes.insert(token, state);
        debug!(address = %address, "Mailbox registered");
    }

    /// Returns the mailbox with its current mail count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn mailbox(&self, token: &str) -> Result<Mailbox> {
        let state = self.state(token)?;
        let guard = lock(&state);
        Ok(guard.snapshot())
    }

    /// Looks a mailbox up by address (case-insensitive).
    #[must_use]
    pub fn mailbox_by_address(&self, address: &str) -> Option<Mailbox> {
        let token = lock(&self.addresses).get(&address.to_lowercase()).cloned()?;
        self.mailbox(&token).ok()
    }

    /// Resolves a token to its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn address_for(&self, token: &str) -> Result<String> {
        let state = self.state(token)?;
        let address = lock(&state).mailbox.address.clone();
        Ok(address)
    }

    /// Merges `incoming` into the mailbox, skipping mails whose id is already stored.
    ///
    /// Returns how many mails were added. Replaying the same payload adds nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    #[instrument(name = "MailStore::save_mails", skip_all, fields(token = %token))]
    pub fn save_mails(
        &self,
        token: &str,
        incoming: impl IntoIterator<Item = MailRecord>,
    ) -> Result<usize> {
        let state = self.state(token)?;
        let mut guard = lock(&state);

        let mut added = 0;
        for mail in incoming {
            if guard.ids.insert(mail.id.clone()) {
                guard.mails.push(mail);
                added += 1;
            }
        }
        guard.mailbox.mail_count = guard.mails.len();

        if added > 0 {
            debug!(added, total = guard.mails.len(), "Stored new mails");
        }
        Ok(added)
    }

    /// Returns mails newest first, skipping `offset` and taking up to `limit`.
    ///
    /// `limit = None` returns everything after `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn get_mails(
        &self,
        token: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<MailRecord>> {
        let state = self.state(token)?;
        let guard = lock(&state);
        let page = guard
            .sorted()
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(page)
    }

    /// Returns unread mails newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn get_unread(&self, token: &str) -> Result<Vec<MailRecord>> {
        let state = self.state(token)?;
        let guard = lock(&state);
        Ok(guard
            .sorted()
            .into_iter()
            .filter(|mail| !mail.is_read)
            .cloned()
            .collect())
    }

    /// Marks a mail read. Returns `false` if the mailbox has no such mail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn mark_read(&self, token: &str, mail_id: &str) -> Result<bool> {
        let state = self.state(token)?;
        let mut guard = lock(&state);
        Ok(guard
            .mails
            .iter_mut()
            .find(|mail| mail.id == mail_id)
            .map(|mail| mail.is_read = true)
            .is_some())
    }

    /// Returns one mail by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens and
    /// [`Error::MailNotFound`] for unknown ids.
    pub fn get_by_id(&self, token: &str, mail_id: &str) -> Result<MailRecord> {
        let state = self.state(token)?;
        let guard = lock(&state);
        guard
            .mails
            .iter()
            .find(|mail| mail.id == mail_id)
            .cloned()
            .ok_or_else(|| Error::MailNotFound {
                token: token.to_string(),
                mail_id: mail_id.to_string(),
            })
    }

    /// Stores extraction results on a mail. Returns `false` if the mailbox has no such mail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] for unknown tokens.
    pub fn set_codes(&self, token: &str, mail_id: &str, codes: Vec<ExtractedCode>) -> Result<bool> {
        let state = self.state(token)?;
        let mut guard = lock(&state);
        match guard.mails.iter_mut().find(|mail| mail.id == mail_id) {
            Some(mail) => {
                mail.codes = Some(codes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes a mailbox and all its mail. Returns `false` for unknown tokens.
    #[instrument(name = "MailStore::delete_mailbox", skip_all, fields(token = %token))]
    pub fn delete_mailbox(&self, token: &str) -> bool {
        let Some(state) = lock(&self.mailboxes).remove(token) else {
            return false;
        };
        let address = lock(&state).mailbox.address.to_lowercase();

        let mut addresses = lock(&self.addresses);
        if addresses.get(&address).is_some_and(|owner| owner == token) {
            addresses.remove(&address);
        }
        info!(address = %address, "Mailbox deleted");
        true
    }

    /// Removes every mailbox whose expiry has passed. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.remove_expired_at(Utc::now()).len()
    }

    /// Removes every mailbox expired at `now` and returns them.
    #[instrument(name = "MailStore::remove_expired_at", skip(self))]
    pub fn remove_expired_at(&self, now: DateTime<Utc>) -> Vec<Mailbox> {
        let expired: Vec<Mailbox> = lock(&self.mailboxes)
            .values()
            .filter_map(|state| {
                let guard = lock(state);
                guard.mailbox.is_expired_at(now).then(|| guard.snapshot())
            })
            .collect();

        for mailbox in &expired {
            self.delete_mailbox(&mailbox.token);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Expired mailboxes removed");
        }
        expired
    }

    /// Returns counts across all mailboxes.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        lock(&self.mailboxes)
            .values()
            .fold(StoreStats::default(), |mut stats, state| {
                let guard = lock(state);
                stats.mailboxes += 1;
                stats.mails += guard.mails.len();
                stats.unread += guard.mails.iter().filter(|m| !m.is_read).count();
                stats
            })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    fn state(&self, token: &str) -> Result<SharedState> {
        lock(&self.mailboxes)
            .get(token)
            .cloned()
            .ok_or_else(|| Error::MailboxNotFound {
                token: token.to_string(),
            })
    }
}
