//! Data types shared by the cache, store, waiter and extraction pipeline.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Number of body characters that participate in the mail id.
pub const ID_BODY_PREFIX_CHARS: usize = 100;

/// Computes the stable id of a mail.
///
/// The id only depends on the recipient, sender, subject and the first
/// [`ID_BODY_PREFIX_CHARS`] characters of the text body, so the same message
/// fetched twice with a jittery timestamp keeps its id.
///
/// ```
/// use tempmail_sync::model::mail_id;
///
/// let a = mail_id("me@x.com", "bot@y.com", "Hi", "Your code is 1234");
/// let b = mail_id("me@x.com", "bot@y.com", "Hi", "Your code is 1234");
/// assert_eq!(a, b);
/// assert!(a.starts_with("mail_"));
/// ```
#[must_use]
pub fn mail_id(address: &str, sender: &str, subject: &str, body: &str) -> String {
    let prefix: String = body.chars().take(ID_BODY_PREFIX_CHARS).collect();

    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(b":");
    hasher.update(sender.as_bytes());
    hasher.update(b":");
    hasher.update(subject.as_bytes());
    hasher.update(b":");
    hasher.update(prefix.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!("mail_{}", &digest[..16])
}

/// One received email.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailRecord {
    /// Stable id, see [`mail_id`].
    pub id: String,
    /// Recipient address.
    pub address: String,
    /// Sender as reported by the provider.
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text_body: String,
    /// HTML body, when the provider has one.
    pub html_body: Option<String>,
    /// Provider-reported receive time.
    pub received_at: DateTime<Utc>,
    /// Whether the mail was opened through the store.
    pub is_read: bool,
    /// Extracted codes, `None` until extraction ran on this record.
    pub codes: Option<Vec<ExtractedCode>>,
}

impl MailRecord {
    /// Creates an unread mail and derives its id.
    pub fn new(
        address: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        text_body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let address = address.into();
        let sender = sender.into();
        let subject = subject.into();
        let text_body = text_body.into();
        let id = mail_id(&address, &sender, &subject, &text_body);

        Self {
            id,
            address,
            sender,
            subject,
            text_body,
            html_body: None,
            received_at,
            is_read: false,
            codes: None,
        }
    }

    /// Attaches an HTML body. Empty strings are treated as absent.
    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        let html = html.into();
        self.html_body = (!html.trim().is_empty()).then_some(html);
        self
    }
}

/// Shape of an extracted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    /// Digits only.
    Numeric,
    /// Letters and digits.
    Alphanumeric,
    /// Long opaque string, possibly with `-` or `_`.
    Token,
}

impl CodeKind {
    /// Classifies a value by its characters.
    #[must_use]
    pub fn classify(value: &str) -> Self {
        if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
            CodeKind::Numeric
        } else if value.chars().all(|c| c.is_ascii_alphanumeric()) && value.len() <= 15 {
            CodeKind::Alphanumeric
        } else {
            CodeKind::Token
        }
    }

    /// Parses the lowercase wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "numeric" => Some(CodeKind::Numeric),
            "alphanumeric" => Some(CodeKind::Alphanumeric),
            "token" => Some(CodeKind::Token),
            _ => None,
        }
    }
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeKind::Numeric => write!(f, "numeric"),
            CodeKind::Alphanumeric => write!(f, "alphanumeric"),
            CodeKind::Token => write!(f, "token"),
        }
    }
}

/// One candidate verification code.
///
/// The length is derived from the value on construction and cannot drift.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedCode {
    value: String,
    kind: CodeKind,
    length: usize,
    source_pattern: String,
    confidence: f64,
}

impl ExtractedCode {
    /// Creates a code. Confidence is clamped to `[0, 1]`.
    pub fn new(
        value: impl Into<String>,
        kind: CodeKind,
        source_pattern: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let value = value.into();
        Self {
            length: value.chars().count(),
            value,
            kind,
            source_pattern: source_pattern.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// The code itself.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Shape of the code.
    #[must_use]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// Number of characters in the value.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Which rule, template or model produced the code.
    #[must_use]
    pub fn source_pattern(&self) -> &str {
        &self.source_pattern
    }

    /// Confidence in `[0, 1]`.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub(crate) fn raise_confidence(&mut self, confidence: f64, source_pattern: &str) {
        if confidence > self.confidence {
            self.confidence = confidence.clamp(0.0, 1.0);
            source_pattern.clone_into(&mut self.source_pattern);
        }
    }
}

/// Extraction strategies of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Learned keyword/regex templates.
    Pattern,
    /// Chat-completion model.
    Llm,
    /// Built-in regex library.
    Regex,
}

impl ExtractionMethod {
    /// All methods in cascade order.
    pub const ALL: [ExtractionMethod; 3] = [
        ExtractionMethod::Pattern,
        ExtractionMethod::Llm,
        ExtractionMethod::Regex,
    ];

    /// Parses a method name; `"smart"` and `"auto"` mean no preference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unknown names.
    pub fn parse_preference(name: &str) -> Result<Option<Self>> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "smart" | "auto" => Ok(None),
            "pattern" => Ok(Some(ExtractionMethod::Pattern)),
            "llm" => Ok(Some(ExtractionMethod::Llm)),
            "regex" => Ok(Some(ExtractionMethod::Regex)),
            other => Err(Error::InvalidConfig {
                message: format!("unknown extraction method '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionMethod::Pattern => write!(f, "pattern"),
            ExtractionMethod::Llm => write!(f, "llm"),
            ExtractionMethod::Regex => write!(f, "regex"),
        }
    }
}

/// A provisioned disposable address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mailbox {
    /// Opaque access token.
    pub token: String,
    /// The disposable address.
    pub address: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time, after which [`cleanup_expired`](crate::MailStore::cleanup_expired) removes it.
    pub expires_at: DateTime<Utc>,
    /// Number of stored mails.
    pub mail_count: usize,
}

impl Mailbox {
    /// Creates a mailbox for `address` with a fresh 32-hex-character token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEmailFormat`] if the address does not parse, or
    /// [`Error::InvalidConfig`] if `ttl` is out of range.
    pub fn provision(address: &str, ttl: Duration) -> Result<Self> {
        let address = validate_address(address)?;
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::InvalidConfig {
            message: "mailbox ttl out of range".into(),
        })?;
        let created_at = Utc::now();

        Ok(Self {
            token: Uuid::new_v4().simple().to_string(),
            address: address.as_str().to_string(),
            created_at,
            expires_at: created_at + ttl,
            mail_count: 0,
        })
    }

    /// Returns `true` once `now` has reached the expiry time.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Validates an address with the same rules used for configuration.
pub(crate) fn validate_address(address: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(address.trim(), email_address::Options::default()).map_err(
        |_| Error::InvalidEmailFormat {
            email: address.to_string(),
        },
    )
}

/// Outcome of one waiter call that ran extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionStats {
    /// Method the caller asked for, `None` for the cascade.
    pub method_requested: Option<ExtractionMethod>,
    /// Method that produced the first mail's result.
    pub method_used: Option<ExtractionMethod>,
    /// Wall time spent extracting.
    pub duration: Duration,
    /// Number of mails extraction ran on.
    pub mails_processed: usize,
    /// Codes kept after the confidence filter.
    pub codes_found: usize,
    /// How many mails each method answered.
    pub method_breakdown: BTreeMap<ExtractionMethod, usize>,
}

impl ExtractionStats {
    /// Duration in whole milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }

    pub(crate) fn record(&mut self, method: ExtractionMethod, codes: usize) {
        self.method_used.get_or_insert(method);
        self.mails_processed += 1;
        self.codes_found += codes;
        *self.method_breakdown.entry(method).or_insert(0) += 1;
    }
}
