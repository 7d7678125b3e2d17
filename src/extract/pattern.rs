//! Learned extraction templates.
//!
//! A template is learned from one highlighted code: the keywords around the
//! highlight plus a regex describing the code's shape. Matching looks for a
//! keyword and then for the code within the following 100 characters.
//!
//! ```
//! use tempmail_sync::extract::PatternLibrary;
//!
//! let library = PatternLibrary::new();
//! let mail = "Hello! Your login code: 7741 (expires soon)";
//! library.learn_from_highlight(mail, "7741", mail.find("7741").unwrap()).unwrap();
//!
//! let codes = library.find_codes("Your login code: 9012 (expires soon)");
//! assert_eq!(codes[0].value(), "9012");
//! ```

use super::{rank, CodeExtractor};
use crate::cache::lock;
use crate::error::{Error, ExtractionError, Result};
use crate::model::{CodeKind, ExtractedCode, ExtractionMethod};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Confidence assigned to newly learned templates.
pub const DEFAULT_TEMPLATE_CONFIDENCE: f64 = 0.85;

const CONTEXT_CHARS: usize = 30;
const AFTER_KEYWORD_CHARS: usize = 20;
const FALLBACK_KEYWORD_CHARS: usize = 15;
const SEARCH_WINDOW_CHARS: usize = 100;

static KEYWORD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"驗證碼[是：:\s]*",
        r"验证码[是：:\s]*",
        r"動態碼[是：:\s]*",
        r"动态码[是：:\s]*",
        r"verification\s+code[:\s]*",
        r"your\s+code[:\s]*",
        r"code\s+is[:\s]*",
        r"code[:\s]*",
        r"otp[:\s]*",
        r"pin[:\s]*",
        r"token[:\s]*",
        r"password[:\s]*",
    ]
    .into_iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("valid regex")
    })
    .collect()
});

/// A learned extraction template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternTemplate {
    /// Template id, `pattern_` followed by 8 hex characters.
    pub id: String,
    /// Keywords found before the highlighted code.
    pub keywords_before: Vec<String>,
    /// Keywords found after the highlighted code.
    pub keywords_after: Vec<String>,
    /// Shape of the highlighted code.
    pub kind: CodeKind,
    /// Length of the highlighted code.
    pub code_length: usize,
    /// Regex matching codes of the same shape.
    pub regex: String,
    /// The highlighted code.
    pub example_code: String,
    /// Confidence given to codes this template finds.
    pub confidence: f64,
    /// Learn time.
    pub created_at: DateTime<Utc>,
    /// Times the template was applied.
    pub usage_count: u64,
    /// Times the template produced a code.
    pub success_count: u64,
}

impl PatternTemplate {
    /// Builds a template by hand.
    pub fn new(keywords_before: Vec<String>, example_code: &str) -> Self {
        let kind = CodeKind::classify(example_code);
        let code_length = example_code.chars().count();
        Self {
            id: new_template_id(),
            keywords_before,
            keywords_after: Vec::new(),
            kind,
            code_length,
            regex: shape_regex(kind, code_length),
            example_code: example_code.to_string(),
            confidence: DEFAULT_TEMPLATE_CONFIDENCE,
            created_at: Utc::now(),
            usage_count: 0,
            success_count: 0,
        }
    }

    /// Overrides the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    fn compile(&self) -> std::result::Result<Regex, ExtractionError> {
        RegexBuilder::new(&self.regex)
            .case_insensitive(true)
            .build()
            .map_err(|source| ExtractionError::InvalidPattern {
                pattern: self.regex.clone(),
                source,
            })
    }
}

#[derive(Debug, Clone)]
struct CompiledTemplate {
    template: PatternTemplate,
    regex: Regex,
    keyword_regexes: Vec<Regex>,
}

impl CompiledTemplate {
    fn new(template: PatternTemplate) -> std::result::Result<Self, ExtractionError> {
        let regex = template.compile()?;
        let keyword_regexes = template
            .keywords_before
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|keyword| {
                RegexBuilder::new(&regex::escape(keyword))
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ExtractionError::InvalidPattern {
                        pattern: keyword.clone(),
                        source,
                    })
            })
            .collect::<std::result::Result<_, _>>()?;

        Ok(Self {
            template,
            regex,
            keyword_regexes,
        })
    }

    /// First code after any keyword, skipping matches glued to other alphanumerics.
    fn find_in(&self, text: &str) -> Option<String> {
        self.keyword_regexes.iter().find_map(|keyword| {
            let start = keyword.find(text)?.end();
            let window = &text[start..byte_offset(text, start, SEARCH_WINDOW_CHARS)];
            self.regex
                .find_iter(window)
                .find(|m| is_isolated(text, start + m.start(), start + m.end()))
                .map(|m| m.as_str().trim().to_string())
        })
    }
}

/// Thread-safe collection of learned templates.
#[derive(Debug, Default)]
pub struct PatternLibrary {
    templates: Mutex<Vec<CompiledTemplate>>,
}

impl PatternLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Learns a template from `code` highlighted at byte `position` of `content`.
    ///
    /// The newest template replaces all previously learned ones. If `position`
    /// does not point at `code`, the first occurrence of `code` is used.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::InvalidHighlight`] if `code` is blank or does
    /// not occur in `content`.
    #[instrument(name = "PatternLibrary::learn_from_highlight", skip_all, fields(code_length = code.len()))]
    pub fn learn_from_highlight(
        &self,
        content: &str,
        code: &str,
        position: usize,
    ) -> std::result::Result<PatternTemplate, ExtractionError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ExtractionError::InvalidHighlight {
                message: "highlighted code is empty".into(),
            });
        }

        let position = match content.get(position..) {
            Some(rest) if rest.starts_with(code) => position,
            _ => content
                .find(code)
                .ok_or_else(|| ExtractionError::InvalidHighlight {
                    message: "highlighted code does not occur in the mail".into(),
                })?,
        };

        let before = tail_chars(&content[..position], CONTEXT_CHARS);
        let after_start = position + code.len();
        let after = &content[after_start..byte_offset(content, after_start, CONTEXT_CHARS)];
        let after = &after[..byte_offset(after, 0, AFTER_KEYWORD_CHARS)];

        let mut template = PatternTemplate::new(context_keywords(before), code);
        template.keywords_after = context_keywords(after);

        let compiled = CompiledTemplate::new(template.clone())?;
        *lock(&self.templates) = vec![compiled];

        info!(
            id = %template.id,
            kind = %template.kind,
            keywords = ?template.keywords_before,
            "Learned extraction template"
        );
        Ok(template)
    }

    /// Adds a template, replacing any template with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::InvalidPattern`] if the template's regex does not compile.
    pub fn insert(&self, template: PatternTemplate) -> std::result::Result<(), ExtractionError> {
        let compiled = CompiledTemplate::new(template)?;
        let mut templates = lock(&self.templates);
        templates.retain(|t| t.template.id != compiled.template.id);
        templates.push(compiled);
        Ok(())
    }

    /// Returns all templates.
    #[must_use]
    pub fn templates(&self) -> Vec<PatternTemplate> {
        lock(&self.templates)
            .iter()
            .map(|t| t.template.clone())
            .collect()
    }

    /// Returns one template by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PatternTemplate> {
        lock(&self.templates)
            .iter()
            .find(|t| t.template.id == id)
            .map(|t| t.template.clone())
    }

    /// Removes a template. Returns `false` if no template had this id.
    pub fn remove(&self, id: &str) -> bool {
        let mut templates = lock(&self.templates);
        let before = templates.len();
        templates.retain(|t| t.template.id != id);
        templates.len() != before
    }

    /// Removes every template.
    pub fn clear(&self) {
        lock(&self.templates).clear();
    }

    /// Returns the number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.templates).len()
    }

    /// Returns `true` if no template was learned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records one application of a template.
    pub fn record_outcome(&self, id: &str, success: bool) {
        let mut templates = lock(&self.templates);
        if let Some(t) = templates.iter_mut().find(|t| t.template.id == id) {
            t.template.usage_count += 1;
            if success {
                t.template.success_count += 1;
            }
        }
    }

    /// Serializes all templates as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if serialization fails.
    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.templates()).map_err(|e| Error::InvalidConfig {
            message: format!("failed to serialize templates: {e}"),
        })
    }

    /// Replaces all templates with the ones in a JSON array. Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for malformed JSON and
    /// [`Error::Extraction`] if a template's regex does not compile. The
    /// library is left unchanged on error.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let templates: Vec<PatternTemplate> =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
                message: format!("invalid template JSON: {e}"),
            })?;

        let compiled = templates
            .into_iter()
            .map(CompiledTemplate::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|source| Error::Extraction {
                method: ExtractionMethod::Pattern,
                source,
            })?;

        let count = compiled.len();
        *lock(&self.templates) = compiled;
        debug!(count, "Imported extraction templates");
        Ok(count)
    }

    /// Applies every template to `text` and returns ranked candidates.
    ///
    /// Each template contributes at most one code and has its usage recorded.
    pub fn find_codes(&self, text: &str) -> Vec<ExtractedCode> {
        let mut templates = lock(&self.templates);
        let mut candidates = Vec::new();

        for compiled in templates.iter_mut() {
            let found = compiled.find_in(text);
            let template = &mut compiled.template;
            template.usage_count += 1;

            if let Some(value) = found {
                template.success_count += 1;
                candidates.push(ExtractedCode::new(
                    value,
                    template.kind,
                    format!("user_pattern_{}", template.id),
                    template.confidence,
                ));
            }
        }

        rank(candidates)
    }
}

/// Cascade stage backed by a [`PatternLibrary`].
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor {
    library: Arc<PatternLibrary>,
}

impl PatternExtractor {
    /// Creates the stage over a shared library.
    #[must_use]
    pub fn new(library: Arc<PatternLibrary>) -> Self {
        Self { library }
    }

    /// The library this stage reads.
    #[must_use]
    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }
}

#[async_trait]
impl CodeExtractor for PatternExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Pattern
    }

    async fn extract(&self, text: &str) -> std::result::Result<Vec<ExtractedCode>, ExtractionError> {
        Ok(self.library.find_codes(text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn new_template_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("pattern_{}", &hex[..8])
}

fn shape_regex(kind: CodeKind, length: usize) -> String {
    match kind {
        CodeKind::Numeric => format!(r"\d{{{length}}}"),
        CodeKind::Alphanumeric => format!("[A-Za-z0-9]{{{length}}}"),
        CodeKind::Token => format!("[A-Za-z0-9_-]{{{length}}}"),
    }
}

/// Keywords in `context`, or its last characters when none is present.
fn context_keywords(context: &str) -> Vec<String> {
    let context = context.trim();
    let mut keywords: Vec<String> = Vec::new();

    for pattern in KEYWORD_PATTERNS.iter() {
        for m in pattern.find_iter(context) {
            let keyword = m.as_str().trim();
            if !keyword.is_empty() && !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
    }

    if keywords.is_empty() {
        let last = tail_chars(context, FALLBACK_KEYWORD_CHARS).trim();
        if !last.is_empty() {
            keywords.push(last.to_string());
        }
    }
    keywords
}

/// Byte offset `chars` characters after `start`, clamped to the end of `text`.
fn byte_offset(text: &str, start: usize, chars: usize) -> usize {
    text[start..]
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| start + i)
}

fn tail_chars(text: &str, chars: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(chars.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    &text[start..]
}

fn is_isolated(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(|c| c.is_ascii_alphanumeric())
        && !after.is_some_and(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIL: &str = "Welcome to Acme!\nYour verification code: 482931\nIt expires in 10 minutes.";

    fn learned() -> (PatternLibrary, PatternTemplate) {
        let library = PatternLibrary::new();
        let position = MAIL.find("482931").unwrap();
        let template = library.learn_from_highlight(MAIL, "482931", position).unwrap();
        (library, template)
    }

    #[test]
    fn test_learn_from_highlight() {
        let (library, template) = learned();

        assert!(template.id.starts_with("pattern_"));
        assert_eq!(template.id.len(), "pattern_".len() + 8);
        assert_eq!(template.kind, CodeKind::Numeric);
        assert_eq!(template.code_length, 6);
        assert_eq!(template.regex, r"\d{6}");
        assert!(template
            .keywords_before
            .iter()
            .any(|k| k.eq_ignore_ascii_case("verification code:")));
        assert!((template.confidence - DEFAULT_TEMPLATE_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn test_newest_template_replaces_older() {
        let (library, first) = learned();
        let other = "Your PIN: AB12CD please";
        let second = library
            .learn_from_highlight(other, "AB12CD", other.find("AB12CD").unwrap())
            .unwrap();

        assert_eq!(library.len(), 1);
        assert!(library.get(&first.id).is_none());
        assert_eq!(library.templates()[0].id, second.id);
        assert_eq!(second.kind, CodeKind::Alphanumeric);
    }

    #[test]
    fn test_find_codes_uses_keyword_window() {
        let (library, template) = learned();
        let codes = library.find_codes("Hi Bob, your VERIFICATION CODE: 175320. Thanks");

        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].value(), "175320");
        assert_eq!(codes[0].source_pattern(), format!("user_pattern_{}", template.id));

        let stored = library.get(&template.id).unwrap();
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.success_count, 1);
    }

    #[test]
    fn test_find_codes_skips_longer_runs() {
        let (library, _) = learned();
        assert!(library
            .find_codes("verification code: 12345678901")
            .is_empty());
    }

    #[test]
    fn test_fallback_keyword_is_context_tail() {
        let library = PatternLibrary::new();
        let mail = "Bitte geben Sie folgendes ein 5521 danke";
        let template = library
            .learn_from_highlight(mail, "5521", mail.find("5521").unwrap())
            .unwrap();
        assert_eq!(template.keywords_before, ["e folgendes ein"]);
    }

    #[test]
    fn test_highlight_position_is_corrected() {
        let library = PatternLibrary::new();
        let template = library.learn_from_highlight(MAIL, "482931", 0).unwrap();
        assert_eq!(template.example_code, "482931");

        let err = library.learn_from_highlight(MAIL, "999999", 0).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidHighlight { .. }));
    }

    #[test]
    fn test_export_import_json() {
        let (library, template) = learned();
        let json = library.export_json().unwrap();

        let restored = PatternLibrary::new();
        assert_eq!(restored.import_json(&json).unwrap(), 1);
        assert_eq!(restored.templates(), vec![template]);

        assert!(restored.import_json("not json").is_err());
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn test_insert_rejects_bad_regex() {
        let library = PatternLibrary::new();
        let mut template = PatternTemplate::new(vec!["code".into()], "1234");
        template.regex = "(unclosed".into();
        assert!(matches!(
            library.insert(template),
            Err(ExtractionError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_remove_and_record_outcome() {
        let (library, template) = learned();
        library.record_outcome(&template.id, false);
        assert_eq!(library.get(&template.id).unwrap().usage_count, 1);
        assert_eq!(library.get(&template.id).unwrap().success_count, 0);

        assert!(library.remove(&template.id));
        assert!(!library.remove(&template.id));
        assert!(library.is_empty());
    }
}
