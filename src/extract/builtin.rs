//! Built-in regex library, the always-available last stage of the cascade.

use super::{rank, CodeExtractor};
use crate::error::ExtractionError;
use crate::model::{CodeKind, ExtractedCode, ExtractionMethod};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

/// Confidence of a candidate next to a verification keyword.
pub(crate) const KEYWORD_CONFIDENCE: f64 = 0.95;

struct BareRule {
    regex: Regex,
    source: &'static str,
    confidence: f64,
}

// `(?-u:\b)` is an ASCII word boundary, so CJK text right before or after a
// code still counts as a boundary.
static BARE_RULES: Lazy<Vec<BareRule>> = Lazy::new(|| {
    [
        (r"(?-u:\b)\d{6}(?-u:\b)", "numeric_6", 0.90),
        (r"(?-u:\b)\d{4}(?-u:\b)", "numeric_4", 0.80),
        (r"(?-u:\b)\d{8}(?-u:\b)", "numeric_8", 0.85),
        (r"(?-u:\b)[A-Z0-9]{6,10}(?-u:\b)", "alphanumeric", 0.75),
    ]
    .into_iter()
    .map(|(pattern, source, confidence)| BareRule {
        regex: Regex::new(pattern).expect("valid regex"),
        source,
        confidence,
    })
    .collect()
});

static KEYWORD_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?-u:\b)(?:verification\s+code|code|otp|pin|token)|验证码|驗證碼|动态码|動態碼)(?:\s*(?:is|:|：|=|是))*\s*([A-Za-z0-9]{4,10})(?-u:\b)",
    )
    .expect("valid regex")
});

static TOKEN_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?-u:\b)token[\s:：=]*([A-Za-z0-9_-]{10,40})").expect("valid regex")
});

static URL_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[?&](?:code|token|verify)=([A-Za-z0-9_-]+)").expect("valid regex")
});

const URL_PARAM_MIN_LEN: usize = 6;

/// Regex-based extractor.
///
/// Bare runs score by shape: 6 digits 0.90, 8 digits 0.85, 4 digits 0.80,
/// 6-10 uppercase alphanumerics 0.75. A candidate next to a verification
/// keyword scores 0.95 instead, and one inside a `code`/`token`/`verify` URL
/// parameter scores 0.85. Candidates are deduplicated by value.
///
/// ```
/// use tempmail_sync::extract::RegexExtractor;
///
/// let codes = RegexExtractor::new().find_codes("验证码：836201");
/// assert_eq!(codes[0].value(), "836201");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexExtractor;

impl RegexExtractor {
    /// Creates the extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs every rule over `text` and returns ranked candidates.
    #[must_use]
    pub fn find_codes(&self, text: &str) -> Vec<ExtractedCode> {
        let mut candidates = Vec::new();

        for rule in BARE_RULES.iter() {
            for m in rule.regex.find_iter(text) {
                let value = m.as_str();
                if rule.source == "numeric_4" && is_year_like(value) {
                    continue;
                }
                if rule.source == "alphanumeric" && !value.bytes().any(|b| b.is_ascii_digit()) {
                    continue;
                }
                candidates.push(ExtractedCode::new(
                    value,
                    CodeKind::classify(value),
                    rule.source,
                    rule.confidence,
                ));
            }
        }

        for caps in KEYWORD_CONTEXT.captures_iter(text) {
            let value = &caps[1];
            if is_code_shaped(value) {
                candidates.push(ExtractedCode::new(
                    value,
                    CodeKind::classify(value),
                    "keyword_context",
                    KEYWORD_CONFIDENCE,
                ));
            }
        }

        for caps in TOKEN_CONTEXT.captures_iter(text) {
            let value = &caps[1];
            let kind = if value.len() > 15 {
                CodeKind::Token
            } else {
                CodeKind::classify(value)
            };
            candidates.push(ExtractedCode::new(
                value,
                kind,
                "token_context",
                KEYWORD_CONFIDENCE,
            ));
        }

        for caps in URL_PARAM.captures_iter(text) {
            let value = &caps[1];
            if value.len() >= URL_PARAM_MIN_LEN {
                candidates.push(ExtractedCode::new(
                    value,
                    CodeKind::classify(value),
                    "url_param",
                    0.85,
                ));
            }
        }

        rank(candidates)
    }
}

#[async_trait]
impl CodeExtractor for RegexExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Regex
    }

    async fn extract(&self, text: &str) -> Result<Vec<ExtractedCode>, ExtractionError> {
        Ok(self.find_codes(text))
    }
}

/// Four-digit values between 1900 and 2099 are treated as years, not codes.
fn is_year_like(value: &str) -> bool {
    value
        .parse::<u16>()
        .is_ok_and(|year| (1900..=2099).contains(&year))
}

/// A keyword-adjacent capture counts when it has a digit or is all uppercase,
/// so ordinary words after "code" are skipped.
fn is_code_shaped(value: &str) -> bool {
    value.bytes().any(|b| b.is_ascii_digit()) || value.bytes().all(|b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(codes: &[ExtractedCode]) -> Vec<&str> {
        codes.iter().map(ExtractedCode::value).collect()
    }

    #[test]
    fn test_keyword_code_outranks_year() {
        let codes =
            RegexExtractor::new().find_codes("Your verification code is 482931. Valid until 2025.");

        assert_eq!(codes.len(), 1);
        let code = &codes[0];
        assert_eq!(code.value(), "482931");
        assert!((code.confidence() - 0.95).abs() < f64::EPSILON);
        assert_eq!(code.kind(), CodeKind::Numeric);
        assert_eq!(code.length(), 6);
    }

    #[test]
    fn test_bare_numeric_confidences() {
        let codes = RegexExtractor::new().find_codes("ref 123456 then 87654321 then 4821");
        let by_value = |v: &str| codes.iter().find(|c| c.value() == v).unwrap().confidence();

        assert!((by_value("123456") - 0.90).abs() < f64::EPSILON);
        assert!((by_value("87654321") - 0.85).abs() < f64::EPSILON);
        assert!((by_value("4821") - 0.80).abs() < f64::EPSILON);
        assert_eq!(values(&codes)[0], "123456");
    }

    #[test]
    fn test_chinese_keyword() {
        let codes = RegexExtractor::new().find_codes("您的验证码是：836201，请勿泄露");
        assert_eq!(values(&codes), ["836201"]);
        assert_eq!(codes[0].source_pattern(), "keyword_context");
    }

    #[test]
    fn test_url_parameter() {
        let codes = RegexExtractor::new()
            .find_codes("Open https://example.com/verify?user=1&code=Xy7_kP2q9 to continue");
        let code = codes.iter().find(|c| c.value() == "Xy7_kP2q9").unwrap();
        assert_eq!(code.source_pattern(), "url_param");
        assert!((code.confidence() - 0.85).abs() < f64::EPSILON);

        // Too short for a URL parameter code
        let codes = RegexExtractor::new().find_codes("https://example.com/?code=ab1");
        assert!(codes.is_empty());
    }

    #[test]
    fn test_token_keyword() {
        let codes =
            RegexExtractor::new().find_codes("Your access token: eyJhbGciOiJIUzI1NiIsInR5cCI6");
        assert_eq!(codes[0].kind(), CodeKind::Token);
        assert_eq!(codes[0].source_pattern(), "token_context");
    }

    #[test]
    fn test_alphanumeric_requires_digit() {
        let codes = RegexExtractor::new().find_codes("IMPORTANT: use AB12CD9 now");
        assert_eq!(values(&codes), ["AB12CD9"]);
        assert_eq!(codes[0].kind(), CodeKind::Alphanumeric);
    }

    #[test]
    fn test_uppercase_code_after_keyword() {
        let codes = RegexExtractor::new().find_codes("Your verification code is: KXQPLM");
        assert_eq!(values(&codes), ["KXQPLM"]);
        assert_eq!(codes[0].source_pattern(), "keyword_context");
        assert_eq!(codes[0].kind(), CodeKind::Alphanumeric);
        assert!((codes[0].confidence() - KEYWORD_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_plain_word_after_keyword_is_ignored() {
        assert!(RegexExtractor::new()
            .find_codes("The code expires soon, so hurry")
            .is_empty());
    }

    #[test]
    fn test_no_codes() {
        assert!(RegexExtractor::new()
            .find_codes("Welcome aboard, see you in 2024!")
            .is_empty());
    }

    #[test]
    fn test_is_year_like() {
        assert!(is_year_like("2025"));
        assert!(is_year_like("1999"));
        assert!(!is_year_like("4821"));
        assert!(!is_year_like("0042"));
    }
}
