//! Chat-completion backed extraction stage.

use super::CodeExtractor;
use crate::config::LlmConfig;
use crate::error::{truncate_body, ExtractionError, Result};
use crate::model::{CodeKind, ExtractedCode, ExtractionMethod};
use crate::provider::http_client;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Characters of mail text sent to the model.
const PROMPT_TEXT_CHARS: usize = 2000;

/// Confidence assumed when the model omits one.
const DEFAULT_LLM_CONFIDENCE: f64 = 0.8;

const SYSTEM_PROMPT: &str = "You are a verification code extraction expert. \
    Extract the single most likely verification code, OTP code, token or \
    authentication code from email content. Return results in JSON format only.";

static JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[\s\S]*\]").expect("valid regex"));

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Extraction stage asking a chat-completion model for the code.
///
/// Returns at most one candidate: the highest-confidence code in the model's
/// answer, with numeric 4-8 digit codes winning ties.
#[derive(Clone)]
pub struct LlmExtractor {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmExtractor {
    /// Creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the HTTP
    /// client cannot be built.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = http_client(
            config.timeout,
            concat!("tempmail-sync/", env!("CARGO_PKG_VERSION")),
        )?;
        Ok(Self { client, config })
    }

    /// Returns `true` when enabled and an API key is configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.config.is_active()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    async fn complete(&self, api_key: &str, text: &str) -> std::result::Result<String, ExtractionError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(text),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| ExtractionError::LlmRequest { source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::LlmStatus {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|source| ExtractionError::LlmRequest { source })?;

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ExtractionError::LlmResponse {
                message: "response has no message content".into(),
            })
    }
}

#[async_trait]
impl CodeExtractor for LlmExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Llm
    }

    #[instrument(name = "LlmExtractor::extract", skip_all, fields(model = %self.config.model, text_len = text.len()))]
    async fn extract(&self, text: &str) -> std::result::Result<Vec<ExtractedCode>, ExtractionError> {
        let api_key = match self.config.api_key() {
            Some(key) if self.config.enabled => key,
            _ => {
                return Err(ExtractionError::Unavailable {
                    method: ExtractionMethod::Llm,
                })
            }
        };

        let started = Instant::now();
        let content = self.complete(api_key, text).await.inspect_err(|e| {
            warn!(error = %e, retryable = e.is_retryable(), "LLM extraction call failed");
        })?;

        let candidates = parse_response(&content);
        let best = best_candidate(candidates);
        debug!(
            found = best.is_some(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "LLM extraction finished"
        );
        Ok(best.into_iter().collect())
    }
}

impl std::fmt::Debug for LlmExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build_prompt(text: &str) -> String {
    let excerpt: String = text.chars().take(PROMPT_TEXT_CHARS).collect();
    format!(
        r#"Analyze the following email and extract the verification code, OTP code, authentication token or confirmation code it contains.

EMAIL CONTENT:
---
{excerpt}
---

EXTRACTION RULES:
1. Numeric codes: pure numbers, usually 4, 6 or 8 digits, near words like "code", "verification", "OTP", "PIN", "验证码", "驗證碼".
2. Alphanumeric codes: letters and digits, usually 6-10 characters, often uppercase.
3. Tokens: long strings (20+ characters) that may contain "-" or "_", often in URLs or after "token:".

CONFIDENCE SCORING:
- 0.95-1.0: code next to an explicit keyword ("Your code is 123456")
- 0.85-0.94: code in a URL parameter (?code=ABC123)
- 0.80-0.84: standalone code in a verification context
- 0.70-0.79: ambiguous match

DO NOT EXTRACT: years, phone numbers, prices, quantities, dates, times or ordinary words.

Return ONLY a JSON array with at most one element, no markdown:
[{{"code": "123456", "type": "numeric", "length": 6, "confidence": 0.95}}]

If there is no verification code, return: []"#
    )
}

/// Parses the first JSON array in the model's answer.
///
/// Items without a `code` are skipped; an unknown `type` is re-derived from the value.
fn parse_response(content: &str) -> Vec<ExtractedCode> {
    let Some(array) = JSON_ARRAY.find(content) else {
        return Vec::new();
    };

    let items: Vec<Value> = match serde_json::from_str(array.as_str()) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, preview = %truncate_body(content), "Unparseable LLM answer");
            return Vec::new();
        }
    };

    items
        .iter()
        .filter_map(|item| {
            let value = match item.get("code")? {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            if value.is_empty() {
                return None;
            }

            let kind = item
                .get("type")
                .and_then(Value::as_str)
                .and_then(CodeKind::parse)
                .unwrap_or_else(|| CodeKind::classify(&value));
            let confidence = item
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_LLM_CONFIDENCE);

            Some(ExtractedCode::new(value, kind, "llm_extracted", confidence))
        })
        .collect()
}

/// Highest confidence wins; on a tie a numeric 4-8 digit code wins.
fn best_candidate(candidates: Vec<ExtractedCode>) -> Option<ExtractedCode> {
    let preferred = |code: &ExtractedCode| {
        code.kind() == CodeKind::Numeric && (4..=8).contains(&code.length())
    };

    candidates.into_iter().reduce(|best, next| {
        match next.confidence().total_cmp(&best.confidence()) {
            std::cmp::Ordering::Greater => next,
            std::cmp::Ordering::Equal if preferred(&next) && !preferred(&best) => next,
            _ => best,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_surrounding_text() {
        let content = r#"Sure! Here you go:
```json
[{"code": "482931", "type": "numeric", "length": 6, "confidence": 0.97}]
```"#;
        let codes = parse_response(content);
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].value(), "482931");
        assert_eq!(codes[0].kind(), CodeKind::Numeric);
        assert_eq!(codes[0].source_pattern(), "llm_extracted");
        assert!((codes[0].confidence() - 0.97).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_response_defaults() {
        let codes = parse_response(r#"[{"code": 7731}, {"code": "AB12CD", "type": "weird"}, {"nope": 1}]"#);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].value(), "7731");
        assert!((codes[0].confidence() - DEFAULT_LLM_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(codes[1].kind(), CodeKind::Alphanumeric);
    }

    #[test]
    fn test_parse_response_garbage() {
        assert!(parse_response("no codes here").is_empty());
        assert!(parse_response("[not json]").is_empty());
        assert!(parse_response("[]").is_empty());
    }

    #[test]
    fn test_best_candidate_prefers_numeric_on_tie() {
        let best = best_candidate(vec![
            ExtractedCode::new("AB12CD", CodeKind::Alphanumeric, "llm_extracted", 0.9),
            ExtractedCode::new("551234", CodeKind::Numeric, "llm_extracted", 0.9),
            ExtractedCode::new("Z9", CodeKind::Alphanumeric, "llm_extracted", 0.5),
        ])
        .unwrap();
        assert_eq!(best.value(), "551234");

        let best = best_candidate(vec![
            ExtractedCode::new("551234", CodeKind::Numeric, "llm_extracted", 0.8),
            ExtractedCode::new("AB12CD", CodeKind::Alphanumeric, "llm_extracted", 0.95),
        ])
        .unwrap();
        assert_eq!(best.value(), "AB12CD");

        assert!(best_candidate(Vec::new()).is_none());
    }

    #[test]
    fn test_prompt_truncates_text() {
        let prompt = build_prompt(&"x".repeat(5_000));
        assert!(prompt.contains(&"x".repeat(PROMPT_TEXT_CHARS)));
        assert!(!prompt.contains(&"x".repeat(PROMPT_TEXT_CHARS + 1)));
    }

    #[tokio::test]
    async fn test_unavailable_without_key() {
        let mut config = LlmConfig::default();
        config.enabled = true;
        let extractor = LlmExtractor::new(config).unwrap();

        assert!(!extractor.is_available());
        let err = extractor.extract("code 123456").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unavailable { .. }));
    }
}
