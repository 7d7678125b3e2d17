//! Verification code extraction.
//!
//! Three strategies implement [`CodeExtractor`]:
//!
//! | Strategy | Type | Cost | Needs |
//! |----------|------|------|-------|
//! | pattern | [`PatternExtractor`] | in-memory | a learned template |
//! | llm | [`LlmExtractor`] | one HTTP call | API key |
//! | regex | [`RegexExtractor`] | in-memory | nothing |
//!
//! [`ExtractionPipeline`] runs them as a cascade, cheapest first, stopping at
//! the first sufficiently confident result.
//!
//! # Example
//!
//! ```
//! use tempmail_sync::extract::{CodeExtractor, RegexExtractor};
//!
//! # async fn example() {
//! let codes = RegexExtractor::new()
//!     .extract("Your verification code is 482931.")
//!     .await
//!     .unwrap();
//! assert_eq!(codes[0].value(), "482931");
//! # }
//! ```

mod builtin;
mod links;
mod llm;
mod pattern;
mod pipeline;

pub use builtin::RegexExtractor;
pub use links::{extract_links, is_verification_link, ExtractedLink, LinkSource};
pub use llm::LlmExtractor;
pub use pattern::{PatternExtractor, PatternLibrary, PatternTemplate};
pub use pipeline::{ExtractionOutcome, ExtractionPipeline, PipelineStats};

use crate::error::ExtractionError;
use crate::model::{ExtractedCode, ExtractionMethod};
use async_trait::async_trait;

/// One code extraction strategy.
///
/// Implementations return candidates ordered by confidence, highest first.
/// An empty list means "nothing found" and is not an error.
#[async_trait]
pub trait CodeExtractor: Send + Sync {
    /// Which cascade stage this strategy fills.
    fn method(&self) -> ExtractionMethod;

    /// Extracts candidate codes from plain text.
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedCode>, ExtractionError>;
}

/// Keeps the highest-confidence candidate per value, then sorts by confidence.
///
/// The sort is stable, so equal confidences keep first-seen order.
pub(crate) fn rank(candidates: Vec<ExtractedCode>) -> Vec<ExtractedCode> {
    let mut ranked: Vec<ExtractedCode> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match ranked.iter_mut().find(|c| c.value() == candidate.value()) {
            Some(existing) => {
                existing.raise_confidence(candidate.confidence(), candidate.source_pattern());
            }
            None => ranked.push(candidate),
        }
    }
    ranked.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CodeKind;

    #[test]
    fn test_rank_dedups_and_keeps_best() {
        let ranked = rank(vec![
            ExtractedCode::new("123456", CodeKind::Numeric, "numeric_6", 0.90),
            ExtractedCode::new("ABCDEF12", CodeKind::Alphanumeric, "alnum", 0.75),
            ExtractedCode::new("123456", CodeKind::Numeric, "keyword_context", 0.95),
        ]);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].value(), "123456");
        assert_eq!(ranked[0].source_pattern(), "keyword_context");
        assert!((ranked[0].confidence() - 0.95).abs() < f64::EPSILON);
    }
}
