//! The extraction cascade.

use super::{CodeExtractor, LlmExtractor, PatternExtractor, PatternLibrary, RegexExtractor};
use crate::config::{ExtractionConfig, SyncConfig};
use crate::error::{Error, ExtractionError, Result};
use crate::model::{ExtractedCode, ExtractionMethod, MailRecord};
use crate::text::html_to_text;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Result of one [`ExtractionPipeline::extract_smart`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    /// Candidates, highest confidence first.
    pub codes: Vec<ExtractedCode>,
    /// The strategy whose result was returned.
    pub method_used: ExtractionMethod,
    /// Time spent.
    pub duration: Duration,
}

impl ExtractionOutcome {
    /// The highest-confidence code, if any.
    #[must_use]
    pub fn best(&self) -> Option<&ExtractedCode> {
        self.codes.first()
    }

    /// Duration in whole milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

/// Counters of which strategy produced results.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    /// Runs answered with codes by the pattern strategy.
    pub pattern_success: u64,
    /// Runs answered with codes by the LLM strategy.
    pub llm_success: u64,
    /// Runs answered with codes by the regex strategy.
    pub regex_success: u64,
    /// All runs.
    pub total_attempts: u64,
    /// Share of runs that produced at least one code, in `[0, 1]`.
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct PipelineMetrics {
    pattern_success: AtomicU64,
    llm_success: AtomicU64,
    regex_success: AtomicU64,
    total_attempts: AtomicU64,
}

impl PipelineMetrics {
    fn record_success(&self, method: ExtractionMethod) {
        let counter = match method {
            ExtractionMethod::Pattern => &self.pattern_success,
            ExtractionMethod::Llm => &self.llm_success,
            ExtractionMethod::Regex => &self.regex_success,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Stage {
    extractor: Arc<dyn CodeExtractor>,
    threshold: f64,
}

/// Ordered cascade of extraction strategies.
///
/// Each stage but the last ends the cascade only if its best candidate reaches
/// the stage's threshold (pattern 0.85, LLM 0.80 by default). The last stage's
/// result is returned as is. A failing stage is logged and skipped, unless it
/// is the last one.
///
/// ```
/// use tempmail_sync::extract::{ExtractionPipeline, PatternLibrary};
/// use tempmail_sync::{MailRecord, SyncConfig, ExtractionMethod};
/// use chrono::Utc;
/// use std::sync::Arc;
///
/// # async fn example() -> tempmail_sync::Result<()> {
/// let pipeline = ExtractionPipeline::new(&SyncConfig::default(), Arc::new(PatternLibrary::new()))?;
/// let mail = MailRecord::new("me@x.com", "bot@y.com", "Code", "Your code is 482931", Utc::now());
///
/// let outcome = pipeline.extract_smart(&mail, None).await?;
/// assert_eq!(outcome.method_used, ExtractionMethod::Regex);
/// assert_eq!(outcome.best().unwrap().value(), "482931");
/// # Ok(())
/// # }
/// ```
pub struct ExtractionPipeline {
    stages: Vec<Stage>,
    metrics: PipelineMetrics,
}

impl ExtractionPipeline {
    /// Builds the standard cascade: pattern, then LLM when it is enabled and
    /// has a key, then regex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the LLM HTTP client cannot be built.
    pub fn new(config: &SyncConfig, library: Arc<PatternLibrary>) -> Result<Self> {
        let mut extractors: Vec<Arc<dyn CodeExtractor>> =
            vec![Arc::new(PatternExtractor::new(library))];
        if config.llm.is_active() {
            extractors.push(Arc::new(LlmExtractor::new(config.llm.clone())?));
        }
        extractors.push(Arc::new(RegexExtractor::new()));

        Self::with_extractors(&config.extraction, extractors)
    }

    /// Builds a cascade from explicit stages, tried in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `extractors` is empty.
    pub fn with_extractors(
        config: &ExtractionConfig,
        extractors: Vec<Arc<dyn CodeExtractor>>,
    ) -> Result<Self> {
        if extractors.is_empty() {
            return Err(Error::InvalidConfig {
                message: "extraction pipeline needs at least one stage".into(),
            });
        }

        let stages = extractors
            .into_iter()
            .map(|extractor| {
                let threshold = match extractor.method() {
                    ExtractionMethod::Pattern => config.pattern_threshold,
                    ExtractionMethod::Llm => config.llm_threshold,
                    ExtractionMethod::Regex => 0.0,
                };
                Stage {
                    extractor,
                    threshold,
                }
            })
            .collect();

        Ok(Self {
            stages,
            metrics: PipelineMetrics::default(),
        })
    }

    /// Methods in cascade order.
    #[must_use]
    pub fn methods(&self) -> Vec<ExtractionMethod> {
        self.stages.iter().map(|s| s.extractor.method()).collect()
    }

    /// Extracts codes from a mail.
    ///
    /// With `preferred` set, only that strategy runs and its result is
    /// returned even when empty. A preferred strategy that is not configured
    /// (the LLM without a key) yields no codes. Otherwise the cascade runs.
    ///
    /// Every strategy that finds nothing in the text body retries once on
    /// the HTML body converted to text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] if the preferred strategy fails, or if
    /// the last cascade stage fails.
    #[instrument(
        name = "ExtractionPipeline::extract_smart",
        skip_all,
        fields(mail_id = %mail.id, preferred = ?preferred)
    )]
    pub async fn extract_smart(
        &self,
        mail: &MailRecord,
        preferred: Option<ExtractionMethod>,
    ) -> Result<ExtractionOutcome> {
        let started = Instant::now();
        self.metrics.total_attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(method) = preferred {
            let Some(stage) = self.stages.iter().find(|s| s.extractor.method() == method) else {
                warn!(%method, "Preferred method not configured, returning no codes");
                return Ok(self.finish(Vec::new(), method, started));
            };
            let codes = Self::run_stage(stage, mail)
                .await
                .map_err(|source| Error::Extraction { method, source })?;
            return Ok(self.finish(codes, method, started));
        }

        let Some((last, cascade)) = self.stages.split_last() else {
            return Err(Error::InvalidConfig {
                message: "extraction pipeline has no stages".into(),
            });
        };

        for stage in cascade {
            let method = stage.extractor.method();
            match Self::run_stage(stage, mail).await {
                Ok(codes) => {
                    let best = codes.first().map_or(0.0, ExtractedCode::confidence);
                    if !codes.is_empty() && best >= stage.threshold {
                        return Ok(self.finish(codes, method, started));
                    }
                    debug!(%method, candidates = codes.len(), best, threshold = stage.threshold, "Falling through");
                }
                Err(e) => {
                    warn!(%method, error = %e, "Extraction stage failed, falling through");
                }
            }
        }

        let method = last.extractor.method();
        let codes = Self::run_stage(last, mail)
            .await
            .map_err(|source| Error::Extraction { method, source })?;
        Ok(self.finish(codes, method, started))
    }

    /// Runs [`extract_smart`](Self::extract_smart) and stores the codes at or
    /// above `min_confidence` on the mail.
    ///
    /// The returned outcome carries the same filtered codes.
    ///
    /// # Errors
    ///
    /// Same as [`extract_smart`](Self::extract_smart).
    pub async fn annotate(
        &self,
        mail: &mut MailRecord,
        preferred: Option<ExtractionMethod>,
        min_confidence: f64,
    ) -> Result<ExtractionOutcome> {
        let mut outcome = self.extract_smart(mail, preferred).await?;
        outcome.codes.retain(|code| code.confidence() >= min_confidence);
        mail.codes = Some(outcome.codes.clone());
        Ok(outcome)
    }

    /// Returns a snapshot of the success counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let pattern_success = load(&self.metrics.pattern_success);
        let llm_success = load(&self.metrics.llm_success);
        let regex_success = load(&self.metrics.regex_success);
        let total_attempts = load(&self.metrics.total_attempts);

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            (pattern_success + llm_success + regex_success) as f64 / total_attempts as f64
        };

        PipelineStats {
            pattern_success,
            llm_success,
            regex_success,
            total_attempts,
            success_rate,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_stage(
        stage: &Stage,
        mail: &MailRecord,
    ) -> std::result::Result<Vec<ExtractedCode>, ExtractionError> {
        let codes = stage.extractor.extract(&mail.text_body).await?;
        match mail.html_body.as_deref() {
            Some(html) if codes.is_empty() => stage.extractor.extract(&html_to_text(html)).await,
            _ => Ok(codes),
        }
    }

    fn finish(
        &self,
        codes: Vec<ExtractedCode>,
        method: ExtractionMethod,
        started: Instant,
    ) -> ExtractionOutcome {
        if !codes.is_empty() {
            self.metrics.record_success(method);
        }
        let duration = started.elapsed();
        debug!(
            %method,
            codes = codes.len(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Extraction finished"
        );
        ExtractionOutcome {
            codes,
            method_used: method,
            duration,
        }
    }
}

impl std::fmt::Debug for ExtractionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionPipeline")
            .field("methods", &self.methods())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PatternTemplate;
    use crate::model::CodeKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    /// Stage returning a fixed answer and counting calls.
    struct Scripted {
        method: ExtractionMethod,
        answer: Option<(&'static str, f64)>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(method: ExtractionMethod, answer: Option<(&'static str, f64)>) -> Arc<Self> {
            Arc::new(Self {
                method,
                answer,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(method: ExtractionMethod) -> Arc<Self> {
            Arc::new(Self {
                method,
                answer: None,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodeExtractor for Scripted {
        fn method(&self) -> ExtractionMethod {
            self.method
        }

        async fn extract(&self, _text: &str) -> std::result::Result<Vec<ExtractedCode>, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExtractionError::LlmResponse {
                    message: "scripted failure".into(),
                });
            }
            Ok(self
                .answer
                .map(|(value, confidence)| {
                    ExtractedCode::new(value, CodeKind::classify(value), "scripted", confidence)
                })
                .into_iter()
                .collect())
        }
    }

    fn mail(body: &str) -> MailRecord {
        MailRecord::new("me@x.com", "bot@y.com", "Subject", body, Utc::now())
    }

    fn pipeline(stages: Vec<Arc<dyn CodeExtractor>>) -> ExtractionPipeline {
        ExtractionPipeline::with_extractors(&ExtractionConfig::default(), stages).unwrap()
    }

    #[tokio::test]
    async fn test_confident_pattern_skips_llm() {
        let library = Arc::new(PatternLibrary::new());
        library
            .insert(PatternTemplate::new(vec!["code:".into()], "000000").with_confidence(0.90))
            .unwrap();
        let llm = Scripted::new(ExtractionMethod::Llm, Some(("999999", 0.99)));

        let pipeline = pipeline(vec![
            Arc::new(PatternExtractor::new(library)),
            llm.clone(),
            Arc::new(RegexExtractor::new()),
        ]);
        let outcome = pipeline
            .extract_smart(&mail("Your code: 123456"), None)
            .await
            .unwrap();

        assert_eq!(outcome.method_used, ExtractionMethod::Pattern);
        assert_eq!(outcome.best().unwrap().value(), "123456");
        assert_eq!(llm.calls(), 0);
        assert_eq!(pipeline.stats().pattern_success, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_falls_through() {
        let pattern = Scripted::new(ExtractionMethod::Pattern, Some(("1111", 0.5)));
        let llm = Scripted::new(ExtractionMethod::Llm, Some(("2222", 0.7)));
        let pipeline = pipeline(vec![pattern.clone(), llm.clone(), Arc::new(RegexExtractor::new())]);

        let outcome = pipeline
            .extract_smart(&mail("Your verification code is 482931."), None)
            .await
            .unwrap();

        assert_eq!(outcome.method_used, ExtractionMethod::Regex);
        assert_eq!(outcome.best().unwrap().value(), "482931");
        assert_eq!(pattern.calls(), 1);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_stage_is_skipped() {
        let llm = Scripted::failing(ExtractionMethod::Llm);
        let pipeline = pipeline(vec![llm.clone(), Arc::new(RegexExtractor::new())]);

        let outcome = pipeline
            .extract_smart(&mail("code 123456"), None)
            .await
            .unwrap();
        assert_eq!(outcome.method_used, ExtractionMethod::Regex);
        // No HTML body, so no second attempt
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_last_stage_propagates() {
        let pipeline = pipeline(vec![Scripted::failing(ExtractionMethod::Regex)]);
        let err = pipeline
            .extract_smart(&mail("code 123456"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Extraction {
                method: ExtractionMethod::Regex,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_preferred_method_runs_alone() {
        let pattern = Scripted::new(ExtractionMethod::Pattern, Some(("1111", 0.99)));
        let pipeline = pipeline(vec![pattern.clone(), Arc::new(RegexExtractor::new())]);

        let outcome = pipeline
            .extract_smart(&mail("nothing to see"), Some(ExtractionMethod::Regex))
            .await
            .unwrap();
        assert!(outcome.codes.is_empty());
        assert_eq!(outcome.method_used, ExtractionMethod::Regex);
        assert_eq!(pattern.calls(), 0);

    }

    #[tokio::test]
    async fn test_unconfigured_preferred_method_finds_nothing() {
        let pipeline = pipeline(vec![Arc::new(RegexExtractor::new())]);

        let outcome = pipeline
            .extract_smart(&mail("code 123456"), Some(ExtractionMethod::Llm))
            .await
            .unwrap();
        assert!(outcome.codes.is_empty());
        assert_eq!(outcome.method_used, ExtractionMethod::Llm);
    }

    #[tokio::test]
    async fn test_html_retry() {
        let pipeline = pipeline(vec![Arc::new(RegexExtractor::new())]);
        let mail = mail("See the HTML part.").with_html("<p>Your code is <strong>735102</strong></p>");

        let outcome = pipeline.extract_smart(&mail, None).await.unwrap();
        assert_eq!(outcome.best().unwrap().value(), "735102");
    }

    #[tokio::test]
    async fn test_annotate_filters_by_confidence() {
        let pipeline = pipeline(vec![Arc::new(RegexExtractor::new())]);
        let mut mail = mail("Your code is 482931, order AB12CD9");

        let outcome = pipeline.annotate(&mut mail, None, 0.8).await.unwrap();
        let codes = mail.codes.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].value(), "482931");
        assert_eq!(outcome.codes, codes);
    }

    #[tokio::test]
    async fn test_stats_success_rate() {
        let pipeline = pipeline(vec![Arc::new(RegexExtractor::new())]);
        pipeline.extract_smart(&mail("code 123456"), None).await.unwrap();
        pipeline.extract_smart(&mail("nothing"), None).await.unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.regex_success, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_standard_cascade_skips_inactive_llm() {
        let pipeline =
            ExtractionPipeline::new(&SyncConfig::default(), Arc::new(PatternLibrary::new())).unwrap();
        assert_eq!(
            pipeline.methods(),
            [ExtractionMethod::Pattern, ExtractionMethod::Regex]
        );
        assert!(ExtractionPipeline::with_extractors(&ExtractionConfig::default(), Vec::new()).is_err());
    }
}
