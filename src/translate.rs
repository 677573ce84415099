//! Translation lane.
//!
//! Groups committed tokens at sentence boundaries (or a max-token
//! window when no boundary arrives) and hands each finished group to
//! the external translator. The in-flight group is exposed as the
//! translation tentative buffer so subscribers see partial output.
//! Failures skip the group rather than stall the pipeline; a run of
//! failures disables translation for the session (degraded mode).

use std::sync::Arc;

use crate::backend::Translator;
use crate::config::SessionConfig;
use crate::model::{ends_sentence, TentativeBuffer, Token, Translation};

/// A group is flushed even without a sentence boundary once it holds
/// this many tokens.
const MAX_GROUP_TOKENS: usize = 24;
/// ... or once it spans this much stream time.
const MAX_GROUP_SPAN_SEC: f64 = 8.0;
/// Consecutive failures before the lane disables itself.
const FAILURE_LIMIT: u32 = 3;

pub struct TranslationLane {
    translator: Arc<dyn Translator>,
    source_lang: String,
    target_lang: String,
    separator: String,
    group: Vec<Token>,
    tentative: TentativeBuffer,
    consecutive_failures: u32,
    disabled: bool,
}

impl TranslationLane {
    #[must_use]
    pub fn new(translator: Arc<dyn Translator>, config: &SessionConfig) -> Self {
        Self {
            translator,
            source_lang: config.language.clone(),
            target_lang: config.target_language.clone(),
            separator: config.backend_policy.word_separator().to_owned(),
            group: Vec::new(),
            tentative: TentativeBuffer::default(),
            consecutive_failures: 0,
            disabled: false,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn tentative(&self) -> &TentativeBuffer {
        &self.tentative
    }

    /// Accept one committed token; returns a finished `Translation`
    /// when the token closed a group.
    pub fn push_token(&mut self, token: &Token) -> Option<Translation> {
        if self.disabled || token.is_silence_marker() {
            return None;
        }
        self.group.push(token.clone());

        let boundary = ends_sentence(&token.text)
            || self.group.len() >= MAX_GROUP_TOKENS
            || self.group_span() >= MAX_GROUP_SPAN_SEC;

        if boundary {
            self.flush()
        } else {
            self.refresh_tentative();
            None
        }
    }

    /// Translate and emit whatever is in the open group.
    pub fn flush(&mut self) -> Option<Translation> {
        if self.disabled || self.group.is_empty() {
            return None;
        }
        let text = self.group_text();
        let start = self.group.first().map_or(0.0, |t| t.start);
        let end = self.group.last().map_or(0.0, |t| t.end);
        self.group.clear();
        self.tentative.clear();

        match self
            .translator
            .translate(&self.source_lang, &self.target_lang, &text)
        {
            Ok(translated) => {
                self.consecutive_failures = 0;
                Some(Translation {
                    start,
                    end,
                    text: translated,
                })
            }
            Err(error) => {
                self.consecutive_failures += 1;
                tracing::warn!(stage = "translation", %error, "translation group skipped");
                if self.consecutive_failures >= FAILURE_LIMIT {
                    self.disabled = true;
                    tracing::warn!(
                        stage = "translation",
                        "translator keeps failing; translation disabled for this session"
                    );
                }
                None
            }
        }
    }

    /// Partial translation of the open group, for the tentative buffer.
    /// Failures here are quiet; the group flush will retry anyway.
    fn refresh_tentative(&mut self) {
        let text = self.group_text();
        match self
            .translator
            .translate(&self.source_lang, &self.target_lang, &text)
        {
            Ok(translated) => {
                self.tentative = TentativeBuffer {
                    start: self.group.first().map_or(0.0, |t| t.start),
                    end: self.group.last().map_or(0.0, |t| t.end),
                    text: translated,
                };
            }
            Err(_) => self.tentative.clear(),
        }
    }

    fn group_text(&self) -> String {
        self.group
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator)
            .trim()
            .to_owned()
    }

    fn group_span(&self) -> f64 {
        match (self.group.first(), self.group.last()) {
            (Some(first), Some(last)) => last.end - first.start,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{BrokenTranslator, TaggingTranslator};
    use crate::config::{BackendPolicy, SessionConfig};

    fn config() -> SessionConfig {
        SessionConfig {
            backend_policy: BackendPolicy::LocalAgreement,
            language: "en".to_owned(),
            target_language: "fr".to_owned(),
            translation: true,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn sentence_boundary_closes_a_group() {
        let mut lane = TranslationLane::new(Arc::new(TaggingTranslator), &config());
        assert!(lane.push_token(&Token::new(0.0, 0.5, "Hello")).is_none());
        let translation = lane
            .push_token(&Token::new(0.6, 1.0, "world."))
            .expect("sentence end should flush");
        assert_eq!(translation.text, "[fr] Hello world.");
        assert!((translation.start - 0.0).abs() < 1e-9);
        assert!((translation.end - 1.0).abs() < 1e-9);
        assert!(lane.tentative().is_empty());
    }

    #[test]
    fn open_group_is_exposed_as_tentative() {
        let mut lane = TranslationLane::new(Arc::new(TaggingTranslator), &config());
        lane.push_token(&Token::new(0.0, 0.5, "Hello"));
        assert_eq!(lane.tentative().text, "[fr] Hello");
    }

    #[test]
    fn max_token_window_flushes_without_boundary() {
        let mut lane = TranslationLane::new(Arc::new(TaggingTranslator), &config());
        let mut flushed = None;
        for i in 0..MAX_GROUP_TOKENS {
            let t = i as f64 * 0.1;
            flushed = lane.push_token(&Token::new(t, t + 0.1, "word"));
            if flushed.is_some() {
                break;
            }
        }
        assert!(flushed.is_some(), "window cap should force a flush");
    }

    #[test]
    fn silence_markers_are_ignored() {
        let mut lane = TranslationLane::new(Arc::new(TaggingTranslator), &config());
        assert!(lane.push_token(&Token::silence_marker(0.0, 6.0)).is_none());
        assert!(lane.tentative().is_empty());
    }

    #[test]
    fn repeated_failures_disable_the_lane() {
        let mut lane = TranslationLane::new(Arc::new(BrokenTranslator), &config());
        for i in 0..FAILURE_LIMIT {
            assert!(!lane.is_disabled(), "not yet disabled at failure {i}");
            lane.push_token(&Token::new(0.0, 0.5, "Nope."));
        }
        assert!(lane.is_disabled());
        // Disabled lane swallows everything silently.
        assert!(lane.push_token(&Token::new(1.0, 1.5, "More.")).is_none());
    }

    #[test]
    fn flush_on_empty_group_is_a_noop() {
        let mut lane = TranslationLane::new(Arc::new(TaggingTranslator), &config());
        assert!(lane.flush().is_none());
    }
}
