//! The aligner: joins committed tokens, speaker intervals, and
//! translations on the shared time axis and re-emits the displayable
//! timeline.
//!
//! Runs under the session lock on each publisher tick, consuming the
//! `new_*` deltas the stage workers appended since the last pass.
//! Boundary precedence when grouping tokens into segments: a speaker
//! change is the strongest boundary, then sentence-terminal
//! punctuation, then a long gap.

use crate::config::SessionConfig;
use crate::diarize;
use crate::model::{
    ends_sentence, SessionState, Token, SPEAKER_PENDING,
};

/// Gap between consecutive tokens that forces a new segment.
const SEGMENT_GAP_SEC: f64 = 1.5;
/// Tolerance when testing whether a translation span is contained in a
/// segment span.
const TRANSLATION_TOLERANCE_SEC: f64 = 0.1;
/// Slack when comparing token ends against the diarized watermark.
const TIME_EPS: f64 = 1e-6;

/// A segment before timestamp rendering: plain seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDraft {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub speaker: i32,
    pub translation: Option<String>,
    pub detected_language: Option<String>,
}

/// One aligner pass over the observable timeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedView {
    pub segments: Vec<SegmentDraft>,
    /// Text of committed tokens still waiting for speaker attribution.
    pub buffer_diarization: String,
    pub remaining_time_transcription: f64,
    pub remaining_time_diarization: f64,
}

pub struct Aligner {
    diarization: bool,
    translation: bool,
    separator: String,
}

impl Aligner {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            diarization: config.diarization,
            translation: config.translation,
            separator: config.backend_policy.word_separator().to_owned(),
        }
    }

    /// Consume the deltas and rebuild the display timeline. Committed
    /// token `(start, text)` pairs are never altered here; only their
    /// speaker attribution and grouping evolve.
    pub fn update(&self, state: &mut SessionState) -> AlignedView {
        self.merge_speaker_intervals(state);
        self.assign_speakers(state);
        self.merge_translations(state);
        state.new_tokens.clear();

        let (segments, buffer_diarization) = self.build_segments(state);

        let remaining_transcription =
            (state.ingress_time - state.end_of_committed_audio).max(0.0);
        let remaining_diarization = if self.diarization {
            let latest_end = state
                .tokens
                .iter()
                .rev()
                .find(|t| !t.is_silence_marker())
                .map_or(state.end_of_committed_audio, |t| {
                    t.end.max(state.end_of_committed_audio)
                });
            (latest_end - state.end_of_diarized_audio).max(0.0)
        } else {
            0.0
        };

        AlignedView {
            segments,
            buffer_diarization,
            remaining_time_transcription: round_tenth(remaining_transcription),
            remaining_time_diarization: round_tenth(remaining_diarization),
        }
    }

    fn merge_speaker_intervals(&self, state: &mut SessionState) {
        if state.new_speaker_intervals.is_empty() {
            return;
        }
        state
            .speaker_intervals
            .append(&mut state.new_speaker_intervals);
        diarize::postprocess(&mut state.speaker_intervals);
    }

    /// Resolve pending tokens whose audio has been fully diarized: pick
    /// the interval with the largest intersection; ties break to the
    /// earlier interval; no intersection keeps the current assignment.
    fn assign_speakers(&self, state: &mut SessionState) {
        if !self.diarization {
            return;
        }
        let intervals = &state.speaker_intervals;
        for token in &mut state.tokens {
            if token.speaker != SPEAKER_PENDING
                || token.end > state.end_of_diarized_audio + TIME_EPS
            {
                continue;
            }
            let mut best: Option<(f64, i32)> = None;
            for interval in intervals {
                let overlap = interval.intersection(token.start, token.end);
                if overlap <= 0.0 {
                    continue;
                }
                // Strictly-greater keeps the earlier interval on ties.
                if best.map_or(true, |(b, _)| overlap > b) {
                    best = Some((overlap, interval.speaker));
                }
            }
            if let Some((_, speaker)) = best {
                token.speaker = speaker;
            }
        }
    }

    fn merge_translations(&self, state: &mut SessionState) {
        if state.new_translations.is_empty() {
            return;
        }
        state.translations.append(&mut state.new_translations);
        state
            .translations
            .sort_by(|a, b| a.start.total_cmp(&b.start));
    }

    fn build_segments(&self, state: &SessionState) -> (Vec<SegmentDraft>, String) {
        let mut segments: Vec<SegmentDraft> = Vec::new();
        let mut pending_text: Vec<&str> = Vec::new();
        let mut current: Option<SegmentBuilder> = None;

        for token in &state.tokens {
            if token.is_silence_marker() {
                if let Some(builder) = current.take() {
                    segments.push(builder.finish(&self.separator));
                }
                segments.push(SegmentDraft {
                    start: token.start,
                    end: token.end,
                    text: String::new(),
                    speaker: token.speaker,
                    translation: None,
                    detected_language: None,
                });
                continue;
            }

            // Tokens still awaiting attribution are shown in the
            // diarization buffer, not in the committed lines.
            if self.diarization && token.speaker == SPEAKER_PENDING {
                pending_text.push(token.text.as_str());
                continue;
            }

            let boundary = match &current {
                None => true,
                Some(builder) => {
                    builder.speaker != token.speaker
                        || builder.last_ends_sentence
                        || token.start - builder.end > SEGMENT_GAP_SEC
                }
            };

            if boundary {
                if let Some(builder) = current.take() {
                    segments.push(builder.finish(&self.separator));
                }
                current = Some(SegmentBuilder::start(token));
            } else if let Some(builder) = current.as_mut() {
                builder.push(token);
            }
        }
        if let Some(builder) = current.take() {
            segments.push(builder.finish(&self.separator));
        }

        if self.translation {
            for segment in &mut segments {
                self.attach_translation(segment, state);
            }
        }

        let buffer_diarization = pending_text.join(&self.separator).trim().to_owned();
        (segments, buffer_diarization)
    }

    /// A segment's translation is the concatenation of translations
    /// whose span is contained in the segment's span, with tolerance.
    fn attach_translation(&self, segment: &mut SegmentDraft, state: &SessionState) {
        let mut parts: Vec<&str> = Vec::new();
        for translation in &state.translations {
            if translation.start >= segment.start - TRANSLATION_TOLERANCE_SEC
                && translation.end <= segment.end + TRANSLATION_TOLERANCE_SEC
            {
                parts.push(translation.text.as_str());
            }
        }
        if !parts.is_empty() {
            segment.translation = Some(parts.join(" "));
        }
    }
}

struct SegmentBuilder {
    start: f64,
    end: f64,
    speaker: i32,
    texts: Vec<String>,
    last_ends_sentence: bool,
    detected_language: Option<String>,
}

impl SegmentBuilder {
    fn start(token: &Token) -> Self {
        Self {
            start: token.start,
            end: token.end,
            speaker: token.speaker,
            texts: vec![token.text.clone()],
            last_ends_sentence: ends_sentence(&token.text),
            detected_language: token.language.clone(),
        }
    }

    fn push(&mut self, token: &Token) {
        self.end = token.end;
        self.texts.push(token.text.clone());
        self.last_ends_sentence = ends_sentence(&token.text);
        if self.detected_language.is_none() {
            self.detected_language = token.language.clone();
        }
    }

    fn finish(self, separator: &str) -> SegmentDraft {
        SegmentDraft {
            start: self.start,
            end: self.end,
            text: self.texts.join(separator).trim().to_owned(),
            speaker: self.speaker,
            translation: None,
            detected_language: self.detected_language,
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
