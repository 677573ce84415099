use serde::{Deserialize, Serialize};

use crate::config::TimestampFormat;

// ---------------------------------------------------------------------------
// Stream constants
// ---------------------------------------------------------------------------

/// The pipeline's internal sample rate. The decoder child resamples all
/// input to this rate; PCM-input sessions must already be at it.
pub const SAMPLE_RATE: u32 = 16_000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Speaker label on silence marker tokens.
pub const SPEAKER_SILENCE: i32 = -2;
/// Speaker label when no diarization information will ever arrive.
pub const SPEAKER_UNASSIGNED: i32 = -1;
/// Speaker label while the token's audio has not been diarized yet.
pub const SPEAKER_PENDING: i32 = 0;

#[must_use]
pub fn samples_to_seconds(samples: u64) -> f64 {
    samples as f64 / f64::from(SAMPLE_RATE)
}

/// Sentence-terminal punctuation across the scripts the pipeline handles.
/// A token ends a sentence iff its trimmed text ends with one of these.
pub const SENTENCE_TERMINALS: [char; 6] = ['.', '?', '!', '。', '？', '！'];

#[must_use]
pub fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .chars()
        .next_back()
        .is_some_and(|c| SENTENCE_TERMINALS.contains(&c))
}

// ---------------------------------------------------------------------------
// Timeline atoms
// ---------------------------------------------------------------------------

/// An atomic committed unit of transcript. Once published, `(start, text)`
/// never change; `speaker` may be resolved later as diarization catches up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub probability: Option<f64>,
    pub speaker: i32,
    pub language: Option<String>,
}

impl Token {
    #[must_use]
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            probability: None,
            speaker: SPEAKER_UNASSIGNED,
            language: None,
        }
    }

    /// A −2 marker spanning a silence region of the stream.
    #[must_use]
    pub fn silence_marker(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            text: String::new(),
            probability: None,
            speaker: SPEAKER_SILENCE,
            language: None,
        }
    }

    #[must_use]
    pub fn is_silence_marker(&self) -> bool {
        self.speaker == SPEAKER_SILENCE
    }
}

/// The unstable suffix of the transcript not yet committed. Replaced in
/// full on each publication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TentativeBuffer {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TentativeBuffer {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn clear(&mut self) {
        self.start = 0.0;
        self.end = 0.0;
        self.text.clear();
    }
}

/// Relative speaker labelling over a time range. `speaker` is a dense
/// session-wide label ≥ 1 assigned in first-appearance order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInterval {
    pub speaker: i32,
    pub start: f64,
    pub end: f64,
}

impl SpeakerInterval {
    /// Length of the intersection with `[start, end]`, floored at zero.
    #[must_use]
    pub fn intersection(&self, start: f64, end: f64) -> f64 {
        (self.end.min(end) - self.start.max(start)).max(0.0)
    }
}

/// Translated text aligned to a span of committed tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Subscriber-facing output
// ---------------------------------------------------------------------------

/// A segment timestamp: raw seconds or a `H:MM:SS` clock string. The
/// choice is fixed per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    Seconds(f64),
    Clock(String),
}

#[must_use]
pub fn format_timestamp(seconds: f64, format: TimestampFormat) -> TimestampValue {
    match format {
        TimestampFormat::Seconds => TimestampValue::Seconds((seconds * 100.0).round() / 100.0),
        TimestampFormat::Clock => {
            let total = seconds.max(0.0).round() as u64;
            let h = total / 3600;
            let m = (total % 3600) / 60;
            let s = total % 60;
            TimestampValue::Clock(format!("{h}:{m:02}:{s:02}"))
        }
    }
}

/// A display-level grouping of committed tokens: one speaker, bounded by
/// a sentence terminator, a speaker change, or a long gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: TimestampValue,
    pub end: TimestampValue,
    pub text: String,
    pub speaker: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    NoAudio,
    Finalized,
    Error,
}

/// One observable state of the session, pushed to the subscriber whenever
/// the fingerprinted portion changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: SessionStatus,
    pub lines: Vec<Segment>,
    pub buffer_transcription: String,
    pub buffer_diarization: String,
    pub buffer_translation: String,
    pub remaining_time_transcription: f64,
    pub remaining_time_diarization: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Snapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: SessionStatus::NoAudio,
            lines: Vec::new(),
            buffer_transcription: String::new(),
            buffer_diarization: String::new(),
            buffer_translation: String::new(),
            remaining_time_transcription: 0.0,
            remaining_time_diarization: 0.0,
            error: None,
        }
    }
}

/// Session startup parameters echoed to the subscriber before the first
/// snapshot, so it knows how to interpret what follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub started_at: String,
    pub timestamp_format: TimestampFormat,
    pub diarization: bool,
    pub translation: bool,
}

/// The subscriber event stream: one `Config`, any number of `Snapshot`s,
/// then exactly one `ReadyToStop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Config(SessionDescriptor),
    Snapshot(Snapshot),
    ReadyToStop,
}

// ---------------------------------------------------------------------------
// Shared per-session state
// ---------------------------------------------------------------------------

/// Mutable session state. Owned behind one per-session lock; stage
/// workers integrate their results here, the aligner consumes the
/// `new_*` deltas on each publisher tick.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Committed timeline, append-only, non-decreasing in `start`.
    pub tokens: Vec<Token>,
    pub tentative: TentativeBuffer,
    /// Post-processed speaker intervals, sorted by start.
    pub speaker_intervals: Vec<SpeakerInterval>,
    pub translations: Vec<Translation>,
    pub translation_tentative: TentativeBuffer,

    /// Monotone watermark: stream time up to which transcription output
    /// is final.
    pub end_of_committed_audio: f64,
    /// Monotone watermark: stream time up to which speaker intervals are
    /// final.
    pub end_of_diarized_audio: f64,
    /// Stream time of the ingress head (total decoded samples).
    pub ingress_time: f64,

    pub new_tokens: Vec<Token>,
    pub new_speaker_intervals: Vec<SpeakerInterval>,
    pub new_translations: Vec<Translation>,

    /// Set once by whichever stage hits a fatal error first.
    pub fatal_error: Option<String>,
}

impl SessionState {
    /// Append freshly committed tokens, keeping the ordering invariant
    /// and advancing the committed-audio watermark to the best candidate.
    pub fn integrate_tokens(&mut self, tokens: Vec<Token>, processed_to: f64) {
        for token in tokens {
            debug_assert!(
                self.tokens.last().map_or(true, |t| token.start >= t.start),
                "committed tokens must be non-decreasing in start"
            );
            self.new_tokens.push(token.clone());
            self.tokens.push(token);
        }
        let mut watermark = self.end_of_committed_audio.max(processed_to);
        if let Some(last) = self.tokens.last() {
            watermark = watermark.max(last.end);
        }
        if !self.tentative.is_empty() {
            watermark = watermark.max(self.tentative.end);
        }
        self.end_of_committed_audio = watermark;
    }

    /// Strip a freshly committed prefix from the tentative buffer so the
    /// same words are never shown both committed and tentative.
    pub fn dedup_tentative_prefix(&mut self, committed_text: &str) {
        let committed = committed_text.trim_start();
        if committed.is_empty() {
            return;
        }
        let current = self.tentative.text.trim_start();
        if let Some(rest) = current.strip_prefix(committed) {
            self.tentative.text = rest.trim_start().to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_terminals_cover_cjk_and_latin() {
        assert!(ends_sentence("Hello."));
        assert!(ends_sentence("really?"));
        assert!(ends_sentence("stop!"));
        assert!(ends_sentence("了。"));
        assert!(ends_sentence("ですか？"));
        assert!(ends_sentence("trailing spaces.  "));
        assert!(!ends_sentence("comma,"));
        assert!(!ends_sentence("word"));
        assert!(!ends_sentence(""));
    }

    #[test]
    fn clock_timestamps_render_h_mm_ss() {
        let ts = format_timestamp(3725.0, TimestampFormat::Clock);
        assert_eq!(ts, TimestampValue::Clock("1:02:05".to_owned()));
        let ts = format_timestamp(59.6, TimestampFormat::Clock);
        assert_eq!(ts, TimestampValue::Clock("0:01:00".to_owned()));
        let ts = format_timestamp(0.0, TimestampFormat::Clock);
        assert_eq!(ts, TimestampValue::Clock("0:00:00".to_owned()));
    }

    #[test]
    fn seconds_timestamps_round_to_centiseconds() {
        let ts = format_timestamp(1.23456, TimestampFormat::Seconds);
        assert_eq!(ts, TimestampValue::Seconds(1.23));
    }

    #[test]
    fn timestamp_value_serializes_untagged() {
        let json = serde_json::to_string(&TimestampValue::Seconds(1.5)).expect("serialize");
        assert_eq!(json, "1.5");
        let json =
            serde_json::to_string(&TimestampValue::Clock("0:00:01".to_owned())).expect("serialize");
        assert_eq!(json, r#""0:00:01""#);
    }

    #[test]
    fn interval_intersection() {
        let interval = SpeakerInterval {
            speaker: 1,
            start: 1.0,
            end: 3.0,
        };
        assert!((interval.intersection(2.0, 4.0) - 1.0).abs() < 1e-9);
        assert!((interval.intersection(0.0, 10.0) - 2.0).abs() < 1e-9);
        assert!((interval.intersection(5.0, 6.0)).abs() < 1e-9);
    }

    #[test]
    fn silence_marker_has_silence_speaker() {
        let marker = Token::silence_marker(1.0, 7.5);
        assert!(marker.is_silence_marker());
        assert_eq!(marker.speaker, SPEAKER_SILENCE);
        assert!(marker.text.is_empty());
    }

    #[test]
    fn integrate_tokens_advances_watermark_to_best_candidate() {
        let mut state = SessionState::default();
        state.tentative = TentativeBuffer {
            start: 1.0,
            end: 2.5,
            text: "pending".to_owned(),
        };
        state.integrate_tokens(vec![Token::new(0.0, 1.0, "hello")], 1.2);
        // Tentative end (2.5) is the furthest candidate.
        assert!((state.end_of_committed_audio - 2.5).abs() < 1e-9);
        assert_eq!(state.tokens.len(), 1);
        assert_eq!(state.new_tokens.len(), 1);
    }

    #[test]
    fn watermark_never_regresses() {
        let mut state = SessionState::default();
        state.integrate_tokens(vec![Token::new(0.0, 3.0, "hello")], 3.0);
        state.integrate_tokens(Vec::new(), 1.0);
        assert!((state.end_of_committed_audio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn dedup_tentative_prefix_strips_committed_text() {
        let mut state = SessionState::default();
        state.tentative.text = "hello world how".to_owned();
        state.dedup_tentative_prefix("hello world");
        assert_eq!(state.tentative.text, "how");
    }

    #[test]
    fn dedup_tentative_prefix_no_match_is_noop() {
        let mut state = SessionState::default();
        state.tentative.text = "different text".to_owned();
        state.dedup_tentative_prefix("hello");
        assert_eq!(state.tentative.text, "different text");
    }

    #[test]
    fn snapshot_json_shape() {
        let snapshot = Snapshot {
            status: SessionStatus::Active,
            lines: vec![Segment {
                start: TimestampValue::Seconds(0.0),
                end: TimestampValue::Seconds(1.0),
                text: "Hello world.".to_owned(),
                speaker: 1,
                translation: None,
                detected_language: None,
            }],
            buffer_transcription: "how".to_owned(),
            buffer_diarization: String::new(),
            buffer_translation: String::new(),
            remaining_time_transcription: 0.4,
            remaining_time_diarization: 0.0,
            error: None,
        };
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["status"], "active");
        assert_eq!(json["lines"][0]["speaker"], 1);
        assert_eq!(json["buffer_transcription"], "how");
        // Optional fields are omitted, not null.
        assert!(json["lines"][0].get("translation").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn output_event_tagging() {
        let json = serde_json::to_value(&OutputEvent::ReadyToStop).expect("serialize");
        assert_eq!(json["type"], "ready_to_stop");
    }
}
