use serde::{Deserialize, Serialize};

use crate::error::{EsError, EsResult};

/// Which stabilization policy decides when tentative ASR output is
/// promoted to committed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPolicy {
    /// Attention-fire: commit a token once its cross-attention mass has
    /// left the live edge of the encoder window. Low latency.
    AlignAtt,
    /// Hypothesis buffering: commit the longest common prefix of two
    /// successive re-transcriptions. Stability over latency.
    LocalAgreement,
}

impl BackendPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlignAtt => "align_att",
            Self::LocalAgreement => "local_agreement",
        }
    }

    /// Joiner between committed token texts. AlignAtt pieces carry their
    /// own leading whitespace; LocalAgreement words do not.
    #[must_use]
    pub const fn word_separator(self) -> &'static str {
        match self {
            Self::AlignAtt => "",
            Self::LocalAgreement => " ",
        }
    }
}

/// Where the LocalAgreement suffix window is cut when it grows past the
/// configured length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferTrimming {
    /// Prefer a sentence boundary, falling back to the last committed time.
    Sentence,
    /// Always the last committed time.
    Segment,
}

/// How segment timestamps are rendered in snapshots. Fixed per session
/// at startup and announced in the initial `config` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Raw seconds as JSON numbers.
    Seconds,
    /// `H:MM:SS` strings.
    Clock,
}

/// Per-session configuration. All fields have serde defaults so a
/// subscriber can send a partial configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backend_policy: BackendPolicy,
    /// Source language tag, or "auto" for model-side detection.
    pub language: String,
    /// Translation target language tag; empty disables translation.
    pub target_language: String,
    pub diarization: bool,
    pub translation: bool,
    /// When true, ingress frames are already 16 kHz mono s16le and the
    /// decoder child is bypassed.
    pub pcm_input: bool,

    /// AlignAtt: number of most-recent encoder frames treated as the
    /// live edge for the fire rule.
    pub frame_threshold: usize,
    /// AlignAtt: maximum attention mass allowed on the live edge for a
    /// token to be committed.
    pub fire_threshold: f64,
    /// AlignAtt: bound on the rolling audio window, seconds.
    pub audio_max_len: f64,
    /// AlignAtt: bound on tokens committed within a single tick.
    pub max_tokens_per_tick: usize,
    /// AlignAtt: bound on greedy continuation length in the tentative buffer.
    pub max_tentative_tokens: usize,
    pub beam_size: usize,

    /// LocalAgreement: where to cut the suffix window.
    pub buffer_trimming: BufferTrimming,
    /// LocalAgreement: suffix window length that triggers trimming, seconds.
    pub buffer_trimming_sec: f64,

    /// Snapshot cadence, Hz.
    pub publish_hz: f64,
    pub timestamp_format: TimestampFormat,

    /// A silence span becomes a timeline marker only past this duration.
    pub min_silence_marker_sec: f64,
    /// Wall-clock bound on the end-of-stream drain.
    pub drain_deadline_sec: f64,
    /// Total decoder child restart budget for the session.
    pub decoder_max_restarts: u32,
    /// Consecutive transient ASR failures tolerated before the session
    /// is terminated.
    pub asr_failure_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_policy: BackendPolicy::AlignAtt,
            language: "auto".to_owned(),
            target_language: String::new(),
            diarization: false,
            translation: false,
            pcm_input: false,
            frame_threshold: 25,
            fire_threshold: 0.25,
            audio_max_len: 30.0,
            max_tokens_per_tick: 16,
            max_tentative_tokens: 8,
            beam_size: 1,
            buffer_trimming: BufferTrimming::Segment,
            buffer_trimming_sec: 15.0,
            publish_hz: 20.0,
            timestamp_format: TimestampFormat::Seconds,
            min_silence_marker_sec: 5.0,
            drain_deadline_sec: 10.0,
            decoder_max_restarts: 3,
            asr_failure_budget: 5,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> EsResult<()> {
        if !(self.publish_hz > 0.0) {
            return Err(EsError::InvalidConfig(
                "publish_hz must be positive".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fire_threshold) {
            return Err(EsError::InvalidConfig(format!(
                "fire_threshold must be within [0, 1], got {}",
                self.fire_threshold
            )));
        }
        if self.frame_threshold == 0 {
            return Err(EsError::InvalidConfig(
                "frame_threshold must be at least 1".to_owned(),
            ));
        }
        if !(self.audio_max_len > 0.0) {
            return Err(EsError::InvalidConfig(
                "audio_max_len must be positive".to_owned(),
            ));
        }
        if !(self.buffer_trimming_sec > 0.0) {
            return Err(EsError::InvalidConfig(
                "buffer_trimming_sec must be positive".to_owned(),
            ));
        }
        if self.beam_size == 0 {
            return Err(EsError::InvalidConfig(
                "beam_size must be at least 1".to_owned(),
            ));
        }
        if self.max_tokens_per_tick == 0 {
            return Err(EsError::InvalidConfig(
                "max_tokens_per_tick must be at least 1".to_owned(),
            ));
        }
        if self.translation && self.target_language.is_empty() {
            return Err(EsError::InvalidConfig(
                "translation requires a target_language".to_owned(),
            ));
        }
        if !(self.drain_deadline_sec > 0.0) {
            return Err(EsError::InvalidConfig(
                "drain_deadline_sec must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Language hint handed to model adapters; `None` means auto-detect.
    #[must_use]
    pub fn language_hint(&self) -> Option<&str> {
        if self.language == "auto" {
            None
        } else {
            Some(self.language.as_str())
        }
    }

    #[must_use]
    pub fn publish_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.publish_hz)
    }
}
