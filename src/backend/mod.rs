//! Capability interfaces over the external neural models.
//!
//! The pipeline consumes these narrow traits; the models themselves
//! (ASR encoder/decoder, whole-chunk transcriber, voice-activity
//! detector, diarization embedder, translation model) live outside this
//! crate. Stateless handles are shared across sessions behind `Arc`;
//! stateful handles (decoder, VAD, diarizer) are owned per session.
//!
//! Deterministic scripted implementations for tests live in
//! [`mock`](crate::backend::mock).

pub mod mock;

use std::sync::Arc;

use crate::error::{EsError, EsResult};

pub type TokenId = u32;

// ---------------------------------------------------------------------------
// Encoder output
// ---------------------------------------------------------------------------

/// Encoder representation of an audio window: a frame grid with a fixed
/// time step, annotated with the stream time of its first frame so
/// attention positions map back onto the session time axis.
#[derive(Debug, Clone)]
pub struct EncoderFrames {
    frames: Vec<Vec<f32>>,
    time_per_frame: f64,
    start_time: f64,
}

impl EncoderFrames {
    #[must_use]
    pub fn new(frames: Vec<Vec<f32>>, time_per_frame: f64, start_time: f64) -> Self {
        Self {
            frames,
            time_per_frame,
            start_time,
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn time_per_frame(&self) -> f64 {
        self.time_per_frame
    }

    /// Stream time of frame 0.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    #[must_use]
    pub fn frame(&self, index: usize) -> &[f32] {
        &self.frames[index]
    }

    /// Stream time of the left edge of frame `index`.
    #[must_use]
    pub fn frame_time(&self, index: usize) -> f64 {
        self.start_time + index as f64 * self.time_per_frame
    }
}

// ---------------------------------------------------------------------------
// Cross-attention of one decode step
// ---------------------------------------------------------------------------

/// Attention weights of a single candidate token over the encoder frame
/// axis, one vector per (decoder layer, head).
#[derive(Debug, Clone, Default)]
pub struct CrossAttention {
    heads: Vec<((u16, u16), Vec<f32>)>,
}

impl CrossAttention {
    #[must_use]
    pub fn new(heads: Vec<((u16, u16), Vec<f32>)>) -> Self {
        Self { heads }
    }

    #[must_use]
    pub fn head(&self, layer: u16, head: u16) -> Option<&[f32]> {
        self.heads
            .iter()
            .find(|((l, h), _)| *l == layer && *h == head)
            .map(|(_, w)| w.as_slice())
    }

    /// Attention averaged over the given alignment heads. Heads absent
    /// from this step are skipped; an empty selection averages every head.
    #[must_use]
    pub fn averaged(&self, alignment_heads: &[(u16, u16)], frame_count: usize) -> Vec<f32> {
        let mut sum = vec![0.0f32; frame_count];
        let mut used = 0usize;
        for ((layer, head), weights) in &self.heads {
            if !alignment_heads.is_empty() && !alignment_heads.contains(&(*layer, *head)) {
                continue;
            }
            for (i, w) in weights.iter().take(frame_count).enumerate() {
                sum[i] += w;
            }
            used += 1;
        }
        if used > 1 {
            let norm = used as f32;
            for value in &mut sum {
                *value /= norm;
            }
        }
        sum
    }
}

/// One greedy decode step.
#[derive(Debug, Clone)]
pub struct DecoderStep {
    pub token: TokenId,
    /// Text piece for the token, including its leading-whitespace policy.
    pub piece: String,
    pub probability: Option<f64>,
    /// End-of-transcript: no token was produced.
    pub is_end: bool,
    pub attention: CrossAttention,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Incremental ASR encoder: 16 kHz mono s16le in, frame grid out.
pub trait AsrEncoder: Send + Sync {
    /// Encode an audio window whose first sample sits at `start_time`
    /// on the session time axis.
    fn encode(&self, pcm: &[i16], start_time: f64) -> EsResult<EncoderFrames>;
}

/// Stateful ASR decoder driven one token at a time. Implementations may
/// cache per-history state internally; `history` is always the full
/// committed token sequence, so a cache keyed on it can resume or roll
/// back speculative continuations.
pub trait AsrDecoder: Send {
    fn step(&mut self, history: &[TokenId], frames: &EncoderFrames) -> EsResult<DecoderStep>;

    /// Drop all decoder state; the next `step` starts from scratch.
    fn reset(&mut self);

    /// Discard cached state for audio before `anchor_time`. After this
    /// call, decoding from the retained cache must match a full
    /// recompute over the trimmed window.
    fn trim_cache(&mut self, anchor_time: f64) -> EsResult<()>;
}

/// A time-stamped word of one whole-chunk hypothesis. Times are relative
/// to the start of the transcribed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct HypothesisWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub probability: Option<f64>,
}

/// Whole-chunk transcriber used by the LocalAgreement policy: each call
/// re-transcribes the suffix window from scratch.
pub trait AsrWholeChunkTranscriber: Send + Sync {
    fn transcribe(&self, pcm: &[i16], language_hint: Option<&str>)
        -> EsResult<Vec<HypothesisWord>>;
}

/// Voice-activity transition reported by the detector, in absolute
/// stream sample indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadVerdict {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// Voice-activity detector fed fixed windows of
/// [`vad::VAD_WINDOW`](crate::vad::VAD_WINDOW) samples.
pub trait Vad: Send {
    fn feed(&mut self, window: &[i16]) -> EsResult<Option<VadVerdict>>;
}

/// A speaker interval as decided by the diarization model, carrying its
/// internal cluster id. Raw intervals may overlap; the pipeline merges
/// and relabels them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSpeakerInterval {
    pub internal_id: u64,
    pub start: f64,
    pub end: f64,
}

pub trait Diarizer: Send {
    /// Feed a PCM tap aligned with the transcriber's view; returns any
    /// intervals the model has finalized.
    fn feed(&mut self, pcm: &[i16], stream_time: f64) -> EsResult<Vec<RawSpeakerInterval>>;

    /// Notify the model of a silence gap of `duration` seconds.
    fn silence(&mut self, _duration: f64) {}
}

pub trait Translator: Send + Sync {
    fn translate(&self, source_lang: &str, target_lang: &str, text: &str) -> EsResult<String>;
}

// ---------------------------------------------------------------------------
// Per-session handle bundle
// ---------------------------------------------------------------------------

/// The model handles one session runs against. Shared stateless handles
/// are `Arc`s (many sessions, one model in memory); stateful handles are
/// owned by the session.
pub struct ModelBundle {
    pub encoder: Option<Arc<dyn AsrEncoder>>,
    pub decoder: Option<Box<dyn AsrDecoder>>,
    /// Alignment heads: the (layer, head) pairs whose averaged
    /// cross-attention localizes tokens in time.
    pub alignment_heads: Vec<(u16, u16)>,
    pub whole_chunk: Option<Arc<dyn AsrWholeChunkTranscriber>>,
    pub vad: Box<dyn Vad>,
    pub diarizer: Option<Box<dyn Diarizer>>,
    pub translator: Option<Arc<dyn Translator>>,
}

impl ModelBundle {
    /// Verify the bundle provides every capability the configuration
    /// asks for.
    pub fn validate(&self, config: &crate::config::SessionConfig) -> EsResult<()> {
        match config.backend_policy {
            crate::config::BackendPolicy::AlignAtt => {
                if self.encoder.is_none() || self.decoder.is_none() {
                    return Err(EsError::InvalidConfig(
                        "align_att policy requires an ASR encoder and decoder".to_owned(),
                    ));
                }
            }
            crate::config::BackendPolicy::LocalAgreement => {
                if self.whole_chunk.is_none() {
                    return Err(EsError::InvalidConfig(
                        "local_agreement policy requires a whole-chunk transcriber".to_owned(),
                    ));
                }
            }
        }
        if config.diarization && self.diarizer.is_none() {
            return Err(EsError::InvalidConfig(
                "diarization enabled but no diarizer provided".to_owned(),
            ));
        }
        if config.translation && self.translator.is_none() {
            return Err(EsError::InvalidConfig(
                "translation enabled but no translator provided".to_owned(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("encoder", &self.encoder.is_some())
            .field("decoder", &self.decoder.is_some())
            .field("whole_chunk", &self.whole_chunk.is_some())
            .field("diarizer", &self.diarizer.is_some())
            .field("translator", &self.translator.is_some())
            .field("alignment_heads", &self.alignment_heads.len())
            .finish()
    }
}
