//! Deterministic scripted model implementations.
//!
//! These back the test suite: every external capability gets a mock
//! whose outputs are fully prescribed, so pipeline runs are repeatable
//! byte for byte. They are also handy as wiring examples for real
//! adapters.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{EsError, EsResult};

use super::{
    AsrDecoder, AsrEncoder, AsrWholeChunkTranscriber, CrossAttention, DecoderStep, Diarizer,
    EncoderFrames, HypothesisWord, RawSpeakerInterval, TokenId, Translator, Vad, VadVerdict,
};

/// Samples per encoder frame at 16 kHz with a 20 ms frame step.
const SAMPLES_PER_FRAME: usize = 320;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encoder producing one scalar frame per 20 ms of input. The frame
/// value is the window's mean absolute amplitude, which is enough for
/// scripted decoders that only look at the frame grid.
#[derive(Debug, Default)]
pub struct MockEncoder;

impl AsrEncoder for MockEncoder {
    fn encode(&self, pcm: &[i16], start_time: f64) -> EsResult<EncoderFrames> {
        let frames = pcm
            .chunks(SAMPLES_PER_FRAME)
            .map(|chunk| {
                let energy = chunk.iter().map(|s| f64::from(s.unsigned_abs())).sum::<f64>()
                    / chunk.len().max(1) as f64;
                vec![energy as f32]
            })
            .collect();
        Ok(EncoderFrames::new(frames, 0.02, start_time))
    }
}

// ---------------------------------------------------------------------------
// Scripted streaming decoder
// ---------------------------------------------------------------------------

/// One prescribed token of a [`ScriptedDecoder`].
#[derive(Debug, Clone)]
pub struct ScriptedToken {
    pub piece: String,
    /// Stream time where the token's attention peak lands. Peaks past
    /// the current window clamp to the live edge, which keeps the token
    /// tentative under the fire rule.
    pub peak_time: f64,
    /// The decoder only produces this token once the encoded window
    /// reaches this stream time; a model cannot decode audio it has not
    /// heard. Defaults to `peak_time`.
    pub available_from: f64,
    pub probability: Option<f64>,
}

impl ScriptedToken {
    #[must_use]
    pub fn new(piece: impl Into<String>, peak_time: f64) -> Self {
        Self {
            piece: piece.into(),
            peak_time,
            available_from: peak_time,
            probability: Some(0.9),
        }
    }

    #[must_use]
    pub fn with_available_from(mut self, available_from: f64) -> Self {
        self.available_from = available_from;
        self
    }
}

/// Decoder that replays a fixed token script. Token ids are script
/// indices, so any `history` slice identifies the next entry; this makes
/// speculative continuations and cache rollback trivial.
pub struct ScriptedDecoder {
    script: Vec<ScriptedToken>,
    fail_next: Mutex<u32>,
    resets: Mutex<u32>,
    trim_anchors: Mutex<Vec<f64>>,
}

impl ScriptedDecoder {
    #[must_use]
    pub fn new(script: Vec<ScriptedToken>) -> Self {
        Self {
            script,
            fail_next: Mutex::new(0),
            resets: Mutex::new(0),
            trim_anchors: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` calls to `step` fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock().expect("lock poisoned") = count;
    }

    #[must_use]
    pub fn reset_count(&self) -> u32 {
        *self.resets.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn trim_anchors(&self) -> Vec<f64> {
        self.trim_anchors.lock().expect("lock poisoned").clone()
    }

    fn one_hot_attention(frames: &EncoderFrames, peak_time: f64) -> CrossAttention {
        let count = frames.frame_count();
        if count == 0 {
            return CrossAttention::default();
        }
        let raw = (peak_time - frames.start_time()) / frames.time_per_frame();
        let index = raw.max(0.0).floor() as usize;
        let index = index.min(count - 1);
        let mut weights = vec![0.0f32; count];
        weights[index] = 1.0;
        CrossAttention::new(vec![((0, 0), weights.clone()), ((0, 1), weights)])
    }
}

impl AsrDecoder for ScriptedDecoder {
    fn step(&mut self, history: &[TokenId], frames: &EncoderFrames) -> EsResult<DecoderStep> {
        {
            let mut fail = self.fail_next.lock().expect("lock poisoned");
            if *fail > 0 {
                *fail -= 1;
                return Err(EsError::AsrTransient("scripted decode failure".to_owned()));
            }
        }

        let index = history.len();
        let window_end =
            frames.start_time() + frames.frame_count() as f64 * frames.time_per_frame();
        let entry = match self.script.get(index) {
            Some(entry) if entry.available_from <= window_end + 1e-9 => entry,
            _ => {
                return Ok(DecoderStep {
                    token: index as TokenId,
                    piece: String::new(),
                    probability: None,
                    is_end: true,
                    attention: CrossAttention::default(),
                });
            }
        };

        Ok(DecoderStep {
            token: index as TokenId,
            piece: entry.piece.clone(),
            probability: entry.probability,
            is_end: false,
            attention: Self::one_hot_attention(frames, entry.peak_time),
        })
    }

    fn reset(&mut self) {
        *self.resets.lock().expect("lock poisoned") += 1;
    }

    fn trim_cache(&mut self, anchor_time: f64) -> EsResult<()> {
        self.trim_anchors
            .lock()
            .expect("lock poisoned")
            .push(anchor_time);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted whole-chunk transcriber
// ---------------------------------------------------------------------------

/// Convenience constructor for scripted hypothesis words.
#[must_use]
pub fn word(text: &str, start: f64, end: f64) -> HypothesisWord {
    HypothesisWord {
        word: text.to_owned(),
        start,
        end,
        probability: Some(0.9),
    }
}

/// Whole-chunk transcriber replaying one prescribed hypothesis per call.
/// When the script runs out, the last hypothesis repeats, which mirrors
/// a real model converging on stable output.
pub struct ScriptedWholeChunk {
    hypotheses: Mutex<VecDeque<Vec<HypothesisWord>>>,
    last: Mutex<Vec<HypothesisWord>>,
    fail_next: Mutex<u32>,
}

impl ScriptedWholeChunk {
    #[must_use]
    pub fn new(hypotheses: Vec<Vec<HypothesisWord>>) -> Self {
        Self {
            hypotheses: Mutex::new(hypotheses.into()),
            last: Mutex::new(Vec::new()),
            fail_next: Mutex::new(0),
        }
    }

    /// Make the next `count` calls to `transcribe` fail transiently.
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock().expect("lock poisoned") = count;
    }
}

impl AsrWholeChunkTranscriber for ScriptedWholeChunk {
    fn transcribe(
        &self,
        _pcm: &[i16],
        _language_hint: Option<&str>,
    ) -> EsResult<Vec<HypothesisWord>> {
        {
            let mut fail = self.fail_next.lock().expect("lock poisoned");
            if *fail > 0 {
                *fail -= 1;
                return Err(EsError::AsrTransient(
                    "scripted transcription failure".to_owned(),
                ));
            }
        }

        let mut queue = self.hypotheses.lock().expect("lock poisoned");
        if let Some(next) = queue.pop_front() {
            *self.last.lock().expect("lock poisoned") = next.clone();
            Ok(next)
        } else {
            Ok(self.last.lock().expect("lock poisoned").clone())
        }
    }
}

// ---------------------------------------------------------------------------
// Voice-activity detection
// ---------------------------------------------------------------------------

/// Amplitude-threshold VAD. Reports the first loud sample as the voice
/// start and the first window that falls quiet as the voice end.
pub struct EnergyVad {
    threshold: i16,
    active: bool,
    samples_seen: u64,
}

impl EnergyVad {
    #[must_use]
    pub fn new(threshold: i16) -> Self {
        Self {
            threshold,
            active: false,
            samples_seen: 0,
        }
    }
}

impl Vad for EnergyVad {
    fn feed(&mut self, window: &[i16]) -> EsResult<Option<VadVerdict>> {
        let first_loud = window
            .iter()
            .position(|s| s.unsigned_abs() >= self.threshold as u16);
        let window_start = self.samples_seen;
        self.samples_seen += window.len() as u64;

        let verdict = match (self.active, first_loud) {
            (false, Some(offset)) => {
                self.active = true;
                Some(VadVerdict {
                    start: Some(window_start + offset as u64),
                    end: None,
                })
            }
            (true, None) => {
                self.active = false;
                Some(VadVerdict {
                    start: None,
                    end: Some(window_start),
                })
            }
            _ => None,
        };
        Ok(verdict)
    }
}

/// VAD that always errors; exercises the fatal `VadFailure` path.
pub struct BrokenVad;

impl Vad for BrokenVad {
    fn feed(&mut self, _window: &[i16]) -> EsResult<Option<VadVerdict>> {
        Err(EsError::VadFailure("scripted VAD failure".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Diarization
// ---------------------------------------------------------------------------

/// Diarizer that releases prescribed intervals once the stream time has
/// passed their end, in script order.
pub struct ScriptedDiarizer {
    script: Vec<RawSpeakerInterval>,
    emitted: usize,
    fail: bool,
}

impl ScriptedDiarizer {
    #[must_use]
    pub fn new(script: Vec<RawSpeakerInterval>) -> Self {
        Self {
            script,
            emitted: 0,
            fail: false,
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            script: Vec::new(),
            emitted: 0,
            fail: true,
        }
    }
}

impl Diarizer for ScriptedDiarizer {
    fn feed(&mut self, _pcm: &[i16], stream_time: f64) -> EsResult<Vec<RawSpeakerInterval>> {
        if self.fail {
            return Err(EsError::DiarizerFailure(
                "scripted diarizer failure".to_owned(),
            ));
        }
        let mut released = Vec::new();
        while let Some(interval) = self.script.get(self.emitted) {
            if interval.end <= stream_time {
                released.push(*interval);
                self.emitted += 1;
            } else {
                break;
            }
        }
        Ok(released)
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translator that tags the input with the target language, e.g.
/// `"[fr] Hello world."` — deterministic and easy to assert on.
pub struct TaggingTranslator;

impl Translator for TaggingTranslator {
    fn translate(&self, _source_lang: &str, target_lang: &str, text: &str) -> EsResult<String> {
        Ok(format!("[{target_lang}] {text}"))
    }
}

/// Translator that always errors; exercises translation degraded mode.
pub struct BrokenTranslator;

impl Translator for BrokenTranslator {
    fn translate(&self, _source_lang: &str, _target_lang: &str, _text: &str) -> EsResult<String> {
        Err(EsError::TranslatorFailure(
            "scripted translator failure".to_owned(),
        ))
    }
}
