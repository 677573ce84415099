//! AlignAtt: stabilization by attention-fire.
//!
//! Keeps a rolling audio window and a rolling decoder token history.
//! Each tick greedily decodes candidate tokens; a candidate is committed
//! once the cross-attention mass it places on the most recent encoder
//! frames (the live edge) drops below the fire threshold — the model has
//! localized the token earlier in the window, so later audio cannot
//! change it. Low latency: no second hypothesis is needed.

use std::sync::Arc;

use crate::backend::{AsrDecoder, AsrEncoder, EncoderFrames, TokenId};
use crate::config::SessionConfig;
use crate::error::{EsError, EsResult};
use crate::model::{samples_to_seconds, TentativeBuffer, Token, SAMPLE_RATE};

use super::{FailureBudget, TickOutput};

/// Hard bound on drain-time decoding, in multiples of the per-tick
/// token bound.
const FINALIZE_TICK_MULTIPLIER: usize = 4;

pub struct AlignAttTranscriber {
    encoder: Arc<dyn AsrEncoder>,
    decoder: Box<dyn AsrDecoder>,
    alignment_heads: Vec<(u16, u16)>,
    frame_threshold: usize,
    fire_threshold: f64,
    audio_max_len: f64,
    max_tokens_per_tick: usize,
    max_tentative_tokens: usize,
    failure_budget: FailureBudget,
    language_hint: Option<String>,

    /// Rolling audio window.
    window: Vec<i16>,
    /// Stream time of `window[0]`.
    window_start: f64,
    /// Stream time of the end of inserted audio.
    stream_head: f64,
    /// Committed token history fed back to the decoder.
    history: Vec<TokenId>,
    /// End of the last committed token; the trim anchor.
    committed_to: f64,
}

impl AlignAttTranscriber {
    #[must_use]
    pub fn new(
        encoder: Arc<dyn AsrEncoder>,
        decoder: Box<dyn AsrDecoder>,
        alignment_heads: Vec<(u16, u16)>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            encoder,
            decoder,
            alignment_heads,
            frame_threshold: config.frame_threshold,
            fire_threshold: config.fire_threshold,
            audio_max_len: config.audio_max_len,
            max_tokens_per_tick: config.max_tokens_per_tick,
            max_tentative_tokens: config.max_tentative_tokens,
            failure_budget: FailureBudget::new(config.asr_failure_budget),
            language_hint: config.language_hint().map(str::to_owned),
            window: Vec::new(),
            window_start: 0.0,
            stream_head: 0.0,
            history: Vec::new(),
            committed_to: 0.0,
        }
    }

    pub fn insert_audio(&mut self, chunk: &[i16], stream_time_end: f64) {
        if self.window.is_empty() {
            self.window_start = stream_time_end - samples_to_seconds(chunk.len() as u64);
        }
        self.window.extend_from_slice(chunk);
        self.stream_head = stream_time_end;
    }

    /// Voice ended. The audio in the window is final, so the live-edge
    /// gate no longer applies: decode the utterance tail to completion.
    pub fn start_silence(&mut self) -> EsResult<TickOutput> {
        self.finalize_window()
    }

    /// Voice resumed after a gap. The window restarts after the gap; the
    /// token history is kept so the decoder retains its context. The gap
    /// itself is represented downstream by a silence marker, not by
    /// samples.
    pub fn end_silence(&mut self, duration: f64) {
        self.stream_head += duration;
        self.window.clear();
        self.window_start = self.stream_head;
        self.committed_to = self.committed_to.max(self.window_start);
    }

    pub fn tick(&mut self) -> EsResult<TickOutput> {
        self.decode_pass(false)
    }

    pub fn finish(&mut self) -> EsResult<TickOutput> {
        self.finalize_window()
    }

    fn finalize_window(&mut self) -> EsResult<TickOutput> {
        let output = self.decode_pass(true);
        self.window.clear();
        self.window_start = self.stream_head;
        output
    }

    /// One decode loop over the current window. With `finalize` set the
    /// fire rule is bypassed: the audio is final and every remaining
    /// token can be committed.
    fn decode_pass(&mut self, finalize: bool) -> EsResult<TickOutput> {
        if self.window.is_empty() {
            return Ok(TickOutput::empty(self.committed_to));
        }

        let frames = match self.encoder.encode(&self.window, self.window_start) {
            Ok(frames) => frames,
            Err(error) => return self.recover(error),
        };
        let frame_count = frames.frame_count();
        if frame_count == 0 {
            return Ok(TickOutput::empty(self.committed_to));
        }

        let token_budget = if finalize {
            self.max_tokens_per_tick * FINALIZE_TICK_MULTIPLIER
        } else {
            self.max_tokens_per_tick
        };

        let mut committed = Vec::new();
        let mut tentative = TentativeBuffer::default();

        loop {
            if committed.len() >= token_budget {
                break;
            }
            let step = match self.decoder.step(&self.history, &frames) {
                Ok(step) => step,
                Err(error) => return self.recover(error),
            };
            if step.is_end {
                break;
            }

            let attention = step.attention.averaged(&self.alignment_heads, frame_count);
            let tail = self.frame_threshold.min(frame_count);
            let tail_mass: f64 = attention[frame_count - tail..]
                .iter()
                .map(|&w| f64::from(w))
                .sum();

            if finalize || tail_mass <= self.fire_threshold {
                let peak = argmax(&attention);
                let start = frames.frame_time(peak).max(self.committed_to);
                let end = (start + frames.time_per_frame()).max(start);
                self.history.push(step.token);
                self.committed_to = end;
                committed.push(Token {
                    start,
                    end,
                    text: step.piece,
                    probability: step.probability,
                    speaker: crate::model::SPEAKER_UNASSIGNED,
                    language: self.language_hint.clone(),
                });
            } else {
                // Still anchored to the live edge: the candidate stays
                // tentative, extended by a bounded greedy continuation.
                let peak = argmax(&attention);
                let start = frames.frame_time(peak).max(self.committed_to);
                let mut text = step.piece;
                let mut speculative = self.history.clone();
                speculative.push(step.token);
                for _ in 1..self.max_tentative_tokens {
                    let Ok(next) = self.decoder.step(&speculative, &frames) else {
                        break;
                    };
                    if next.is_end {
                        break;
                    }
                    text.push_str(&next.piece);
                    speculative.push(next.token);
                }
                tentative = TentativeBuffer {
                    start,
                    end: self.stream_head,
                    text,
                };
                break;
            }
        }

        self.failure_budget.success();
        self.maybe_trim()?;

        Ok(TickOutput {
            tokens: committed,
            tentative,
            processed_to: self.committed_to,
        })
    }

    /// Decode failure: reset the decoder and rewind the window to the
    /// post-last-committed-token state. Committed tokens are never
    /// dropped. Repeated failures escalate through the budget.
    fn recover(&mut self, error: EsError) -> EsResult<TickOutput> {
        self.decoder.reset();
        let anchor = self.committed_to.clamp(self.window_start, self.stream_head);
        if anchor > self.window_start {
            let drop = (((anchor - self.window_start) * f64::from(SAMPLE_RATE)) as usize)
                .min(self.window.len());
            self.window.drain(..drop);
            self.window_start = anchor;
        }
        let error = self.failure_budget.failure(error);
        if matches!(error, EsError::AsrPersistent { .. }) {
            return Err(error);
        }
        tracing::warn!(stage = "transcription", %error, "decode pass reset");
        Ok(TickOutput::empty(self.committed_to))
    }

    /// Keep the window bounded: trim from the front at the last
    /// committed token's time and shift the decoder cache consistently,
    /// so alignment positions remain well-defined.
    fn maybe_trim(&mut self) -> EsResult<()> {
        if self.stream_head - self.window_start <= self.audio_max_len {
            return Ok(());
        }
        let anchor = self.committed_to.clamp(self.window_start, self.stream_head);
        if anchor <= self.window_start {
            return Ok(());
        }
        let drop = (((anchor - self.window_start) * f64::from(SAMPLE_RATE)) as usize)
            .min(self.window.len());
        self.window.drain(..drop);
        self.window_start = anchor;
        self.decoder.trim_cache(anchor)?;
        tracing::debug!(stage = "transcription", anchor, "audio window trimmed");
        Ok(())
    }
}

fn argmax(weights: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_value = f32::MIN;
    for (index, &value) in weights.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best = index;
        }
    }
    best
}
