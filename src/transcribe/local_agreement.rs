//! LocalAgreement: stabilization by hypothesis buffering.
//!
//! Each tick re-transcribes the suffix window of audio and commits the
//! longest common prefix between the previous and the current
//! hypothesis, matched on lightly normalized word text. Stability over
//! latency: a word is only committed once two successive hypotheses
//! agree on it.

use std::sync::Arc;

use crate::backend::{AsrWholeChunkTranscriber, HypothesisWord};
use crate::config::{BufferTrimming, SessionConfig};
use crate::error::{EsError, EsResult};
use crate::model::{ends_sentence, samples_to_seconds, TentativeBuffer, Token, SAMPLE_RATE};

use super::{FailureBudget, TickOutput};

/// Tolerance when comparing word times against the commit watermark.
const TIME_EPS: f64 = 1e-6;

pub struct LocalAgreementTranscriber {
    asr: Arc<dyn AsrWholeChunkTranscriber>,
    language_hint: Option<String>,
    trimming: BufferTrimming,
    trim_after_sec: f64,
    failure_budget: FailureBudget,

    /// Suffix window of audio, re-transcribed in full on every tick.
    buffer: Vec<i16>,
    /// Stream time of `buffer[0]`.
    buffer_start: f64,
    /// Stream time of the end of inserted audio (including silence gaps).
    stream_head: f64,
    /// End of the last committed token.
    committed_to: f64,
    /// Previous hypothesis beyond the last commit, absolute times.
    prev_suffix: Vec<HypothesisWord>,
    /// Ends of committed sentence-final tokens, for sentence trimming.
    sentence_ends: Vec<f64>,
}

impl LocalAgreementTranscriber {
    #[must_use]
    pub fn new(asr: Arc<dyn AsrWholeChunkTranscriber>, config: &SessionConfig) -> Self {
        Self {
            asr,
            language_hint: config.language_hint().map(str::to_owned),
            trimming: config.buffer_trimming,
            trim_after_sec: config.buffer_trimming_sec,
            failure_budget: FailureBudget::new(config.asr_failure_budget),
            buffer: Vec::new(),
            buffer_start: 0.0,
            stream_head: 0.0,
            committed_to: 0.0,
            prev_suffix: Vec::new(),
            sentence_ends: Vec::new(),
        }
    }

    pub fn insert_audio(&mut self, chunk: &[i16], stream_time_end: f64) {
        if self.buffer.is_empty() {
            self.buffer_start = stream_time_end - samples_to_seconds(chunk.len() as u64);
        }
        self.buffer.extend_from_slice(chunk);
        self.stream_head = stream_time_end;
    }

    /// Voice ended: the utterance is over, so the surviving hypothesis
    /// suffix is promoted wholesale and the window resets behind it.
    pub fn start_silence(&mut self) -> EsResult<TickOutput> {
        let tokens = self.promote_suffix();
        self.buffer.clear();
        self.buffer_start = self.stream_head;
        Ok(TickOutput {
            tokens,
            tentative: TentativeBuffer::default(),
            processed_to: self.committed_to.max(self.stream_head),
        })
    }

    pub fn end_silence(&mut self, duration: f64) {
        self.stream_head += duration;
        if self.buffer.is_empty() {
            self.buffer_start = self.stream_head;
        }
    }

    pub fn tick(&mut self) -> EsResult<TickOutput> {
        if self.buffer.is_empty() {
            return Ok(TickOutput::empty(self.committed_to));
        }

        let hypothesis = match self
            .asr
            .transcribe(&self.buffer, self.language_hint.as_deref())
        {
            Ok(words) => words,
            Err(error) => {
                let error = self.failure_budget.failure(error);
                if matches!(error, EsError::AsrPersistent { .. }) {
                    return Err(error);
                }
                tracing::warn!(stage = "transcription", %error, "tick skipped");
                return Ok(TickOutput::empty(self.committed_to));
            }
        };
        self.failure_budget.success();

        let current = self.absolute_words(hypothesis);

        if current.is_empty() && !self.prev_suffix.is_empty() {
            // The fresh hypothesis retracted everything the previous one
            // proposed; committing now would publish retracted output.
            self.prev_suffix.clear();
            return Ok(TickOutput::empty(self.committed_to));
        }

        let agreed = longest_common_prefix(&self.prev_suffix, &current);
        let mut tokens = Vec::with_capacity(agreed);
        for word in &current[..agreed] {
            tokens.push(self.commit_word(word));
        }
        self.prev_suffix = current[agreed..].to_vec();

        let tentative = self.tentative_from_suffix();
        self.maybe_trim();

        Ok(TickOutput {
            tokens,
            tentative,
            processed_to: self.committed_to,
        })
    }

    /// Drain: commit the agreed prefix against the final hypothesis,
    /// then everything the last hypothesis still proposed.
    pub fn finish(&mut self) -> EsResult<TickOutput> {
        if !self.buffer.is_empty() {
            if let Ok(hypothesis) = self
                .asr
                .transcribe(&self.buffer, self.language_hint.as_deref())
            {
                self.prev_suffix = self.absolute_words(hypothesis);
            }
        }
        let tokens = self.promote_suffix();
        self.buffer.clear();
        self.buffer_start = self.stream_head;
        Ok(TickOutput {
            tokens,
            tentative: TentativeBuffer::default(),
            processed_to: self.committed_to.max(self.stream_head),
        })
    }

    /// Map hypothesis-relative times onto the stream axis and drop words
    /// that go backward past the commit watermark.
    fn absolute_words(&self, hypothesis: Vec<HypothesisWord>) -> Vec<HypothesisWord> {
        hypothesis
            .into_iter()
            .map(|mut word| {
                word.start += self.buffer_start;
                word.end += self.buffer_start;
                word
            })
            .filter(|word| word.end > self.committed_to + TIME_EPS)
            .collect()
    }

    fn commit_word(&mut self, word: &HypothesisWord) -> Token {
        let start = word.start.max(self.committed_to);
        let end = word.end.max(start);
        self.committed_to = end;
        if ends_sentence(&word.word) {
            self.sentence_ends.push(end);
        }
        Token {
            start,
            end,
            text: word.word.clone(),
            probability: word.probability,
            speaker: crate::model::SPEAKER_UNASSIGNED,
            language: self.language_hint.clone(),
        }
    }

    fn promote_suffix(&mut self) -> Vec<Token> {
        let suffix = std::mem::take(&mut self.prev_suffix);
        suffix.iter().map(|w| self.commit_word(w)).collect()
    }

    fn tentative_from_suffix(&self) -> TentativeBuffer {
        if self.prev_suffix.is_empty() {
            return TentativeBuffer::default();
        }
        TentativeBuffer {
            start: self.prev_suffix[0].start.max(self.committed_to),
            end: self.prev_suffix.last().map_or(0.0, |w| w.end),
            text: self
                .prev_suffix
                .iter()
                .map(|w| w.word.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Trim the suffix window from the front once it outgrows the
    /// configured length: at a committed sentence boundary if available
    /// (and requested), otherwise at the last committed time.
    fn maybe_trim(&mut self) {
        let span = self.stream_head - self.buffer_start;
        if span <= self.trim_after_sec {
            return;
        }
        let cut_time = match self.trimming {
            BufferTrimming::Sentence => self
                .sentence_ends
                .iter()
                .rev()
                .find(|&&t| t <= self.committed_to + TIME_EPS)
                .copied()
                .unwrap_or(self.committed_to),
            BufferTrimming::Segment => self.committed_to,
        };
        let cut_time = cut_time.clamp(self.buffer_start, self.stream_head);
        if cut_time <= self.buffer_start {
            return;
        }
        let drop = (((cut_time - self.buffer_start) * f64::from(SAMPLE_RATE)) as usize)
            .min(self.buffer.len());
        self.buffer.drain(..drop);
        self.buffer_start = cut_time;
        self.sentence_ends.retain(|&t| t > cut_time);
        tracing::debug!(
            stage = "transcription",
            cut_time,
            "suffix window trimmed"
        );
    }
}

/// Length of the longest common prefix between two word sequences,
/// matched on normalized text.
fn longest_common_prefix(previous: &[HypothesisWord], current: &[HypothesisWord]) -> usize {
    previous
        .iter()
        .zip(current.iter())
        .take_while(|(a, b)| words_match(&a.word, &b.word))
        .count()
}

/// Case-insensitive match with surrounding punctuation stripped.
/// Punctuation-only words fall back to exact comparison.
fn words_match(a: &str, b: &str) -> bool {
    let (na, nb) = (normalize_word(a), normalize_word(b));
    if na.is_empty() && nb.is_empty() {
        return a == b;
    }
    na == nb
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| {
        c.is_ascii_punctuation() || crate::model::SENTENCE_TERMINALS.contains(&c)
    })
    .to_lowercase()
}
