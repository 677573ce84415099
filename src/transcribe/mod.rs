//! The stabilization layer over the underlying ASR.
//!
//! Two policies decide when tentative transcription output is promoted
//! to committed output: attention-fire ([`align_att`]) and hypothesis
//! buffering ([`local_agreement`]). Exactly one is selected per session;
//! they are variants of a tagged sum, not a trait hierarchy.

pub mod align_att;
pub mod local_agreement;

use crate::error::{EsError, EsResult};
use crate::model::{TentativeBuffer, Token};

pub use align_att::AlignAttTranscriber;
pub use local_agreement::LocalAgreementTranscriber;

/// Result of one pass through a policy's main loop body.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// Newly committed tokens, ordered, non-decreasing in `start`.
    pub tokens: Vec<Token>,
    /// The full replacement tentative buffer.
    pub tentative: TentativeBuffer,
    /// Stream time up to which this policy considers audio processed.
    pub processed_to: f64,
}

impl TickOutput {
    #[must_use]
    pub fn empty(processed_to: f64) -> Self {
        Self {
            tokens: Vec::new(),
            tentative: TentativeBuffer::default(),
            processed_to,
        }
    }

    /// Committed text joined by the session separator, used to strip the
    /// same words from the tentative buffer.
    #[must_use]
    pub fn committed_text(&self, separator: &str) -> String {
        self.tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// Consecutive-failure counter shared by both policies: transient ASR
/// failures are skipped, a run of them escalates to a session-fatal
/// `AsrPersistent`.
#[derive(Debug)]
pub(crate) struct FailureBudget {
    consecutive: u32,
    limit: u32,
}

impl FailureBudget {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    pub(crate) fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure; returns the escalated error once the budget is
    /// spent, otherwise hands the transient error back for logging.
    pub(crate) fn failure(&mut self, error: EsError) -> EsError {
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            EsError::AsrPersistent {
                ticks: self.consecutive,
            }
        } else {
            error
        }
    }
}

/// The per-session stabilization policy.
pub enum TranscriberPolicy {
    AlignAtt(AlignAttTranscriber),
    LocalAgreement(LocalAgreementTranscriber),
}

impl TranscriberPolicy {
    /// Append an active audio chunk whose last sample sits at
    /// `stream_time_end` on the session time axis.
    pub fn insert_audio(&mut self, chunk: &[i16], stream_time_end: f64) {
        match self {
            Self::AlignAtt(t) => t.insert_audio(chunk, stream_time_end),
            Self::LocalAgreement(t) => t.insert_audio(chunk, stream_time_end),
        }
    }

    /// Voice just ended: flush output for the finished utterance.
    pub fn start_silence(&mut self) -> EsResult<TickOutput> {
        match self {
            Self::AlignAtt(t) => t.start_silence(),
            Self::LocalAgreement(t) => t.start_silence(),
        }
    }

    /// Voice resumed after `duration` seconds of silence: advance the
    /// time axis without inserting audio.
    pub fn end_silence(&mut self, duration: f64) {
        match self {
            Self::AlignAtt(t) => t.end_silence(duration),
            Self::LocalAgreement(t) => t.end_silence(duration),
        }
    }

    /// One scheduled pass over buffered audio.
    pub fn tick(&mut self) -> EsResult<TickOutput> {
        match self {
            Self::AlignAtt(t) => t.tick(),
            Self::LocalAgreement(t) => t.tick(),
        }
    }

    /// End-of-stream drain: emit everything that can still be committed.
    pub fn finish(&mut self) -> EsResult<TickOutput> {
        match self {
            Self::AlignAtt(t) => t.finish(),
            Self::LocalAgreement(t) => t.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_budget_escalates_after_limit() {
        let mut budget = FailureBudget::new(3);
        let e1 = budget.failure(EsError::AsrTransient("one".to_owned()));
        assert!(matches!(e1, EsError::AsrTransient(_)));
        let e2 = budget.failure(EsError::AsrTransient("two".to_owned()));
        assert!(matches!(e2, EsError::AsrTransient(_)));
        let e3 = budget.failure(EsError::AsrTransient("three".to_owned()));
        assert!(matches!(e3, EsError::AsrPersistent { ticks: 3 }));
    }

    #[test]
    fn failure_budget_resets_on_success() {
        let mut budget = FailureBudget::new(2);
        let _ = budget.failure(EsError::AsrTransient("x".to_owned()));
        budget.success();
        let again = budget.failure(EsError::AsrTransient("y".to_owned()));
        assert!(matches!(again, EsError::AsrTransient(_)));
    }

    #[test]
    fn committed_text_joins_with_separator() {
        let output = TickOutput {
            tokens: vec![
                Token::new(0.0, 0.5, "Hello"),
                Token::new(0.6, 1.0, "world"),
            ],
            tentative: TentativeBuffer::default(),
            processed_to: 1.0,
        };
        assert_eq!(output.committed_text(" "), "Hello world");
        assert_eq!(output.committed_text(""), "Helloworld");
    }
}
