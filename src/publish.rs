//! The differential publisher.
//!
//! On a fixed cadence it runs the aligner, renders a snapshot, and
//! emits it to the subscriber only when the canonical fingerprint of
//! the observable state changes. The `remaining_time_*` lag hints are
//! excluded from the fingerprint and refreshed in place on a shared
//! latest-snapshot slot, so callers polling it observe live lag even
//! when nothing else changed.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use sha2::{Digest, Sha256};

use crate::align::{AlignedView, Aligner, SegmentDraft};
use crate::config::{SessionConfig, TimestampFormat};
use crate::model::{
    format_timestamp, OutputEvent, Segment, SessionState, SessionStatus, Snapshot,
};

pub struct Publisher {
    aligner: Aligner,
    timestamp_format: TimestampFormat,
    tx: Sender<OutputEvent>,
    latest: Arc<Mutex<Snapshot>>,
    last_fingerprint: Option<[u8; 32]>,
}

impl Publisher {
    #[must_use]
    pub fn new(config: &SessionConfig, tx: Sender<OutputEvent>, latest: Arc<Mutex<Snapshot>>) -> Self {
        Self {
            aligner: Aligner::new(config),
            timestamp_format: config.timestamp_format,
            tx,
            latest,
            last_fingerprint: None,
        }
    }

    /// One cadence tick under the session lock. Returns whether a
    /// snapshot went out to the subscriber.
    pub fn tick(&mut self, state: &mut SessionState) -> bool {
        let view = self.aligner.update(state);
        let status = if state.fatal_error.is_some() {
            SessionStatus::Error
        } else if is_timeline_empty(&view, state) {
            SessionStatus::NoAudio
        } else {
            SessionStatus::Active
        };
        let snapshot = self.render(&view, state, status);
        self.publish(snapshot)
    }

    /// Terminal pass after the drain (or a fatal error): emit the final
    /// snapshot if it differs, then the `ready_to_stop` control event.
    pub fn finalize(&mut self, state: &mut SessionState) {
        let view = self.aligner.update(state);
        let status = if state.fatal_error.is_some() {
            SessionStatus::Error
        } else if is_timeline_empty(&view, state) {
            SessionStatus::NoAudio
        } else {
            SessionStatus::Finalized
        };
        let snapshot = self.render(&view, state, status);
        self.publish(snapshot);
        let _ = self.tx.send(OutputEvent::ReadyToStop);
    }

    fn render(&self, view: &AlignedView, state: &SessionState, status: SessionStatus) -> Snapshot {
        Snapshot {
            status,
            lines: view
                .segments
                .iter()
                .map(|draft| self.render_segment(draft))
                .collect(),
            buffer_transcription: state.tentative.text.trim().to_owned(),
            buffer_diarization: view.buffer_diarization.clone(),
            buffer_translation: state.translation_tentative.text.trim().to_owned(),
            remaining_time_transcription: view.remaining_time_transcription,
            remaining_time_diarization: view.remaining_time_diarization,
            error: state.fatal_error.clone(),
        }
    }

    fn render_segment(&self, draft: &SegmentDraft) -> Segment {
        Segment {
            start: format_timestamp(draft.start, self.timestamp_format),
            end: format_timestamp(draft.end, self.timestamp_format),
            text: draft.text.clone(),
            speaker: draft.speaker,
            translation: draft.translation.clone(),
            detected_language: draft.detected_language.clone(),
        }
    }

    /// Refresh the latest-snapshot slot unconditionally (cheap in-place
    /// lag update); push to the subscriber only on fingerprint change.
    fn publish(&mut self, snapshot: Snapshot) -> bool {
        *self.latest.lock().expect("latest snapshot lock poisoned") = snapshot.clone();

        let print = fingerprint(&snapshot);
        if self.last_fingerprint == Some(print) {
            return false;
        }
        self.last_fingerprint = Some(print);
        self.tx.send(OutputEvent::Snapshot(snapshot)).is_ok()
    }
}

fn is_timeline_empty(view: &AlignedView, state: &SessionState) -> bool {
    view.segments.is_empty()
        && state.tentative.is_empty()
        && view.buffer_diarization.is_empty()
}

/// Canonical fingerprint of the observable state: segments, the three
/// tentative buffers, status, and the error identifier. Lag hints are
/// deliberately left out.
fn fingerprint(snapshot: &Snapshot) -> [u8; 32] {
    let canonical = serde_json::json!({
        "status": snapshot.status,
        "lines": snapshot.lines,
        "buffer_transcription": snapshot.buffer_transcription,
        "buffer_diarization": snapshot.buffer_diarization,
        "buffer_translation": snapshot.buffer_translation,
        "error": snapshot.error,
    });
    let bytes = serde_json::to_vec(&canonical).expect("snapshot is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendPolicy;
    use crate::model::{TentativeBuffer, Token};
    use crossbeam_channel::unbounded;

    fn setup() -> (
        Publisher,
        crossbeam_channel::Receiver<OutputEvent>,
        Arc<Mutex<Snapshot>>,
    ) {
        let config = SessionConfig {
            backend_policy: BackendPolicy::LocalAgreement,
            ..SessionConfig::default()
        };
        let (tx, rx) = unbounded();
        let latest = Arc::new(Mutex::new(Snapshot::empty()));
        (Publisher::new(&config, tx, latest.clone()), rx, latest)
    }

    #[test]
    fn identical_state_is_emitted_once() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        state.tokens.push(Token::new(0.0, 1.0, "hello"));
        state.tokens[0].speaker = 1;

        assert!(publisher.tick(&mut state));
        assert!(!publisher.tick(&mut state));
        assert!(!publisher.tick(&mut state));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn lag_hints_do_not_retrigger_but_refresh_latest() {
        let (mut publisher, rx, latest) = setup();
        let mut state = SessionState::default();
        state.tokens.push(Token::new(0.0, 1.0, "hello"));
        state.tokens[0].speaker = 1;
        state.end_of_committed_audio = 1.0;
        state.ingress_time = 1.0;

        assert!(publisher.tick(&mut state));
        state.ingress_time = 3.5;
        assert!(!publisher.tick(&mut state), "lag change alone must not emit");

        let slot = latest.lock().expect("lock poisoned").clone();
        assert!(
            (slot.remaining_time_transcription - 2.5).abs() < 1e-9,
            "latest slot must carry live lag, got {}",
            slot.remaining_time_transcription
        );
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn tentative_change_emits() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        state.tentative = TentativeBuffer {
            start: 0.0,
            end: 0.5,
            text: "hel".to_owned(),
        };
        assert!(publisher.tick(&mut state));
        state.tentative.text = "hello".to_owned();
        assert!(publisher.tick(&mut state));
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn empty_timeline_reports_no_audio() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        publisher.tick(&mut state);
        match rx.try_recv().expect("snapshot expected") {
            OutputEvent::Snapshot(s) => assert_eq!(s.status, SessionStatus::NoAudio),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn finalize_emits_final_snapshot_then_ready_to_stop() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        state.tokens.push(Token::new(0.0, 1.0, "hello"));
        state.tokens[0].speaker = 1;

        publisher.tick(&mut state);
        publisher.finalize(&mut state);

        let events: Vec<OutputEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3, "active snapshot, final snapshot, stop");
        match &events[1] {
            OutputEvent::Snapshot(s) => assert_eq!(s.status, SessionStatus::Finalized),
            other => panic!("expected final snapshot, got {other:?}"),
        }
        assert_eq!(events[2], OutputEvent::ReadyToStop);
    }

    #[test]
    fn finalize_on_empty_session_keeps_no_audio_status() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        publisher.tick(&mut state);
        publisher.finalize(&mut state);

        let events: Vec<OutputEvent> = rx.try_iter().collect();
        // The no_audio snapshot fingerprints identically in both passes:
        // exactly one snapshot, then the stop marker.
        assert_eq!(events.len(), 2);
        match &events[0] {
            OutputEvent::Snapshot(s) => assert_eq!(s.status, SessionStatus::NoAudio),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert_eq!(events[1], OutputEvent::ReadyToStop);
    }

    #[test]
    fn fatal_error_sets_error_status_and_code() {
        let (mut publisher, rx, _) = setup();
        let mut state = SessionState::default();
        state.fatal_error = Some("ES-ASR-PERSISTENT".to_owned());
        publisher.finalize(&mut state);

        let events: Vec<OutputEvent> = rx.try_iter().collect();
        match &events[0] {
            OutputEvent::Snapshot(s) => {
                assert_eq!(s.status, SessionStatus::Error);
                assert_eq!(s.error.as_deref(), Some("ES-ASR-PERSISTENT"));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}
