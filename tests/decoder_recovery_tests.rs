//! Decode-child pipeline tests.
//!
//! The sessions here run with a scripted child command instead of
//! ffmpeg: `cat` is a perfectly good "decoder" for input that is
//! already 16 kHz mono s16le, and small shell scripts stand in for a
//! crashing child. This exercises the supervised restart path end to
//! end: spec'd behavior is a bounded restart budget, then a terminal
//! `error` snapshot.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use echostream::backend::mock::{EnergyVad, MockEncoder, ScriptedDecoder, ScriptedToken};
use echostream::backend::ModelBundle;
use echostream::config::{BackendPolicy, SessionConfig};
use echostream::decoder::DecoderCommand;
use echostream::model::{OutputEvent, SessionStatus, Snapshot};
use echostream::{EsError, Session};

fn loud_pcm(seconds: f64) -> Vec<u8> {
    let samples = (seconds * 16_000.0) as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        bytes.extend_from_slice(&8000i16.to_le_bytes());
    }
    bytes
}

fn align_att_config() -> SessionConfig {
    SessionConfig {
        backend_policy: BackendPolicy::AlignAtt,
        language: "en".to_owned(),
        ..SessionConfig::default()
    }
}

fn align_att_bundle(script: Vec<ScriptedToken>) -> ModelBundle {
    ModelBundle {
        encoder: Some(Arc::new(MockEncoder)),
        decoder: Some(Box::new(ScriptedDecoder::new(script))),
        alignment_heads: vec![(0, 0)],
        whole_chunk: None,
        vad: Box::new(EnergyVad::new(1000)),
        diarizer: None,
        translator: None,
    }
}

fn collect_events(session: &Session, timeout: Duration) -> Vec<OutputEvent> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match session.events().recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let stop = event == OutputEvent::ReadyToStop;
                events.push(event);
                if stop {
                    return events;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    return events;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return events,
        }
    }
}

fn final_snapshot(events: &[OutputEvent]) -> Snapshot {
    events
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Snapshot(s) => Some(s.clone()),
            _ => None,
        })
        .last()
        .expect("at least one snapshot")
}

#[test]
fn missing_decoder_binary_fails_at_startup() {
    let command = DecoderCommand::custom("definitely_not_a_real_decoder_xyz", Vec::new());
    let err = Session::start_with_decoder(
        align_att_config(),
        align_att_bundle(Vec::new()),
        command,
    )
    .expect_err("startup must fail without the decode binary");
    assert!(matches!(err, EsError::DecoderMissing { .. }));
}

#[test]
fn passthrough_decoder_runs_the_full_pipeline() {
    let command = DecoderCommand::custom("cat", Vec::new());
    let session = Session::start_with_decoder(
        align_att_config(),
        align_att_bundle(vec![ScriptedToken::new("Hi", 0.2)]),
        command,
    )
    .expect("session start");

    session.feed(&loud_pcm(1.5)).expect("feed");
    thread::sleep(Duration::from_millis(300));
    session.finish().expect("finish");

    let events = collect_events(&session, Duration::from_secs(10));
    session.join().expect("clean drain");

    let final_snap = final_snapshot(&events);
    assert_eq!(final_snap.status, SessionStatus::Finalized);
    assert_eq!(final_snap.lines.len(), 1);
    assert_eq!(final_snap.lines[0].text, "Hi");
}

#[test]
fn session_survives_one_decoder_restart() {
    // First child forwards exactly one second of audio and exits;
    // every later child is a plain cat.
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("crashed_once");
    let script = format!(
        "if [ ! -f {m} ]; then touch {m}; exec head -c 32000; fi; exec cat",
        m = marker.display()
    );
    let command = DecoderCommand::custom("sh", vec!["-c".to_owned(), script]);

    let session = Session::start_with_decoder(
        align_att_config(),
        align_att_bundle(vec![
            ScriptedToken::new("One", 0.2),
            ScriptedToken::new(" two", 1.3),
        ]),
        command,
    )
    .expect("session start");

    session.feed(&loud_pcm(1.0)).expect("feed before the crash");
    // Leave room for the child to die and the supervisor to respawn.
    thread::sleep(Duration::from_millis(600));
    session.feed(&loud_pcm(1.0)).expect("feed after the restart");
    thread::sleep(Duration::from_millis(300));
    session.finish().expect("finish");

    let events = collect_events(&session, Duration::from_secs(10));
    session.join().expect("restart must not kill the session");

    let final_snap = final_snapshot(&events);
    assert_eq!(final_snap.status, SessionStatus::Finalized);
    // Output committed before the crash is preserved.
    assert_eq!(final_snap.lines.len(), 1);
    assert_eq!(final_snap.lines[0].text, "One two");
}

#[test]
fn decoder_restart_exhaustion_ends_session_with_error() {
    let command = DecoderCommand::custom("sh", vec!["-c".to_owned(), "exit 1".to_owned()]);
    let config = SessionConfig {
        decoder_max_restarts: 2,
        ..align_att_config()
    };
    let session = Session::start_with_decoder(config, align_att_bundle(Vec::new()), command)
        .expect("spawn succeeds before the child dies");

    let events = collect_events(&session, Duration::from_secs(10));
    assert!(
        session.join().is_err(),
        "exhausted restart budget is a session failure"
    );

    let final_snap = final_snapshot(&events);
    assert_eq!(final_snap.status, SessionStatus::Error);
    assert_eq!(final_snap.error.as_deref(), Some("ES-DECODER-CRASH"));
    assert_eq!(events.last(), Some(&OutputEvent::ReadyToStop));
}
