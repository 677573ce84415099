//! Session lifecycle and stage orchestration.
//!
//! One `Session` serves one audio stream. Stages run as threads joined
//! by bounded channels: the gate thread turns decoder output (or raw
//! PCM ingress) into VAD events; the transcription, diarization, and
//! translation lanes consume them and integrate results into the
//! shared `SessionState` under a single lock; the publisher drains the
//! deltas on a fixed cadence. An empty ingress frame is the
//! end-of-stream sentinel: it starts the drain protocol, which is
//! bounded by a deadline and always ends in one final snapshot and a
//! `ready_to_stop` event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::backend::ModelBundle;
use crate::config::{BackendPolicy, SessionConfig};
use crate::decoder::{Decoder, DecoderCommand, DecoderRead};
use crate::diarize::DiarizationLane;
use crate::error::{EsError, EsResult};
use crate::model::{
    OutputEvent, SessionDescriptor, SessionState, Snapshot, Token, SPEAKER_PENDING,
    SPEAKER_UNASSIGNED,
};
use crate::publish::Publisher;
use crate::transcribe::{
    AlignAttTranscriber, LocalAgreementTranscriber, TickOutput, TranscriberPolicy,
};
use crate::translate::TranslationLane;
use crate::vad::{AudioEvent, VadGate};

/// VAD → transcriber event queue capacity. Saturation here propagates
/// backpressure all the way to the ingress.
pub const TRANSCRIPTION_QUEUE_CAPACITY: usize = 256;
/// VAD tap → diarizer event queue capacity.
pub const DIARIZATION_QUEUE_CAPACITY: usize = 256;
/// Committed-token → translator queue capacity.
pub const TRANSLATION_QUEUE_CAPACITY: usize = 64;
/// Raw PCM ingress frames buffered before the caller sees backpressure.
const PCM_INGRESS_CAPACITY: usize = 64;

/// Poll granularity for cancel-aware channel operations.
const POLL: Duration = Duration::from_millis(50);
/// Byte rate of the decoded stream, for dynamic decoder read sizing
/// and backlog accounting.
const STREAM_BYTES_PER_SEC: f64 = 32_000.0;
/// Warn once the undrained PCM backlog exceeds this many seconds of
/// audio: the pipeline is not keeping up with the ingress.
const BACKLOG_WARN_SEC: f64 = 5.0;

enum PcmMsg {
    Data(Vec<u8>),
    Eof,
}

enum TranslateMsg {
    Token(Token),
    Eof,
}

#[derive(Default)]
struct StageFlags {
    gate: AtomicBool,
    transcription: AtomicBool,
    diarization: AtomicBool,
    translation: AtomicBool,
    publisher: AtomicBool,
}

struct Shared {
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Drain initiated: the EOF sentinel has been seen.
    stopping: AtomicBool,
    /// Force-stop: workers bail out at the next poll.
    cancel: AtomicBool,
    /// PCM-input mode only: bytes accepted at the ingress but not yet
    /// picked up by the gate.
    pcm_backlog: AtomicU64,
    flags: StageFlags,
}

impl Shared {
    fn workers_done(&self) -> bool {
        self.flags.gate.load(Ordering::SeqCst)
            && self.flags.transcription.load(Ordering::SeqCst)
            && (!self.config.diarization || self.flags.diarization.load(Ordering::SeqCst))
            && (!self.config.translation || self.flags.translation.load(Ordering::SeqCst))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// First fatal error wins; it also force-stops the other stages.
    fn fail(&self, stage: &str, error: &EsError) {
        tracing::error!(stage, %error, "fatal session error");
        {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.fatal_error.is_none() {
                state.fatal_error = Some(error.error_code().to_owned());
            }
        }
        self.cancel.store(true, Ordering::SeqCst);
    }
}

pub struct Session {
    id: String,
    shared: Arc<Shared>,
    decoder: Option<Arc<Decoder>>,
    pcm_tx: Option<Sender<PcmMsg>>,
    events_rx: Receiver<OutputEvent>,
    latest: Arc<Mutex<Snapshot>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    /// Start a session with the default decode child (ffmpeg) when the
    /// input is compressed.
    pub fn start(config: SessionConfig, bundle: ModelBundle) -> EsResult<Self> {
        Self::start_with_decoder(config, bundle, DecoderCommand::ffmpeg_pipe())
    }

    /// Start a session with a custom decode child command.
    pub fn start_with_decoder(
        config: SessionConfig,
        mut bundle: ModelBundle,
        decoder_command: DecoderCommand,
    ) -> EsResult<Self> {
        config.validate()?;
        bundle.validate(&config)?;

        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            session = %id,
            policy = config.backend_policy.as_str(),
            diarization = config.diarization,
            translation = config.translation,
            "session starting"
        );

        let policy = build_policy(&config, &mut bundle)?;

        let (decoder, pcm_tx, pcm_rx) = if config.pcm_input {
            let (tx, rx) = bounded(PCM_INGRESS_CAPACITY);
            (None, Some(tx), Some(rx))
        } else {
            let decoder = Arc::new(Decoder::spawn(
                decoder_command,
                config.decoder_max_restarts,
            )?);
            (Some(decoder), None, None)
        };

        let (events_tx, events_rx) = unbounded();
        let _ = events_tx.send(OutputEvent::Config(SessionDescriptor {
            session_id: id.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
            timestamp_format: config.timestamp_format,
            diarization: config.diarization,
            translation: config.translation,
        }));

        let latest = Arc::new(Mutex::new(Snapshot::empty()));
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::default()),
            stopping: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            pcm_backlog: AtomicU64::new(0),
            flags: StageFlags::default(),
            config: config.clone(),
        });

        let (transcription_tx, transcription_rx) = bounded(TRANSCRIPTION_QUEUE_CAPACITY);
        let (diarization_tx, diarization_rx) = if config.diarization {
            let (tx, rx) = bounded(DIARIZATION_QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (translation_tx, translation_rx) = if config.translation {
            let (tx, rx) = bounded(TRANSLATION_QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut handles = Vec::new();

        // Gate: decoder reader (or PCM ingress) + VAD split.
        {
            let shared = shared.clone();
            let gate = VadGate::new(bundle.vad);
            let decoder = decoder.clone();
            let transcription_tx = transcription_tx.clone();
            let diarization_tx = diarization_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name("es-gate".to_owned())
                    .spawn(move || {
                        run_gate(
                            &shared,
                            gate,
                            decoder.as_deref(),
                            pcm_rx,
                            &transcription_tx,
                            diarization_tx.as_ref(),
                        );
                        shared.flags.gate.store(true, Ordering::SeqCst);
                    })
                    .expect("spawn gate thread"),
            );
        }

        // Transcription lane.
        {
            let shared = shared.clone();
            let translation_tx = translation_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name("es-transcription".to_owned())
                    .spawn(move || {
                        run_transcription(&shared, policy, &transcription_rx, translation_tx.as_ref());
                        shared.flags.transcription.store(true, Ordering::SeqCst);
                    })
                    .expect("spawn transcription thread"),
            );
        }

        // Diarization lane.
        if let Some(rx) = diarization_rx {
            let shared = shared.clone();
            let lane = DiarizationLane::new(
                bundle
                    .diarizer
                    .take()
                    .expect("bundle validated with diarization"),
            );
            handles.push(
                thread::Builder::new()
                    .name("es-diarization".to_owned())
                    .spawn(move || {
                        run_diarization(&shared, lane, &rx);
                        shared.flags.diarization.store(true, Ordering::SeqCst);
                    })
                    .expect("spawn diarization thread"),
            );
        }

        // Translation lane.
        if let Some(rx) = translation_rx {
            let shared = shared.clone();
            let lane = TranslationLane::new(
                bundle
                    .translator
                    .clone()
                    .expect("bundle validated with translation"),
                &config,
            );
            handles.push(
                thread::Builder::new()
                    .name("es-translation".to_owned())
                    .spawn(move || {
                        run_translation(&shared, lane, &rx);
                        shared.flags.translation.store(true, Ordering::SeqCst);
                    })
                    .expect("spawn translation thread"),
            );
        }

        // Publisher.
        {
            let shared = shared.clone();
            let mut publisher = Publisher::new(&config, events_tx, latest.clone());
            let interval = config.publish_interval();
            handles.push(
                thread::Builder::new()
                    .name("es-publisher".to_owned())
                    .spawn(move || {
                        run_publisher(&shared, &mut publisher, interval);
                        shared.flags.publisher.store(true, Ordering::SeqCst);
                    })
                    .expect("spawn publisher thread"),
            );
        }

        // Watchdog: log stage workers that die while the stream is live.
        {
            let shared = shared.clone();
            handles.push(
                thread::Builder::new()
                    .name("es-watchdog".to_owned())
                    .spawn(move || run_watchdog(&shared))
                    .expect("spawn watchdog thread"),
            );
        }

        Ok(Self {
            id,
            shared,
            decoder,
            pcm_tx,
            events_rx,
            latest,
            handles: Mutex::new(handles),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The subscriber event stream: one `Config`, snapshots on change,
    /// then `ReadyToStop`.
    #[must_use]
    pub fn events(&self) -> &Receiver<OutputEvent> {
        &self.events_rx
    }

    /// The shared latest-snapshot slot, refreshed on every publisher
    /// tick including lag-only updates.
    #[must_use]
    pub fn latest_snapshot(&self) -> Snapshot {
        self.latest
            .lock()
            .expect("latest snapshot lock poisoned")
            .clone()
    }

    /// Ingress: accept one opaque audio frame. An empty frame is the
    /// end-of-stream sentinel and starts the drain protocol.
    pub fn feed(&self, frame: &[u8]) -> EsResult<()> {
        if frame.is_empty() {
            return self.finish();
        }
        if self.shared.stopping.load(Ordering::SeqCst) {
            tracing::warn!(session = %self.id, "audio after end-of-stream sentinel ignored");
            return Ok(());
        }

        if let Some(pcm_tx) = &self.pcm_tx {
            // Counted before the send so the gate never observes a
            // queued frame that is not yet in the backlog figure.
            self.shared
                .pcm_backlog
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
            return match pcm_tx.try_send(PcmMsg::Data(frame.to_vec())) {
                Ok(()) => Ok(()),
                Err(rejected) => {
                    self.shared
                        .pcm_backlog
                        .fetch_sub(frame.len() as u64, Ordering::Relaxed);
                    match rejected {
                        TrySendError::Full(_) => Err(EsError::Backpressure { stage: "ingress" }),
                        TrySendError::Disconnected(_) => {
                            Err(EsError::ChannelClosed { stage: "ingress" })
                        }
                    }
                }
            };
        }

        let decoder = self.decoder.as_ref().expect("non-PCM session has decoder");
        match decoder.write(frame) {
            Ok(()) => Ok(()),
            Err(EsError::DecoderUnavailable { .. }) => {
                Err(EsError::Backpressure { stage: "decoder" })
            }
            Err(error) => {
                if error.is_fatal() {
                    self.shared.fail("ingress", &error);
                }
                Err(error)
            }
        }
    }

    /// Signal end of stream and let the drain protocol run.
    pub fn finish(&self) -> EsResult<()> {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(session = %self.id, "end-of-stream sentinel received, draining");
        if let Some(decoder) = &self.decoder {
            decoder.finish();
        }
        if let Some(pcm_tx) = &self.pcm_tx {
            let _ = pcm_tx.send(PcmMsg::Eof);
        }
        Ok(())
    }

    /// Force-cancel all stages. The publisher still emits a final
    /// snapshot with whatever state is present.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(decoder) = &self.decoder {
            decoder.shutdown();
        }
    }

    /// Wait for the drain to complete, bounded by the configured
    /// deadline; past it, remaining stages are force-cancelled. The
    /// final snapshot and `ready_to_stop` are guaranteed either way.
    pub fn join(self) -> EsResult<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.shared.config.drain_deadline_sec);
        while !self.shared.flags.publisher.load(Ordering::SeqCst) {
            if Instant::now() >= deadline && !self.shared.cancelled() {
                tracing::warn!(session = %self.id, "drain deadline exceeded, force-cancelling");
                self.cancel();
            }
            thread::sleep(Duration::from_millis(20));
        }
        let handles = std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
        let fatal = self
            .shared
            .state
            .lock()
            .expect("session lock poisoned")
            .fatal_error
            .clone();
        match fatal {
            Some(code) => Err(EsError::Cancelled(format!("session failed: {code}"))),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }
}

fn build_policy(config: &SessionConfig, bundle: &mut ModelBundle) -> EsResult<TranscriberPolicy> {
    match config.backend_policy {
        BackendPolicy::AlignAtt => {
            let encoder = bundle.encoder.clone().ok_or_else(|| {
                EsError::InvalidConfig("align_att policy requires an ASR encoder".to_owned())
            })?;
            let decoder = bundle.decoder.take().ok_or_else(|| {
                EsError::InvalidConfig("align_att policy requires an ASR decoder".to_owned())
            })?;
            Ok(TranscriberPolicy::AlignAtt(AlignAttTranscriber::new(
                encoder,
                decoder,
                bundle.alignment_heads.clone(),
                config,
            )))
        }
        BackendPolicy::LocalAgreement => {
            let asr = bundle.whole_chunk.clone().ok_or_else(|| {
                EsError::InvalidConfig(
                    "local_agreement policy requires a whole-chunk transcriber".to_owned(),
                )
            })?;
            Ok(TranscriberPolicy::LocalAgreement(
                LocalAgreementTranscriber::new(asr, config),
            ))
        }
    }
}

/// Cancel-aware bounded send. Returns false when the session was
/// cancelled or the receiver is gone.
fn send_event(tx: &Sender<AudioEvent>, event: AudioEvent, shared: &Shared) -> bool {
    let mut event = event;
    loop {
        if shared.cancelled() {
            return false;
        }
        match tx.send_timeout(event, POLL) {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => event = back,
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Gate stage: decoder/PCM ingress → VAD events
// ---------------------------------------------------------------------------

fn run_gate(
    shared: &Shared,
    mut gate: VadGate,
    decoder: Option<&Decoder>,
    pcm_rx: Option<Receiver<PcmMsg>>,
    transcription_tx: &Sender<AudioEvent>,
    diarization_tx: Option<&Sender<AudioEvent>>,
) {
    // Carry for sample alignment: frames may split an s16le sample.
    let mut carry: Vec<u8> = Vec::new();
    let mut last_read = Instant::now();
    let mut last_backlog_warn = Instant::now() - Duration::from_secs(60);

    let mut dispatch = |gate: &mut VadGate, bytes: &[u8], shared: &Shared| -> bool {
        carry.extend_from_slice(bytes);
        let usable = carry.len() - carry.len() % 2;
        let samples: Vec<i16> = carry[..usable]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        carry.drain(..usable);

        let events = match gate.feed(&samples) {
            Ok(events) => events,
            Err(error) => {
                shared.fail("vad", &error);
                return false;
            }
        };
        {
            let mut state = shared.state.lock().expect("session lock poisoned");
            state.ingress_time = gate.stream_time();
        }
        forward_events(events, transcription_tx, diarization_tx, shared)
    };

    if let Some(decoder) = decoder {
        loop {
            if shared.cancelled() {
                return;
            }
            let elapsed = last_read.elapsed().as_secs_f64();
            let max_bytes = ((STREAM_BYTES_PER_SEC * elapsed) as usize).clamp(4096, 65_536);
            match decoder.read(max_bytes, Duration::from_millis(100)) {
                Ok(DecoderRead::Data(bytes)) => {
                    last_read = Instant::now();
                    warn_if_backlogged(decoder.backlog_bytes(), &mut last_backlog_warn);
                    if !dispatch(&mut gate, &bytes, shared) {
                        return;
                    }
                }
                Ok(DecoderRead::TimedOut) => {
                    if gate.stream_time() > 0.0 {
                        tracing::trace!(stage = "decoder", "read timeout during stream");
                    }
                }
                Ok(DecoderRead::Eof) => break,
                Err(error) => {
                    shared.fail("decoder", &error);
                    break;
                }
            }
        }
    } else if let Some(pcm_rx) = pcm_rx {
        loop {
            if shared.cancelled() {
                return;
            }
            match pcm_rx.recv_timeout(POLL) {
                Ok(PcmMsg::Data(bytes)) => {
                    let backlog = shared
                        .pcm_backlog
                        .fetch_sub(bytes.len() as u64, Ordering::Relaxed)
                        .saturating_sub(bytes.len() as u64);
                    warn_if_backlogged(backlog, &mut last_backlog_warn);
                    if !dispatch(&mut gate, &bytes, shared) {
                        return;
                    }
                }
                Ok(PcmMsg::Eof) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    // Drain: flush trailing audio and propagate Eof downstream.
    match gate.finish() {
        Ok(events) => {
            let mut state = shared.state.lock().expect("session lock poisoned");
            state.ingress_time = gate.stream_time();
            drop(state);
            forward_events(events, transcription_tx, diarization_tx, shared);
        }
        Err(error) => shared.fail("vad", &error),
    }
}

/// The undrained-PCM high-water check: once more than
/// [`BACKLOG_WARN_SEC`] seconds of audio sit between the ingress and
/// the gate, the models cannot keep up with the stream. Throttled so a
/// sustained backlog does not flood the log.
fn warn_if_backlogged(backlog_bytes: u64, last_warn: &mut Instant) {
    let backlog_sec = backlog_bytes as f64 / STREAM_BYTES_PER_SEC;
    if backlog_sec > BACKLOG_WARN_SEC && last_warn.elapsed() > Duration::from_secs(5) {
        *last_warn = Instant::now();
        tracing::warn!(
            stage = "vad",
            backlog_sec,
            "undrained audio backlog; consider a smaller or faster model"
        );
    }
}

fn forward_events(
    events: Vec<AudioEvent>,
    transcription_tx: &Sender<AudioEvent>,
    diarization_tx: Option<&Sender<AudioEvent>>,
    shared: &Shared,
) -> bool {
    for event in events {
        if let Some(diarization_tx) = diarization_tx {
            if !send_event(diarization_tx, event.clone(), shared) {
                return false;
            }
        }
        if !send_event(transcription_tx, event, shared) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Transcription stage
// ---------------------------------------------------------------------------

fn run_transcription(
    shared: &Shared,
    mut policy: TranscriberPolicy,
    rx: &Receiver<AudioEvent>,
    translation_tx: Option<&Sender<TranslateMsg>>,
) {
    let separator = shared.config.backend_policy.word_separator();
    let initial_speaker = if shared.config.diarization {
        SPEAKER_PENDING
    } else {
        SPEAKER_UNASSIGNED
    };

    let integrate = |output: TickOutput, shared: &Shared| -> Vec<Token> {
        let mut tokens = output.tokens;
        for token in &mut tokens {
            token.speaker = initial_speaker;
        }
        let committed_text = tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(separator);
        let mut state = shared.state.lock().expect("session lock poisoned");
        state.tentative = output.tentative;
        state.integrate_tokens(tokens.clone(), output.processed_to);
        state.dedup_tentative_prefix(&committed_text);
        tokens
    };

    let forward_tokens = |tokens: &[Token], shared: &Shared| {
        let Some(tx) = translation_tx else { return };
        for token in tokens {
            if token.is_silence_marker() {
                continue;
            }
            let mut msg = TranslateMsg::Token(token.clone());
            loop {
                if shared.cancelled() {
                    return;
                }
                match tx.send_timeout(msg, POLL) {
                    Ok(()) => break,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => msg = back,
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                }
            }
        }
    };

    loop {
        if shared.cancelled() {
            break;
        }
        match rx.recv_timeout(POLL) {
            Ok(AudioEvent::Chunk(chunk)) => {
                policy.insert_audio(&chunk.pcm, chunk.end);
                match policy.tick() {
                    Ok(output) => {
                        let tokens = integrate(output, shared);
                        forward_tokens(&tokens, shared);
                    }
                    Err(error) => {
                        shared.fail("transcription", &error);
                        break;
                    }
                }
            }
            Ok(AudioEvent::SilenceStart { .. }) => match policy.start_silence() {
                Ok(output) => {
                    let tokens = integrate(output, shared);
                    forward_tokens(&tokens, shared);
                }
                Err(error) => {
                    shared.fail("transcription", &error);
                    break;
                }
            },
            Ok(AudioEvent::SilenceEnd {
                start,
                end,
                duration,
            }) => {
                policy.end_silence(duration);
                if duration > shared.config.min_silence_marker_sec {
                    let marker = Token::silence_marker(start, end);
                    let mut state = shared.state.lock().expect("session lock poisoned");
                    state.integrate_tokens(vec![marker], end);
                }
            }
            Ok(AudioEvent::Eof) => {
                match policy.finish() {
                    Ok(output) => {
                        let tokens = integrate(output, shared);
                        forward_tokens(&tokens, shared);
                    }
                    Err(error) => shared.fail("transcription", &error),
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(tx) = translation_tx {
        let _ = tx.send_timeout(TranslateMsg::Eof, Duration::from_secs(1));
    }
}

// ---------------------------------------------------------------------------
// Diarization stage
// ---------------------------------------------------------------------------

fn run_diarization(shared: &Shared, mut lane: DiarizationLane, rx: &Receiver<AudioEvent>) {
    loop {
        if shared.cancelled() {
            break;
        }
        match rx.recv_timeout(POLL) {
            Ok(AudioEvent::Chunk(chunk)) => {
                let intervals = lane.feed(&chunk.pcm, chunk.end);
                if intervals.is_empty() {
                    continue;
                }
                let mut state = shared.state.lock().expect("session lock poisoned");
                for interval in &intervals {
                    state.end_of_diarized_audio = state.end_of_diarized_audio.max(interval.end);
                }
                state.new_speaker_intervals.extend(intervals);
            }
            Ok(AudioEvent::SilenceEnd { duration, .. }) => lane.silence(duration),
            Ok(AudioEvent::SilenceStart { .. }) => {}
            Ok(AudioEvent::Eof) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Translation stage
// ---------------------------------------------------------------------------

fn run_translation(shared: &Shared, mut lane: TranslationLane, rx: &Receiver<TranslateMsg>) {
    loop {
        if shared.cancelled() {
            break;
        }
        match rx.recv_timeout(POLL) {
            Ok(TranslateMsg::Token(token)) => {
                let finished = lane.push_token(&token);
                let mut state = shared.state.lock().expect("session lock poisoned");
                if let Some(translation) = finished {
                    state.new_translations.push(translation);
                }
                state.translation_tentative = lane.tentative().clone();
            }
            Ok(TranslateMsg::Eof) => {
                let finished = lane.flush();
                let mut state = shared.state.lock().expect("session lock poisoned");
                if let Some(translation) = finished {
                    state.new_translations.push(translation);
                }
                state.translation_tentative.clear();
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher stage
// ---------------------------------------------------------------------------

fn run_publisher(shared: &Shared, publisher: &mut Publisher, interval: Duration) {
    loop {
        thread::sleep(interval);
        let fatal = {
            let mut state = shared.state.lock().expect("session lock poisoned");
            if state.fatal_error.is_none() {
                publisher.tick(&mut state);
            }
            state.fatal_error.is_some()
        };
        if fatal || shared.cancelled() || (shared.stopping.load(Ordering::SeqCst) && shared.workers_done())
        {
            let mut state = shared.state.lock().expect("session lock poisoned");
            publisher.finalize(&mut state);
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

fn run_watchdog(shared: &Shared) {
    let mut reported = [false; 4];
    loop {
        if shared.flags.publisher.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(Duration::from_millis(500));
        if shared.stopping.load(Ordering::SeqCst) || shared.cancelled() {
            continue;
        }
        let stages = [
            ("gate", shared.flags.gate.load(Ordering::SeqCst)),
            (
                "transcription",
                shared.flags.transcription.load(Ordering::SeqCst),
            ),
            (
                "diarization",
                shared.config.diarization && shared.flags.diarization.load(Ordering::SeqCst),
            ),
            (
                "translation",
                shared.config.translation && shared.flags.translation.load(Ordering::SeqCst),
            ),
        ];
        for (index, (name, done)) in stages.iter().enumerate() {
            if *done && !reported[index] {
                reported[index] = true;
                tracing::warn!(stage = *name, "stage worker exited while the stream is live");
            }
        }
    }
}
