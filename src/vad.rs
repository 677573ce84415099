//! Voice-activity gate.
//!
//! Splits the continuous 16 kHz PCM stream into active audio chunks and
//! silence events by running the external VAD on fixed 512-sample
//! windows (≈32 ms). A single monotonic sample counter maps samples to
//! stream time; it is never reset within a session.

use crate::backend::Vad;
use crate::error::EsResult;
use crate::model::{samples_to_seconds, SAMPLE_RATE};

/// VAD window size in samples (≈32 ms at 16 kHz).
pub const VAD_WINDOW: usize = 512;

/// Bound on a single downstream chunk piece: one second of audio. Long
/// voiced regions are flushed in pieces of this size so no stage buffers
/// an utterance unboundedly.
pub const CHUNK_FLUSH_SAMPLES: usize = SAMPLE_RATE as usize;

/// A contiguous run of voiced PCM with its span on the stream time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub pcm: Vec<i16>,
    pub start: f64,
    pub end: f64,
}

/// What the gate hands to the transcription and diarization lanes.
/// Silence is reported twice — once when it begins (so the transcriber
/// can flush) and once when voice resumes (with the measured duration).
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Chunk(AudioChunk),
    SilenceStart {
        start: f64,
    },
    SilenceEnd {
        start: f64,
        end: f64,
        duration: f64,
    },
    /// End-of-stream marker emitted once by `finish`.
    Eof,
}

#[derive(Clone, Copy)]
enum GateState {
    Active,
    Silent { since: u64 },
}

pub struct VadGate {
    vad: Box<dyn Vad>,
    state: GateState,
    /// Partial window awaiting its 512th sample.
    window: Vec<i16>,
    /// Absolute sample index of the next unprocessed window.
    processed: u64,
    /// Absolute sample count appended so far; the session's ingress head.
    appended: u64,
    chunk: Vec<i16>,
    chunk_start: u64,
    flush_samples: usize,
}

impl VadGate {
    #[must_use]
    pub fn new(vad: Box<dyn Vad>) -> Self {
        Self {
            vad,
            // A session opens in silence; the first voice onset closes it.
            state: GateState::Silent { since: 0 },
            window: Vec::with_capacity(VAD_WINDOW),
            processed: 0,
            appended: 0,
            chunk: Vec::new(),
            chunk_start: 0,
            flush_samples: CHUNK_FLUSH_SAMPLES,
        }
    }

    /// Stream time of the ingress head.
    #[must_use]
    pub fn stream_time(&self) -> f64 {
        samples_to_seconds(self.appended)
    }

    /// Feed decoded PCM; returns the ordered events it produced.
    pub fn feed(&mut self, pcm: &[i16]) -> EsResult<Vec<AudioEvent>> {
        let mut events = Vec::new();
        for &sample in pcm {
            self.window.push(sample);
            self.appended += 1;
            if self.window.len() == VAD_WINDOW {
                let window = std::mem::replace(&mut self.window, Vec::with_capacity(VAD_WINDOW));
                self.process_window(&window, &mut events)?;
            }
        }
        Ok(events)
    }

    /// Flush at end of stream: the trailing partial window joins the
    /// pipeline unclassified, the open chunk or silence span is
    /// finalized, and `Eof` is appended.
    pub fn finish(&mut self) -> EsResult<Vec<AudioEvent>> {
        let mut events = Vec::new();
        let tail = std::mem::take(&mut self.window);
        self.processed += tail.len() as u64;
        match self.state {
            GateState::Active => {
                self.chunk.extend_from_slice(&tail);
                self.emit_chunk(self.processed, &mut events);
            }
            GateState::Silent { since } => {
                let end = self.appended;
                events.push(AudioEvent::SilenceEnd {
                    start: samples_to_seconds(since),
                    end: samples_to_seconds(end),
                    duration: samples_to_seconds(end.saturating_sub(since)),
                });
            }
        }
        events.push(AudioEvent::Eof);
        Ok(events)
    }

    fn process_window(&mut self, window: &[i16], events: &mut Vec<AudioEvent>) -> EsResult<()> {
        let window_abs = self.processed;
        let verdict = self.vad.feed(window)?;
        self.processed += window.len() as u64;

        match self.state {
            GateState::Silent { since } => {
                let Some(verdict) = verdict else {
                    return Ok(());
                };
                if let Some(voice_start) = verdict.start {
                    let voice_start = voice_start.clamp(window_abs, self.processed);
                    events.push(AudioEvent::SilenceEnd {
                        start: samples_to_seconds(since),
                        end: samples_to_seconds(voice_start),
                        duration: samples_to_seconds(voice_start.saturating_sub(since)),
                    });
                    self.state = GateState::Active;
                    self.chunk_start = voice_start;
                    let rel = (voice_start - window_abs) as usize;
                    self.chunk.extend_from_slice(&window[rel..]);
                    // A verdict may close the voice again within the
                    // same window (a sub-32 ms utterance).
                    match verdict.end {
                        Some(voice_end) if voice_end > voice_start => {
                            let voice_end = voice_end.clamp(voice_start, self.processed);
                            self.chunk.truncate((voice_end - voice_start) as usize);
                            self.emit_chunk(voice_end, events);
                            self.state = GateState::Silent { since: voice_end };
                            events.push(AudioEvent::SilenceStart {
                                start: samples_to_seconds(voice_end),
                            });
                        }
                        _ => self.flush_pieces(events),
                    }
                }
            }
            GateState::Active => {
                let voice_end = verdict.and_then(|v| v.end);
                if let Some(voice_end) = voice_end {
                    let voice_end = voice_end.clamp(window_abs, self.processed);
                    let rel = (voice_end - window_abs) as usize;
                    self.chunk.extend_from_slice(&window[..rel]);
                    self.emit_chunk(voice_end, events);
                    self.state = GateState::Silent { since: voice_end };
                    events.push(AudioEvent::SilenceStart {
                        start: samples_to_seconds(voice_end),
                    });
                    // ... and voice may resume later in the same window
                    // (a sub-32 ms gap).
                    if let Some(restart) = verdict.and_then(|v| v.start).filter(|&s| s > voice_end)
                    {
                        let restart = restart.clamp(voice_end, self.processed);
                        events.push(AudioEvent::SilenceEnd {
                            start: samples_to_seconds(voice_end),
                            end: samples_to_seconds(restart),
                            duration: samples_to_seconds(restart.saturating_sub(voice_end)),
                        });
                        self.state = GateState::Active;
                        self.chunk_start = restart;
                        let rel = (restart - window_abs) as usize;
                        self.chunk.extend_from_slice(&window[rel..]);
                        self.flush_pieces(events);
                    }
                } else {
                    self.chunk.extend_from_slice(window);
                    self.flush_pieces(events);
                }
            }
        }
        Ok(())
    }

    /// Flush full-sized pieces of the open chunk downstream.
    fn flush_pieces(&mut self, events: &mut Vec<AudioEvent>) {
        while self.chunk.len() >= self.flush_samples {
            let piece: Vec<i16> = self.chunk.drain(..self.flush_samples).collect();
            let start = self.chunk_start;
            self.chunk_start += piece.len() as u64;
            events.push(AudioEvent::Chunk(AudioChunk {
                start: samples_to_seconds(start),
                end: samples_to_seconds(self.chunk_start),
                pcm: piece,
            }));
        }
    }

    /// Emit whatever remains of the open chunk, ending at `end_sample`.
    fn emit_chunk(&mut self, end_sample: u64, events: &mut Vec<AudioEvent>) {
        self.flush_pieces(events);
        if self.chunk.is_empty() {
            self.chunk_start = end_sample;
            return;
        }
        let piece = std::mem::take(&mut self.chunk);
        let start = self.chunk_start;
        self.chunk_start = end_sample;
        events.push(AudioEvent::Chunk(AudioChunk {
            start: samples_to_seconds(start),
            end: samples_to_seconds(start + piece.len() as u64),
            pcm: piece,
        }));
    }
}
