//! Supervised external decode child.
//!
//! Converts arbitrary compressed input into 16 kHz mono s16le PCM by
//! piping it through a child process (ffmpeg by default). The child is
//! supervised through a small state machine guarded by a single lock:
//!
//! `Stopped → Starting → Running → (Restarting | Failed) → Stopped`
//!
//! A write or read failure while Running terminates the child and
//! retries with backoff against a bounded per-session restart budget;
//! exhausting the budget is fatal for the session. stdout is drained by
//! a reader thread into an in-order byte channel, stderr by a logger
//! thread.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{EsError, EsResult};
use crate::model::SAMPLE_RATE;

/// How the decode child is invoked. The accepted input codecs are
/// whatever the child supports; this crate only cares that its stdout
/// carries 16 kHz mono s16le.
#[derive(Debug, Clone)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    /// The standard ffmpeg pipe: compressed stdin in, s16le stdout out.
    #[must_use]
    pub fn ffmpeg_pipe() -> Self {
        Self {
            program: "ffmpeg".to_owned(),
            args: vec![
                "-hide_banner".to_owned(),
                "-loglevel".to_owned(),
                "error".to_owned(),
                "-i".to_owned(),
                "pipe:0".to_owned(),
                "-f".to_owned(),
                "s16le".to_owned(),
                "-acodec".to_owned(),
                "pcm_s16le".to_owned(),
                "-ac".to_owned(),
                "1".to_owned(),
                "-ar".to_owned(),
                SAMPLE_RATE.to_string(),
                "pipe:1".to_owned(),
            ],
        }
    }

    #[must_use]
    pub fn custom(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl DecoderState {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of a bounded [`Decoder::read`].
#[derive(Debug, PartialEq, Eq)]
pub enum DecoderRead {
    Data(Vec<u8>),
    /// Nothing arrived within the timeout. A warning during active voice
    /// input, never fatal by itself.
    TimedOut,
    /// Clean end of stream after `finish()`.
    Eof,
}

enum ReaderMsg {
    Data(Vec<u8>),
    Eof { generation: u64 },
}

struct Supervised {
    state: DecoderState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    generation: u64,
    restarts_used: u32,
}

struct Shared {
    command: DecoderCommand,
    max_restarts: u32,
    sup: Mutex<Supervised>,
    out_tx: Sender<ReaderMsg>,
    stopping: AtomicBool,
    /// Decoded bytes produced by the child but not yet handed out by
    /// `read` — the undrained PCM backlog.
    undrained: Arc<AtomicU64>,
}

pub struct Decoder {
    shared: Arc<Shared>,
    out_rx: Receiver<ReaderMsg>,
    pending: Mutex<Vec<u8>>,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").finish()
    }
}

impl Decoder {
    /// Probe the command on PATH, spawn the first child, and start the
    /// pipe threads. `DecoderMissing` is a startup-fatal error.
    pub fn spawn(command: DecoderCommand, max_restarts: u32) -> EsResult<Self> {
        if which::which(&command.program).is_err() {
            return Err(EsError::DecoderMissing {
                command: command.program,
            });
        }

        let (out_tx, out_rx) = unbounded();
        let shared = Arc::new(Shared {
            command,
            max_restarts,
            sup: Mutex::new(Supervised {
                state: DecoderState::Starting,
                child: None,
                stdin: None,
                generation: 0,
                restarts_used: 0,
            }),
            out_tx,
            stopping: AtomicBool::new(false),
            undrained: Arc::new(AtomicU64::new(0)),
        });

        {
            let mut sup = shared.sup.lock().expect("decoder lock poisoned");
            spawn_child(&shared, &mut sup)?;
            sup.state = DecoderState::Running;
        }
        tracing::info!(stage = "decoder", "decode child started");

        Ok(Self {
            shared,
            out_rx,
            pending: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.shared.sup.lock().expect("decoder lock poisoned").state
    }

    /// Decoded PCM sitting between the child and the consumer of
    /// `read`. Grows when the downstream pipeline cannot keep up.
    #[must_use]
    pub fn backlog_bytes(&self) -> u64 {
        self.shared.undrained.load(Ordering::Relaxed)
    }

    /// Forward compressed input to the child. Fails only when the child
    /// is not Running; a broken pipe mid-write triggers one supervised
    /// restart and a single retry.
    pub fn write(&self, bytes: &[u8]) -> EsResult<()> {
        if let Err(generation) = self.try_write(bytes) {
            self.shared.recover(generation)?;
            if self.try_write(bytes).is_err() {
                return Err(EsError::DecoderUnavailable {
                    state: self.state().label(),
                });
            }
        }
        Ok(())
    }

    /// Ok(()) on success, Err(generation) when the pipe broke under a
    /// Running child. Non-Running states surface immediately.
    fn try_write(&self, bytes: &[u8]) -> Result<(), u64> {
        let mut sup = self.shared.sup.lock().expect("decoder lock poisoned");
        if sup.state != DecoderState::Running {
            // Treat as a broken generation so the caller goes through
            // recover(), which reports the definitive error.
            return Err(sup.generation);
        }
        let generation = sup.generation;
        let Some(stdin) = sup.stdin.as_mut() else {
            return Err(generation);
        };
        match stdin.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(stage = "decoder", %error, "write to decode child failed");
                Err(generation)
            }
        }
    }

    /// Read up to `max_bytes` of PCM, waiting at most `timeout`. A dead
    /// child is restarted transparently (bounded by the restart budget)
    /// and reported as `TimedOut` so the caller simply polls again.
    pub fn read(&self, max_bytes: usize, timeout: Duration) -> EsResult<DecoderRead> {
        {
            let mut pending = self.pending.lock().expect("decoder lock poisoned");
            if !pending.is_empty() {
                let take = pending.len().min(max_bytes);
                let out: Vec<u8> = pending.drain(..take).collect();
                self.shared
                    .undrained
                    .fetch_sub(out.len() as u64, Ordering::Relaxed);
                return Ok(DecoderRead::Data(out));
            }
        }

        match self.out_rx.recv_timeout(timeout) {
            Ok(ReaderMsg::Data(mut buf)) => {
                if buf.len() > max_bytes {
                    let rest = buf.split_off(max_bytes);
                    self.pending
                        .lock()
                        .expect("decoder lock poisoned")
                        .extend_from_slice(&rest);
                }
                self.shared
                    .undrained
                    .fetch_sub(buf.len() as u64, Ordering::Relaxed);
                Ok(DecoderRead::Data(buf))
            }
            Ok(ReaderMsg::Eof { generation }) => {
                if self.shared.stopping.load(Ordering::SeqCst) {
                    let mut sup = self.shared.sup.lock().expect("decoder lock poisoned");
                    reap(&mut sup);
                    sup.state = DecoderState::Stopped;
                    return Ok(DecoderRead::Eof);
                }
                self.shared.recover(generation)?;
                Ok(DecoderRead::TimedOut)
            }
            Err(RecvTimeoutError::Timeout) => Ok(DecoderRead::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Ok(DecoderRead::Eof),
        }
    }

    /// Close the child's stdin so it flushes its tail and exits; the
    /// reader drains remaining output before `read` reports `Eof`.
    pub fn finish(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let mut sup = self.shared.sup.lock().expect("decoder lock poisoned");
        sup.stdin.take();
    }

    /// Hard stop: kill the child and mark the machine Stopped.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let mut sup = self.shared.sup.lock().expect("decoder lock poisoned");
        reap(&mut sup);
        sup.state = DecoderState::Stopped;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Supervised restart after observing generation `generation` die.
    /// Stale generations (already replaced) are ignored. Returns the
    /// fatal error once the restart budget is exhausted.
    fn recover(&self, generation: u64) -> EsResult<()> {
        let (attempt, next_generation) = {
            let mut sup = self.sup.lock().expect("decoder lock poisoned");
            if sup.generation != generation || sup.state == DecoderState::Restarting {
                return Ok(());
            }
            if self.stopping.load(Ordering::SeqCst) {
                sup.state = DecoderState::Stopped;
                return Ok(());
            }
            if sup.state == DecoderState::Failed {
                return Err(EsError::DecoderCrash {
                    restarts: sup.restarts_used,
                });
            }
            reap(&mut sup);
            if sup.restarts_used >= self.max_restarts {
                sup.state = DecoderState::Failed;
                tracing::error!(
                    stage = "decoder",
                    restarts = sup.restarts_used,
                    "decode child restart budget exhausted"
                );
                return Err(EsError::DecoderCrash {
                    restarts: sup.restarts_used,
                });
            }
            sup.restarts_used += 1;
            sup.state = DecoderState::Restarting;
            sup.generation += 1;
            (sup.restarts_used, sup.generation)
        };

        tracing::warn!(
            stage = "decoder",
            attempt,
            "decode child died, restarting with backoff"
        );
        thread::sleep(Duration::from_millis(200 * u64::from(attempt)));

        let mut sup = self.sup.lock().expect("decoder lock poisoned");
        if sup.generation != next_generation || sup.state != DecoderState::Restarting {
            return Ok(());
        }
        match spawn_child_arc(self, &mut sup) {
            Ok(()) => {
                sup.state = DecoderState::Running;
                tracing::info!(stage = "decoder", attempt, "decode child restarted");
                Ok(())
            }
            Err(error) => {
                sup.state = DecoderState::Failed;
                tracing::error!(stage = "decoder", %error, "decode child respawn failed");
                Err(EsError::DecoderCrash {
                    restarts: sup.restarts_used,
                })
            }
        }
    }
}

fn reap(sup: &mut Supervised) {
    sup.stdin.take();
    if let Some(mut child) = sup.child.take() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn spawn_child(shared: &Arc<Shared>, sup: &mut Supervised) -> EsResult<()> {
    spawn_child_arc(shared.as_ref(), sup)
}

fn spawn_child_arc(shared: &Shared, sup: &mut Supervised) -> EsResult<()> {
    let mut child = Command::new(&shared.command.program)
        .args(&shared.command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    sup.stdin = child.stdin.take();

    let generation = sup.generation;
    let out_tx = shared.out_tx.clone();
    let undrained = shared.undrained.clone();
    thread::spawn(move || {
        let mut stdout = stdout;
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    undrained.fetch_add(n as u64, Ordering::Relaxed);
                    if out_tx.send(ReaderMsg::Data(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = out_tx.send(ReaderMsg::Eof { generation });
    });

    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    tracing::debug!(stage = "decoder", "child stderr: {line}");
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    sup.child = Some(child);
    Ok(())
}
