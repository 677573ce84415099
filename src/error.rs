use thiserror::Error;

pub type EsResult<T> = Result<T, EsError>;

#[derive(Debug, Error)]
pub enum EsError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing decoder command `{command}` on PATH")]
    DecoderMissing { command: String },

    #[error("decoder child crashed; gave up after {restarts} restart(s)")]
    DecoderCrash { restarts: u32 },

    #[error("decoder is not running (state: {state})")]
    DecoderUnavailable { state: &'static str },

    #[error("voice activity detector failed: {0}")]
    VadFailure(String),

    #[error("transient ASR failure: {0}")]
    AsrTransient(String),

    #[error("ASR failed on {ticks} consecutive tick(s)")]
    AsrPersistent { ticks: u32 },

    #[error("diarizer failed: {0}")]
    DiarizerFailure(String),

    #[error("translator failed: {0}")]
    TranslatorFailure(String),

    #[error("backpressure at {stage}: input rejected")]
    Backpressure { stage: &'static str },

    #[error("session cancelled: {0}")]
    Cancelled(String),

    #[error("stage channel closed: {stage}")]
    ChannelClosed { stage: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EsError {
    /// Stable, unique, machine-readable error code for every variant.
    /// These are the identifiers surfaced in the terminal `error` snapshot.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "ES-IO",
            Self::Json(_) => "ES-JSON",
            Self::DecoderMissing { .. } => "ES-DECODER-MISSING",
            Self::DecoderCrash { .. } => "ES-DECODER-CRASH",
            Self::DecoderUnavailable { .. } => "ES-DECODER-UNAVAILABLE",
            Self::VadFailure(_) => "ES-VAD",
            Self::AsrTransient(_) => "ES-ASR-TRANSIENT",
            Self::AsrPersistent { .. } => "ES-ASR-PERSISTENT",
            Self::DiarizerFailure(_) => "ES-DIARIZER",
            Self::TranslatorFailure(_) => "ES-TRANSLATOR",
            Self::Backpressure { .. } => "ES-BACKPRESSURE",
            Self::Cancelled(_) => "ES-CANCELLED",
            Self::ChannelClosed { .. } => "ES-CHANNEL-CLOSED",
            Self::InvalidConfig(_) => "ES-CONFIG",
        }
    }

    /// Whether this error terminates the session. Degraded-mode errors
    /// (diarizer, translator) and per-tick transients are survivable;
    /// everything else tears the pipeline down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::AsrTransient(_)
                | Self::DiarizerFailure(_)
                | Self::TranslatorFailure(_)
                | Self::Backpressure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::EsError;

    fn all_variants() -> Vec<EsError> {
        vec![
            EsError::Io(std::io::Error::other("disk fail")),
            EsError::Json(serde_json::from_str::<serde_json::Value>("{").unwrap_err()),
            EsError::DecoderMissing {
                command: "ffmpeg".to_owned(),
            },
            EsError::DecoderCrash { restarts: 3 },
            EsError::DecoderUnavailable { state: "failed" },
            EsError::VadFailure("bad window".to_owned()),
            EsError::AsrTransient("shape mismatch".to_owned()),
            EsError::AsrPersistent { ticks: 5 },
            EsError::DiarizerFailure("embedder".to_owned()),
            EsError::TranslatorFailure("model".to_owned()),
            EsError::Backpressure { stage: "ingress" },
            EsError::Cancelled("drain deadline".to_owned()),
            EsError::ChannelClosed {
                stage: "transcription",
            },
            EsError::InvalidConfig("publish_hz must be positive".to_owned()),
        ]
    }

    #[test]
    fn every_variant_has_unique_es_code() {
        let variants = all_variants();
        assert_eq!(variants.len(), 14, "test should cover every EsError variant");

        let mut seen = std::collections::HashSet::new();
        for error in &variants {
            let code = error.error_code();
            assert!(code.starts_with("ES-"), "code must start with ES-: `{code}`");
            assert!(seen.insert(code), "duplicate error_code detected: `{code}`");
        }
    }

    #[test]
    fn error_code_format() {
        for error in &all_variants() {
            let code = error.error_code();
            let suffix = &code[3..];
            assert!(
                !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_uppercase() || c == '-'),
                "code suffix must match [A-Z-]+ but got `{suffix}` in `{code}`"
            );
        }
    }

    #[test]
    fn degraded_mode_errors_are_not_fatal() {
        assert!(!EsError::DiarizerFailure("x".to_owned()).is_fatal());
        assert!(!EsError::TranslatorFailure("x".to_owned()).is_fatal());
        assert!(!EsError::AsrTransient("x".to_owned()).is_fatal());
        assert!(!EsError::Backpressure { stage: "ingress" }.is_fatal());
    }

    #[test]
    fn pipeline_errors_are_fatal() {
        assert!(EsError::DecoderMissing {
            command: "ffmpeg".to_owned()
        }
        .is_fatal());
        assert!(EsError::DecoderCrash { restarts: 3 }.is_fatal());
        assert!(EsError::VadFailure("x".to_owned()).is_fatal());
        assert!(EsError::AsrPersistent { ticks: 5 }.is_fatal());
        assert!(EsError::Cancelled("x".to_owned()).is_fatal());
    }

    #[test]
    fn decoder_crash_displays_restart_count() {
        let text = EsError::DecoderCrash { restarts: 3 }.to_string();
        assert!(text.contains("3 restart"), "got: {text}");
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: EsError = io_err.into();
        assert!(matches!(err, EsError::Io(_)));
        assert!(err.to_string().contains("pipe gone"));
    }

    #[test]
    fn es_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<EsError>();
        assert_sync::<EsError>();
    }
}
