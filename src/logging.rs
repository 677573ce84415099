//! Logging setup for embedders.
//!
//! `echostream` is a library: the embedding server usually owns the
//! global `tracing` subscriber, and every event this crate emits
//! already carries a `stage` field (see [`STAGE_NAMES`]) plus the
//! session id on lifecycle events, so log lines attribute themselves
//! without extra setup. For binaries with no subscriber of their own,
//! [`init`] installs a stderr subscriber honoring `RUST_LOG` (JSON
//! output when `RUST_LOG_FORMAT=json`).

use tracing_subscriber::EnvFilter;

/// The values of the `stage` log field, in pipeline order. Useful for
/// building filters or fanning a session's log stream out per stage.
pub const STAGE_NAMES: [&str; 6] = [
    "ingress",
    "decoder",
    "vad",
    "transcription",
    "diarization",
    "translation",
];

/// Install a process-wide stderr subscriber with the default
/// `echostream=info` filter (overridable via `RUST_LOG`).
///
/// Returns `false` when a global subscriber is already installed —
/// the embedder's subscriber wins and this call is a no-op.
pub fn init() -> bool {
    init_with(None)
}

/// Like [`init`], but explicit filter directives take precedence over
/// the environment, e.g. `init_with(Some("echostream=debug"))` while
/// chasing a single pipeline stage.
pub fn init_with(directives: Option<&str>) -> bool {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("echostream=info")),
    };

    let json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
