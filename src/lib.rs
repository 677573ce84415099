#![forbid(unsafe_code)]

pub mod align;
pub mod backend;
pub mod config;
pub mod decoder;
pub mod diarize;
pub mod error;
pub mod logging;
pub mod model;
pub mod publish;
pub mod session;
pub mod transcribe;
pub mod translate;
pub mod vad;

pub use backend::ModelBundle;
pub use config::{BackendPolicy, BufferTrimming, SessionConfig, TimestampFormat};
pub use error::{EsError, EsResult};
pub use model::{OutputEvent, Segment, SessionStatus, Snapshot, Token};
pub use session::Session;
