//! Content generation: intent → text → speech → validated cached audio.

pub mod intent;
pub mod orchestrator;
pub mod retry;
pub mod speech;
pub mod text;
pub mod validate;

use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorKind;

pub use orchestrator::{ContentOrchestrator, OrchestratorSettings};
pub use speech::{HttpSpeechSynthesizer, QualityTier, SpeechRequest, SpeechSynthesizer, SynthesisError, SynthesizedAudio};
pub use text::{OllamaTextGenerator, TextGenError, TextGenerator, TextRequest};

/// Per-alarm pipeline progress, published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    GeneratingText,
    GeneratingAudio,
    Complete,
    Failed { reason: String },
    Discarded,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. } | Self::Discarded)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("alarm not found")]
    AlarmNotFound,

    #[error("text generation failed: {0}")]
    Text(#[from] TextGenError),

    #[error("speech synthesis failed: {0}")]
    Speech(#[from] SynthesisError),

    #[error("generated text rejected twice: {0}")]
    ContentInvalid(String),

    #[error("synthesized audio rejected twice: {0}")]
    AudioInvalid(String),

    #[error("cache write failed: {message}")]
    Cache { kind: ErrorKind, message: String },

    #[error("could not attach content: {0}")]
    Storage(String),

    #[error("generation discarded")]
    Discarded,

    #[error("generation task ended without a result")]
    Abandoned,
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlarmNotFound => ErrorKind::NotFound,
            Self::Text(e) => e.kind(),
            Self::Speech(e) => e.kind(),
            Self::ContentInvalid(_) | Self::AudioInvalid(_) => ErrorKind::ContentInvalid,
            Self::Cache { kind, .. } => *kind,
            Self::Storage(_) | Self::Abandoned => ErrorKind::Transient,
            Self::Discarded => ErrorKind::AlreadySatisfied,
        }
    }
}
