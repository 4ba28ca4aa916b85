//! Error types shared by every pipeline stage.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::request::ModeKind;

/// Failure taxonomy of the synthesis pipeline.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("invalid request for mode {mode}: {reason}")]
    InvalidRequest { mode: ModeKind, reason: String },

    #[error("speaker '{0}' already exists")]
    AlreadyExists(String),

    #[error("speaker '{0}' not found")]
    NotFound(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("{stage} stage timed out after {}ms", .after.as_millis())]
    Timeout { stage: Stage, after: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is malformed: {0}")]
    Persistence(String),
}

/// Coarse classification used by hosts to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    InvalidAudio,
    InvalidRequest,
    AlreadyExists,
    NotFound,
    Generation,
    Decode,
    Timeout,
    Io,
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SynthesisError::InvalidInput(_) => ErrorKind::InvalidInput,
            SynthesisError::InvalidAudio(_) => ErrorKind::InvalidAudio,
            SynthesisError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            SynthesisError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SynthesisError::NotFound(_) => ErrorKind::NotFound,
            SynthesisError::Generation(_) => ErrorKind::Generation,
            SynthesisError::Decode(_) => ErrorKind::Decode,
            SynthesisError::Timeout { .. } => ErrorKind::Timeout,
            SynthesisError::Io(_) | SynthesisError::Persistence(_) => ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for SynthesisError {
    fn from(e: serde_json::Error) -> Self {
        SynthesisError::Persistence(e.to_string())
    }
}

impl From<hound::Error> for SynthesisError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => SynthesisError::Io(io),
            other => SynthesisError::InvalidAudio(other.to_string()),
        }
    }
}

/// Pipeline step a request was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    ResolveSpeaker,
    Normalize,
    Tokenize,
    Embed,
    Generate,
    Decode,
    Vocode,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::ResolveSpeaker => "resolve_speaker",
            Stage::Normalize => "normalize",
            Stage::Tokenize => "tokenize",
            Stage::Embed => "embed",
            Stage::Generate => "generate",
            Stage::Decode => "decode",
            Stage::Vocode => "vocode",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

const EXCERPT_CHARS: usize = 40;

/// Error returned by the orchestrator. Carries enough context to tell
/// which request failed and where.
#[derive(Debug, Error)]
#[error("{mode} request failed at {stage} (\"{excerpt}\"): {source}")]
pub struct PipelineError {
    pub mode: ModeKind,
    pub stage: Stage,
    pub excerpt: String,
    #[source]
    pub source: SynthesisError,
}

impl PipelineError {
    pub fn new(mode: ModeKind, stage: Stage, text: &str, source: SynthesisError) -> Self {
        Self {
            mode,
            stage,
            excerpt: excerpt(text),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

pub(crate) fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_CHARS).collect();
    if text.chars().nth(EXCERPT_CHARS).is_some() {
        out.push_str("...");
    }
    out
}

pub type Result<T, E = SynthesisError> = std::result::Result<T, E>;
