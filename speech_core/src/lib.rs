//! Multi-stage speech synthesis: text front-end, speaker conditioning,
//! streaming speech-token generation, acoustic decoding, vocoding and
//! chunk assembly behind a single [`Synthesizer`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use speech_core::{PipelineConfig, SpeakerRegistry, Stages, SynthesisMode, SynthesisRequest, Synthesizer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = PipelineConfig::default();
//! let stages = Stages::builtin(&config);
//! let synth = Synthesizer::new(config, stages, Arc::new(SpeakerRegistry::new()));
//! let request = SynthesisRequest::new(
//!     "Hello world",
//!     SynthesisMode::FixedSpeaker { speaker_id: "spk_A".into() },
//! );
//! let clip = synth.synthesize_clip(request).await?;
//! println!("{} ms of audio", clip.duration_ms());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod audio;
pub mod builtin;
pub mod cache;
pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod stages;
pub mod text;

pub use assembler::{AssemblyMode, StreamingAssembler};
pub use audio::{AudioClip, WaveformChunk, WaveformClip};
pub use cache::{CacheStats, EmbeddingCache};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, Result, Stage, SynthesisError};
pub use generator::{GeneratorState, TokenGenerator, TokenWindow, WindowPolicy};
pub use pipeline::{parse_language, Stages, Synthesis, SynthesisStream, Synthesizer};
pub use registry::{JsonFileStore, MemoryStore, ProfileStore, SpeakerProfile, SpeakerRegistry};
pub use request::{ModeKind, ReferenceClip, SpeakerRef, SynthesisMode, SynthesisOptions, SynthesisRequest};
pub use stages::{
    AcousticChunk, AcousticDecoder, Conditioning, LengthState, LmInput, LmSession, SpeakerEmbedder, SpeakerFeatures,
    SpeechLm, Tokenizer, Transcriber, Vocoder,
};
pub use text::{Language, TextUnit};
