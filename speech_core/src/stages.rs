//! Contracts for the learned stages of the pipeline.
//!
//! Each stage is a black box behind a trait so backends can be swapped
//! without touching the orchestrator. All of them are synchronous and are
//! driven from the blocking pool; only the transcriber is async since it
//! usually lives behind a network call.

use async_trait::async_trait;

use crate::audio::{AudioClip, WaveformChunk};
use crate::error::{Result, SynthesisError};
use crate::generator::TokenWindow;
use crate::text::Language;

/// Text to token ids.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, language: Language) -> Result<Vec<u32>>;

    /// Token announcing the target language, used by cross-lingual requests.
    fn language_token(&self, language: Language) -> u32;

    /// Token closing an instruction prefix.
    fn end_of_instruction(&self) -> u32;

    fn vocab_size(&self) -> u32;
}

/// What the embedder extracts from a reference clip.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerFeatures {
    pub embedding: Vec<f32>,
    pub prompt_tokens: Vec<u32>,
}

/// Reference clip to speaker features. Receives clips already prepared by
/// [`AudioClip::prepare_prompt`].
pub trait SpeakerEmbedder: Send + Sync {
    fn embed(&self, clip: &AudioClip) -> Result<SpeakerFeatures>;
}

/// Per-request conditioning shared by the language model and the decoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditioning {
    pub embedding: Vec<f32>,
    /// Text tokens the language model sees before the target text: the
    /// prompt transcript in zero-shot mode, the instruction in instruct mode.
    pub prompt_text_tokens: Vec<u32>,
    /// Speech tokens the language model continues from.
    pub lm_prompt_tokens: Vec<u32>,
    /// Speech tokens the acoustic decoder is conditioned on.
    pub flow_prompt_tokens: Vec<u32>,
    pub seed: u64,
    /// Speaking rate multiplier, 1.0 is neutral.
    pub speed: f32,
}

/// Everything the language model needs to start a session.
#[derive(Debug, Clone)]
pub struct LmInput {
    pub text_tokens: Vec<u32>,
    pub conditioning: std::sync::Arc<Conditioning>,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

/// Autoregressive speech-token model.
pub trait SpeechLm: Send + Sync {
    fn start(&self, input: LmInput) -> Result<Box<dyn LmSession>>;
}

/// One running generation. `next_token` returns `None` once the model
/// has emitted its end-of-speech marker.
pub trait LmSession: Send {
    fn next_token(&mut self) -> Result<Option<u32>>;
}

/// Cumulative length-regulation state of one request. Frame counts are
/// derived from token counts with a fractional carry so that chunked and
/// whole-utterance decoding land on the same total.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LengthState {
    pub tokens_consumed: u64,
    pub frames_emitted: u64,
    pub carry: f64,
}

impl LengthState {
    /// Frames for the next `tokens` tokens at `frames_per_token`, and the
    /// state after them.
    pub fn advance(self, tokens: usize, frames_per_token: f64) -> (usize, LengthState) {
        let exact = tokens as f64 * frames_per_token + self.carry;
        let frames = exact.floor().max(0.0);
        let next = LengthState {
            tokens_consumed: self.tokens_consumed + tokens as u64,
            frames_emitted: self.frames_emitted + frames as u64,
            carry: exact - frames,
        };
        (frames as usize, next)
    }
}

/// Frames x mel bins, row major.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticChunk {
    pub index: usize,
    /// Global index of the first frame within the request.
    pub start_frame: u64,
    pub frames: usize,
    pub bins: usize,
    pub data: Vec<f32>,
}

impl AcousticChunk {
    pub fn frame(&self, i: usize) -> &[f32] {
        &self.data[i * self.bins..(i + 1) * self.bins]
    }
}

/// Speech tokens to acoustic features, one window at a time.
pub trait AcousticDecoder: Send + Sync {
    fn decode(
        &self,
        window: &TokenWindow,
        conditioning: &Conditioning,
        state: LengthState,
    ) -> Result<(AcousticChunk, LengthState)>;
}

/// Acoustic features to waveform. No state survives between chunks.
pub trait Vocoder: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn vocode(&self, chunk: &AcousticChunk) -> Result<WaveformChunk>;
}

/// Speech-to-text used to fill in a missing prompt transcript.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String>;
}

/// Reject windows carrying ids the decoder was not trained on.
pub fn ensure_vocabulary(tokens: &[u32], vocab_size: u32) -> Result<()> {
    match tokens.iter().find(|&&t| t >= vocab_size) {
        Some(t) => Err(SynthesisError::Decode(format!(
            "speech token {t} outside vocabulary of {vocab_size}"
        ))),
        None => Ok(()),
    }
}
