//! Shared fixtures for the pipeline integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use speech_core::builtin::FlowDecoder;
use speech_core::{
    AcousticChunk, AcousticDecoder, AudioClip, Conditioning, Language, LengthState, LmInput, LmSession,
    PipelineConfig, SpeakerEmbedder, SpeakerFeatures, SpeakerRegistry, SpeechLm, Stages, SynthesisError,
    Synthesizer, TokenWindow, Tokenizer, Vocoder, WaveformChunk,
};

/// A voiced 16 kHz clip: a few harmonics with a slow vibrato.
pub fn voice_clip(f0: f32, secs: f32) -> AudioClip {
    let rate = 16_000u32;
    let n = (secs * rate as f32) as usize;
    let samples = (0..n)
        .map(|i| {
            let t = i as f32 / rate as f32;
            let f = f0 * (1.0 + 0.02 * (2.0 * std::f32::consts::PI * 5.0 * t).sin());
            let p = 2.0 * std::f32::consts::PI * f * t;
            0.4 * p.sin() + 0.2 * (2.0 * p).sin() + 0.1 * (3.0 * p).sin()
        })
        .collect();
    AudioClip::new(samples, rate)
}

/// Built-in stages with a registry holding `spk_A` and `spk_B`.
pub async fn synthesizer(config: PipelineConfig) -> Synthesizer {
    let stages = Stages::builtin(&config);
    synthesizer_with(config, stages).await
}

pub async fn synthesizer_with(config: PipelineConfig, stages: Stages) -> Synthesizer {
    let synth = Synthesizer::new(config, stages, Arc::new(SpeakerRegistry::new()));
    enroll(&synth, "spk_A", 140.0).await;
    enroll(&synth, "spk_B", 220.0).await;
    synth
}

/// Register a profile directly through the builtin embedder so that
/// counted stages in a test start from zero.
async fn enroll(synth: &Synthesizer, id: &str, f0: f32) {
    let config = synth.config().clone();
    let clip = voice_clip(f0, 2.0).prepare_prompt(&config).unwrap();
    let features = speech_core::builtin::SpectralEmbedder::new(&config).embed(&clip).unwrap();
    synth
        .registry()
        .register(
            speech_core::SpeakerProfile {
                id: id.to_string(),
                embedding: features.embedding,
                prompt_tokens: features.prompt_tokens,
                prompt_text: Some("a short reference sentence".into()),
            },
            false,
        )
        .unwrap();
}

/// Stage wrapper that counts invocations.
pub struct Counted<T> {
    pub inner: T,
    pub calls: Arc<AtomicUsize>,
}

impl<T> Counted<T> {
    pub fn new(inner: T, calls: Arc<AtomicUsize>) -> Self {
        Self { inner, calls }
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T: Tokenizer> Tokenizer for Counted<T> {
    fn encode(&self, text: &str, language: Language) -> speech_core::Result<Vec<u32>> {
        self.hit();
        self.inner.encode(text, language)
    }

    fn language_token(&self, language: Language) -> u32 {
        self.inner.language_token(language)
    }

    fn end_of_instruction(&self) -> u32 {
        self.inner.end_of_instruction()
    }

    fn vocab_size(&self) -> u32 {
        self.inner.vocab_size()
    }
}

impl<T: SpeakerEmbedder> SpeakerEmbedder for Counted<T> {
    fn embed(&self, clip: &AudioClip) -> speech_core::Result<SpeakerFeatures> {
        self.hit();
        self.inner.embed(clip)
    }
}

impl<T: SpeechLm> SpeechLm for Counted<T> {
    fn start(&self, input: LmInput) -> speech_core::Result<Box<dyn LmSession>> {
        self.hit();
        self.inner.start(input)
    }
}

impl<T: AcousticDecoder> AcousticDecoder for Counted<T> {
    fn decode(
        &self,
        window: &TokenWindow,
        conditioning: &Conditioning,
        state: LengthState,
    ) -> speech_core::Result<(AcousticChunk, LengthState)> {
        self.hit();
        self.inner.decode(window, conditioning, state)
    }
}

impl<T: Vocoder> Vocoder for Counted<T> {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn vocode(&self, chunk: &AcousticChunk) -> speech_core::Result<WaveformChunk> {
        self.hit();
        self.inner.vocode(chunk)
    }
}

/// Builtin stages, each wrapped to bump the shared counter.
pub fn counted_stages(config: &PipelineConfig, calls: Arc<AtomicUsize>) -> Stages {
    use speech_core::builtin::*;
    Stages {
        tokenizer: Arc::new(Counted::new(CharTokenizer::default(), calls.clone())),
        embedder: Arc::new(Counted::new(SpectralEmbedder::new(config), calls.clone())),
        lm: Arc::new(Counted::new(PatternLm::new(config.speech_vocab_size), calls.clone())),
        decoder: Arc::new(Counted::new(FlowDecoder::new(config), calls.clone())),
        vocoder: Arc::new(Counted::new(HarmonicVocoder::new(config), calls)),
    }
}

/// Emits exactly `total` tokens regardless of the text, counting every
/// token pulled.
pub struct FixedCountLm {
    pub total: usize,
    pub pulled: Arc<AtomicUsize>,
}

struct FixedCountSession {
    next: usize,
    total: usize,
    pulled: Arc<AtomicUsize>,
}

impl SpeechLm for FixedCountLm {
    fn start(&self, _input: LmInput) -> speech_core::Result<Box<dyn LmSession>> {
        Ok(Box::new(FixedCountSession {
            next: 0,
            total: self.total,
            pulled: self.pulled.clone(),
        }))
    }
}

impl LmSession for FixedCountSession {
    fn next_token(&mut self) -> speech_core::Result<Option<u32>> {
        if self.next >= self.total {
            return Ok(None);
        }
        self.next += 1;
        self.pulled.fetch_add(1, Ordering::SeqCst);
        Ok(Some((self.next * 37 % 4096) as u32))
    }
}

/// Fails on the first token.
pub struct FailingLm;

struct FailingSession;

impl SpeechLm for FailingLm {
    fn start(&self, _input: LmInput) -> speech_core::Result<Box<dyn LmSession>> {
        Ok(Box::new(FailingSession))
    }
}

impl LmSession for FailingSession {
    fn next_token(&mut self) -> speech_core::Result<Option<u32>> {
        Err(SynthesisError::Generation("sampler diverged".into()))
    }
}

/// Decoder that blocks for `delay` before every window.
pub struct SlowDecoder {
    pub inner: FlowDecoder,
    pub delay: Duration,
}

impl AcousticDecoder for SlowDecoder {
    fn decode(
        &self,
        window: &TokenWindow,
        conditioning: &Conditioning,
        state: LengthState,
    ) -> speech_core::Result<(AcousticChunk, LengthState)> {
        std::thread::sleep(self.delay);
        self.inner.decode(window, conditioning, state)
    }
}

/// Wait until every worker slot is free again.
pub async fn wait_for_idle(synth: &Synthesizer) {
    let total = synth.config().max_concurrent_requests;
    for _ in 0..200 {
        if synth.available_slots() == total {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker slots not released: {} of {total} free", synth.available_slots());
}
