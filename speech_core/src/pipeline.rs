//! Public entry point: validates a request, resolves its speaker and drives
//! generation, decoding, vocoding and assembly.
//!
//! Batch and streaming output share one producer, so the concatenated
//! stream is bit-identical to the batch clip for the same input and seed.
//! Every stage runs on the blocking pool under the configured timeout; a
//! semaphore bounds how many requests are in flight.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_core::Stream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::assembler::{AssemblyMode, StreamingAssembler};
use crate::audio::{AudioClip, WaveformChunk, WaveformClip};
use crate::builtin::{CharTokenizer, FlowDecoder, HarmonicVocoder, PatternLm, SpectralEmbedder};
use crate::cache::{CacheStats, EmbeddingCache};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, Stage, SynthesisError};
use crate::generator::{TokenGenerator, TokenWindow, WindowPolicy};
use crate::registry::{SpeakerProfile, SpeakerRegistry};
use crate::request::{ModeKind, ReferenceClip, SynthesisMode, SynthesisRequest};
use crate::stages::{
    AcousticDecoder, Conditioning, LengthState, LmInput, SpeakerEmbedder, SpeakerFeatures, SpeechLm, Tokenizer,
    Transcriber, Vocoder,
};
use crate::text::{self, Language};

/// The model stages a [`Synthesizer`] drives.
#[derive(Clone)]
pub struct Stages {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub embedder: Arc<dyn SpeakerEmbedder>,
    pub lm: Arc<dyn SpeechLm>,
    pub decoder: Arc<dyn AcousticDecoder>,
    pub vocoder: Arc<dyn Vocoder>,
}

impl Stages {
    /// The deterministic built-in stages.
    pub fn builtin(config: &PipelineConfig) -> Self {
        Self {
            tokenizer: Arc::new(CharTokenizer::default()),
            embedder: Arc::new(SpectralEmbedder::new(config)),
            lm: Arc::new(PatternLm::new(config.speech_vocab_size)),
            decoder: Arc::new(FlowDecoder::new(config)),
            vocoder: Arc::new(HarmonicVocoder::new(config)),
        }
    }
}

/// Output of [`Synthesizer::synthesize`], shaped by `request.streaming`.
pub enum Synthesis {
    Clip(WaveformClip),
    Stream(SynthesisStream),
}

#[derive(Clone)]
pub struct Synthesizer {
    config: Arc<PipelineConfig>,
    stages: Stages,
    registry: Arc<SpeakerRegistry>,
    cache: Arc<EmbeddingCache>,
    permits: Arc<Semaphore>,
    transcriber: Option<Arc<dyn Transcriber>>,
}

/// Speaker conditioning after registry lookup or extraction.
struct ResolvedSpeaker {
    embedding: Vec<f32>,
    prompt_tokens: Vec<u32>,
    prompt_text: Option<String>,
}

impl Synthesizer {
    pub fn new(config: PipelineConfig, stages: Stages, registry: Arc<SpeakerRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        let cache = Arc::new(EmbeddingCache::new(config.embedding_cache_size));
        Self {
            config: Arc::new(config),
            stages,
            registry,
            cache,
            permits,
            transcriber: None,
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SpeakerRegistry> {
        &self.registry
    }

    pub fn sample_rate(&self) -> u32 {
        self.stages.vocoder.sample_rate()
    }

    /// Worker slots not currently held by a request.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn has_transcriber(&self) -> bool {
        self.transcriber.is_some()
    }

    /// Run the configured transcriber. `None` when there is none.
    pub async fn transcribe(&self, clip: &AudioClip) -> Option<Result<String>> {
        let transcriber = self.transcriber.as_ref()?;
        Some(transcriber.transcribe(clip).await)
    }

    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<Synthesis, PipelineError> {
        if request.streaming {
            self.synthesize_stream(request).await.map(Synthesis::Stream)
        } else {
            self.synthesize_clip(request).await.map(Synthesis::Clip)
        }
    }

    /// Synthesize the whole utterance and return it once complete.
    pub async fn synthesize_clip(&self, request: SynthesisRequest) -> Result<WaveformClip, PipelineError> {
        let span = info_span!("synthesize", mode = %request.mode.kind(), streaming = false);
        async move {
            let started = Instant::now();
            let _permit = self.acquire(&request).await?;
            let mut producer = self.prepare(&request, AssemblyMode::FullUtterance).await?;
            while producer.advance().await?.is_some() {}
            let clip = producer.finish()?;
            info!(
                samples = clip.samples.len(),
                duration_ms = clip.duration_ms(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "synthesis complete"
            );
            Ok(clip)
        }
        .instrument(span)
        .await
    }

    /// Start synthesis and hand back chunks as they are produced. The
    /// request keeps its worker slot until the stream ends, fails, is
    /// cancelled or is dropped.
    pub async fn synthesize_stream(&self, request: SynthesisRequest) -> Result<SynthesisStream, PipelineError> {
        let span = info_span!("synthesize", mode = %request.mode.kind(), streaming = true);
        let permit = self.acquire(&request).instrument(span.clone()).await?;
        let mut producer = self
            .prepare(&request, AssemblyMode::Streaming)
            .instrument(span.clone())
            .await?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let sample_rate = self.sample_rate();

        tokio::spawn(
            async move {
                let _permit: OwnedSemaphorePermit = permit;
                let started = Instant::now();
                let mut sent = 0usize;
                loop {
                    if flag.load(Ordering::Acquire) || tx.is_closed() {
                        debug!(chunks = sent, "stream cancelled by consumer");
                        producer.cancel();
                        break;
                    }
                    match producer.advance().await {
                        Ok(Some(Some(chunk))) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                debug!(chunks = sent, "stream receiver dropped");
                                break;
                            }
                            sent += 1;
                        }
                        Ok(Some(None)) => {}
                        Ok(None) => {
                            info!(
                                chunks = sent,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "streaming synthesis complete"
                            );
                            break;
                        }
                        Err(e) => {
                            error!("streaming synthesis failed: {e}");
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(SynthesisStream {
            rx,
            cancelled,
            closed: false,
            sample_rate,
        })
    }

    /// Extract a profile from `clip` and store it under `id`.
    pub async fn enroll_speaker(
        &self,
        id: &str,
        clip: AudioClip,
        prompt_text: Option<String>,
        overwrite: bool,
    ) -> Result<SpeakerProfile> {
        if id.trim().is_empty() {
            return Err(SynthesisError::InvalidInput("speaker id is empty".into()));
        }
        if !overwrite && self.registry.contains(id) {
            return Err(SynthesisError::AlreadyExists(id.to_string()));
        }
        let features = self.extract(clip).await?;
        let profile = SpeakerProfile {
            id: id.to_string(),
            embedding: features.embedding,
            prompt_tokens: features.prompt_tokens,
            prompt_text,
        };
        self.registry.register(profile.clone(), overwrite)?;
        info!(speaker = id, "speaker enrolled");
        Ok(profile)
    }

    async fn acquire(&self, request: &SynthesisRequest) -> Result<OwnedSemaphorePermit, PipelineError> {
        let mode = request.mode.kind();
        let invalid = |e| PipelineError::new(mode, Stage::Validate, &request.text, e);
        request.validate().map_err(invalid)?;
        let chars = request.text.chars().count();
        if chars > self.config.max_text_chars {
            return Err(invalid(SynthesisError::InvalidRequest {
                mode,
                reason: format!("text is {chars} characters, limit is {}", self.config.max_text_chars),
            }));
        }
        self.permits.clone().acquire_owned().await.map_err(|_| {
            PipelineError::new(
                mode,
                Stage::Validate,
                &request.text,
                SynthesisError::Generation("worker pool is shut down".into()),
            )
        })
    }

    /// Everything up to the first model invocation: speaker resolution,
    /// normalization, tokenization and conditioning.
    async fn prepare(&self, request: &SynthesisRequest, mode: AssemblyMode) -> Result<ChunkProducer, PipelineError> {
        let kind = request.mode.kind();
        let source = request.text.as_str();
        let fail = move |stage: Stage| move |e: SynthesisError| PipelineError::new(kind, stage, source, e);

        let units = text::normalize(&request.text, request.language, &self.config).map_err(fail(Stage::Normalize))?;
        let speaker = self.resolve_speaker(&request.mode).await.map_err(fail(Stage::ResolveSpeaker))?;

        let tokenizer = self.stages.tokenizer.clone();
        let language = request.language;
        let texts: Vec<String> = units.iter().map(|u| u.text.clone()).collect();
        let mut token_units = self
            .run_stage(Stage::Tokenize, move || {
                texts.iter().map(|t| tokenizer.encode(t, language)).collect::<Result<Vec<_>>>()
            })
            .await
            .map_err(fail(Stage::Tokenize))?;
        token_units.retain(|t| !t.is_empty());
        if token_units.is_empty() {
            return Err(fail(Stage::Tokenize)(SynthesisError::InvalidInput(
                "text produced no tokens".into(),
            )));
        }

        let conditioning = self
            .conditioning(request, speaker)
            .await
            .map_err(fail(Stage::Tokenize))?;

        if kind == ModeKind::CrossLingual {
            let lang_token = self.stages.tokenizer.language_token(language);
            for unit in &mut token_units {
                unit.insert(0, lang_token);
            }
        }

        debug!(units = token_units.len(), "request prepared");
        Ok(ChunkProducer {
            synth: self.clone(),
            mode: kind,
            text: request.text.clone(),
            conditioning: Arc::new(conditioning),
            units: token_units.into(),
            generator: None,
            length: LengthState::default(),
            assembler: StreamingAssembler::new(mode, self.config.crossfade_samples, self.sample_rate()),
            next_index: 0,
            policy: WindowPolicy::from_config(&self.config),
        })
    }

    async fn resolve_speaker(&self, mode: &SynthesisMode) -> Result<ResolvedSpeaker> {
        if let Some(id) = mode.speaker_id() {
            let profile = self.registry.lookup(id)?;
            debug!(speaker = id, "speaker resolved from registry");
            return Ok(ResolvedSpeaker {
                embedding: profile.embedding,
                prompt_tokens: profile.prompt_tokens,
                prompt_text: profile.prompt_text,
            });
        }
        let Some(reference) = mode.reference() else {
            return Err(SynthesisError::InvalidRequest {
                mode: mode.kind(),
                reason: "no speaker given".into(),
            });
        };
        self.resolve_reference(mode.kind(), reference).await
    }

    async fn resolve_reference(&self, kind: ModeKind, reference: &ReferenceClip) -> Result<ResolvedSpeaker> {
        if let Some(enrollment) = &reference.register_as {
            if !enrollment.overwrite && self.registry.contains(&enrollment.id) {
                return Err(SynthesisError::AlreadyExists(enrollment.id.clone()));
            }
        }

        let features = self.extract(reference.audio.clone()).await?;

        let mut prompt_text = reference.prompt_text.clone().filter(|t| !t.trim().is_empty());
        if prompt_text.is_none() && kind == ModeKind::ZeroShot {
            prompt_text = self.transcribe_best_effort(&reference.audio).await;
        }

        if let Some(enrollment) = &reference.register_as {
            let profile = SpeakerProfile {
                id: enrollment.id.clone(),
                embedding: features.embedding.clone(),
                prompt_tokens: features.prompt_tokens.clone(),
                prompt_text: prompt_text.clone(),
            };
            self.registry.register(profile, enrollment.overwrite)?;
            info!(speaker = %enrollment.id, "reference speaker registered");
        }

        Ok(ResolvedSpeaker {
            embedding: features.embedding,
            prompt_tokens: features.prompt_tokens,
            prompt_text,
        })
    }

    /// Prepare a reference clip and run the embedder, going through the
    /// content-keyed cache.
    async fn extract(&self, clip: AudioClip) -> Result<SpeakerFeatures> {
        let config = self.config.clone();
        let prepared = self
            .run_stage(Stage::Embed, move || clip.prepare_prompt(&config))
            .await?;

        let key = EmbeddingCache::key(&prepared);
        if let Some(features) = self.cache.get(key) {
            debug!("speaker features served from cache");
            return Ok(features);
        }

        let embedder = self.stages.embedder.clone();
        let features = self.run_stage(Stage::Embed, move || embedder.embed(&prepared)).await?;
        self.cache.insert(key, features.clone());
        Ok(features)
    }

    async fn transcribe_best_effort(&self, clip: &AudioClip) -> Option<String> {
        match self.transcribe(clip).await {
            Some(Ok(text)) if !text.trim().is_empty() => {
                debug!(chars = text.chars().count(), "prompt transcript filled in");
                Some(text)
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                warn!("prompt transcription failed, continuing without prompt text: {e}");
                None
            }
            None => None,
        }
    }

    /// Mode-specific conditioning for the language model and decoder.
    async fn conditioning(&self, request: &SynthesisRequest, speaker: ResolvedSpeaker) -> Result<Conditioning> {
        let tokenizer = self.stages.tokenizer.clone();
        let language = request.language;
        let seed = request.options.seed.unwrap_or(self.config.seed);
        let speed = request.options.speed.unwrap_or(self.config.default_speed);
        let base = Conditioning {
            embedding: speaker.embedding,
            seed,
            speed,
            ..Default::default()
        };

        let cond = match &request.mode {
            SynthesisMode::FixedSpeaker { .. } => base,
            SynthesisMode::ZeroShot { .. } => match speaker.prompt_text {
                Some(prompt_text) => {
                    let prompt_text_tokens = self
                        .run_stage(Stage::Tokenize, move || tokenizer.encode(&prompt_text, language))
                        .await?;
                    Conditioning {
                        prompt_text_tokens,
                        lm_prompt_tokens: speaker.prompt_tokens.clone(),
                        flow_prompt_tokens: speaker.prompt_tokens,
                        ..base
                    }
                }
                None => {
                    // without a transcript the language model cannot continue
                    // the prompt speech; only the decoder sees it
                    warn!("zero-shot request without prompt text, conditioning the decoder only");
                    Conditioning {
                        flow_prompt_tokens: speaker.prompt_tokens,
                        ..base
                    }
                }
            },
            SynthesisMode::CrossLingual { .. } => Conditioning {
                flow_prompt_tokens: speaker.prompt_tokens,
                ..base
            },
            SynthesisMode::Instruct { instruction, .. } => {
                let instruction = instruction.clone();
                let mut prompt_text_tokens = self
                    .run_stage(Stage::Tokenize, move || tokenizer.encode(&instruction, language))
                    .await?;
                prompt_text_tokens.push(self.stages.tokenizer.end_of_instruction());
                Conditioning {
                    prompt_text_tokens,
                    flow_prompt_tokens: speaker.prompt_tokens,
                    ..base
                }
            }
        };
        Ok(cond)
    }

    /// Run `f` on the blocking pool under the stage timeout.
    async fn run_stage<T, F>(&self, stage: Stage, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let budget = self.config.stage_timeout();
        match tokio::time::timeout(budget, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!(%stage, "stage task failed: {join_err}");
                let msg = format!("{stage} task failed: {join_err}");
                Err(match stage {
                    Stage::Decode | Stage::Vocode => SynthesisError::Decode(msg),
                    _ => SynthesisError::Generation(msg),
                })
            }
            Err(_) => {
                warn!(%stage, budget_ms = budget.as_millis() as u64, "stage timed out");
                Err(SynthesisError::Timeout { stage, after: budget })
            }
        }
    }
}

/// Per-request producer: one window through generate, decode, vocode and
/// assemble per call to [`ChunkProducer::advance`].
struct ChunkProducer {
    synth: Synthesizer,
    mode: ModeKind,
    text: String,
    conditioning: Arc<Conditioning>,
    units: VecDeque<Vec<u32>>,
    generator: Option<TokenGenerator>,
    length: LengthState,
    assembler: StreamingAssembler,
    next_index: usize,
    policy: WindowPolicy,
}

impl ChunkProducer {
    fn error(&self, stage: Stage, source: SynthesisError) -> PipelineError {
        PipelineError::new(self.mode, stage, &self.text, source)
    }

    fn start_unit(&mut self) -> Option<TokenGenerator> {
        let text_tokens = self.units.pop_front()?;
        let config = &self.synth.config;
        let n = text_tokens.len() as f32;
        let input = LmInput {
            min_tokens: (n * config.min_token_text_ratio) as usize,
            max_tokens: ((n * config.max_token_text_ratio) as usize).max(1),
            text_tokens,
            conditioning: self.conditioning.clone(),
        };
        Some(TokenGenerator::new(self.synth.stages.lm.clone(), input, self.policy))
    }

    /// Process the next window. `Ok(None)` once the request is complete;
    /// otherwise the assembler's output for this window, which is `None`
    /// in full-utterance mode.
    async fn advance(&mut self) -> Result<Option<Option<WaveformChunk>>, PipelineError> {
        let window = loop {
            let mut generator = match self.generator.take() {
                Some(g) => g,
                None => match self.start_unit() {
                    Some(g) => g,
                    None => return Ok(None),
                },
            };
            let (generator, window) = self
                .synth
                .run_stage(Stage::Generate, move || {
                    let window = generator.next_window();
                    Ok((generator, window))
                })
                .await
                .map_err(|e| self.error(Stage::Generate, e))?;
            match window.map_err(|e| self.error(Stage::Generate, e))? {
                Some(w) => {
                    if !w.last {
                        self.generator = Some(generator);
                    }
                    break w;
                }
                None => continue,
            }
        };

        let final_window = window.last && self.units.is_empty();
        let chunk = self.render(window).await?;
        self.assembler
            .push(chunk, final_window)
            .map_err(|e| self.error(Stage::Assemble, e))
            .map(Some)
    }

    async fn render(&mut self, window: TokenWindow) -> Result<WaveformChunk, PipelineError> {
        let decoder = self.synth.stages.decoder.clone();
        let conditioning = self.conditioning.clone();
        let state = self.length;
        let (mut acoustic, next) = self
            .synth
            .run_stage(Stage::Decode, move || decoder.decode(&window, &conditioning, state))
            .await
            .map_err(|e| self.error(Stage::Decode, e))?;
        self.length = next;
        acoustic.index = self.next_index;
        self.next_index += 1;

        let vocoder = self.synth.stages.vocoder.clone();
        let chunk = self
            .synth
            .run_stage(Stage::Vocode, move || vocoder.vocode(&acoustic))
            .await
            .map_err(|e| self.error(Stage::Vocode, e))?;
        debug!(chunk = chunk.index, samples = chunk.samples.len(), "chunk vocoded");
        Ok(chunk)
    }

    fn cancel(&mut self) {
        if let Some(g) = self.generator.as_mut() {
            g.cancel();
        }
        self.generator = None;
        self.units.clear();
    }

    fn finish(self) -> Result<WaveformClip, PipelineError> {
        let mode = self.mode;
        let text = self.text;
        self.assembler
            .finish()
            .map_err(|e| PipelineError::new(mode, Stage::Assemble, &text, e))
    }
}

/// Chunks of a streaming synthesis, in order. Dropping the stream cancels
/// the request.
pub struct SynthesisStream {
    rx: mpsc::Receiver<Result<WaveformChunk, PipelineError>>,
    cancelled: Arc<AtomicBool>,
    closed: bool,
    sample_rate: u32,
}

impl SynthesisStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stop the request. Chunks already received stay valid; no further
    /// chunk is delivered.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.closed = true;
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn next_chunk(&mut self) -> Option<Result<WaveformChunk, PipelineError>> {
        if self.closed {
            return None;
        }
        let item = self.rx.recv().await;
        if item.is_none() {
            self.closed = true;
        }
        item
    }

    /// Drain the stream into one clip.
    pub async fn collect_clip(mut self) -> Result<WaveformClip, PipelineError> {
        let mut samples = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            samples.extend_from_slice(&chunk?.samples);
        }
        Ok(WaveformClip {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

impl Stream for SynthesisStream {
    type Item = Result<WaveformChunk, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.closed = true;
        }
        polled
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Synthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synthesizer")
            .field("sample_rate", &self.sample_rate())
            .field("available_slots", &self.available_slots())
            .field("speakers", &self.registry.len())
            .field("transcriber", &self.transcriber.is_some())
            .finish()
    }
}

/// Parse a host-supplied language tag.
pub fn parse_language(tag: Option<&str>) -> Result<Language> {
    match tag {
        Some(t) => t.parse(),
        None => Ok(Language::En),
    }
}
