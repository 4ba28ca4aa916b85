pub mod config;
pub mod error;
pub mod metrics;
pub mod stream;
pub mod validation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use speech_core::request::SpeakerRef;
use speech_core::{
    parse_language, AudioClip, ModeKind, Synthesis, SynthesisMode, SynthesisRequest, Synthesizer, WaveformClip,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, map_response_body::MapResponseBodyLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::{AppMetrics, DetailedMetricsResponse, EndpointMetricsResponse, PipelineStats, SystemMetrics};
use crate::validation::{validate_seed, validate_speaker_id, validate_speed, validate_tts_request};

static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub synth: Synthesizer,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(synth: Synthesizer, config: ServerConfig) -> Self {
        let _ = START_TIME.get_or_init(Instant::now);
        Self {
            synth,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub language: Option<String>,
    /// `fixed_speaker` (or `sft`), `zero_shot`, `cross_lingual`, `instruct`.
    pub mode: Option<String>,
    pub speaker_id: Option<String>,
    pub prompt_audio_base64: Option<String>,
    pub prompt_text: Option<String>,
    pub instruction: Option<String>,
    pub seed: Option<u64>,
    pub speed: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TtsResponse {
    pub audio_base64: String,
    pub sample_rate: u32,
    pub duration_ms: u64,
    /// Transcript the reference clip was conditioned on, when one was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub id: String,
    pub prompt_audio_base64: String,
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeakerSummary {
    pub id: String,
    pub embedding_dim: usize,
    pub prompt_tokens: usize,
    pub prompt_text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    pub audio_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscribeResponse {
    pub transcribed_text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sample_rate: u32,
    pub speakers: usize,
    pub transcriber: bool,
    pub available_slots: usize,
}

/// Routes without the outer middleware stack, under `/` and `/api`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/speakers", get(list_speakers).post(enroll_speaker))
        .route("/tts", post(tts_endpoint))
        .route("/tts/zero_shot_file", post(zero_shot_file_endpoint))
        .route("/tts/stream", get(stream::tts_stream_ws))
        .route("/transcribe", post(transcribe_endpoint));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .with_state(state)
}

/// Full application: routes plus tracing, rate limiting, timeout, body
/// limit and CORS.
pub fn build_app(state: AppState, config: &ServerConfig) -> anyhow::Result<Router> {
    // one token every `interval` ms, bursting up to the per-minute budget
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / per_minute as u64).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(MapResponseBodyLayer::new(axum::body::Body::new))
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(cors_layer(config))
        .into_inner();

    Ok(router(state)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware_stack))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert("x-request-id", value);
        return response;
    }
    next.run(request).await
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        sample_rate: state.synth.sample_rate(),
        speakers: state.synth.registry().len(),
        transcriber: state.synth.has_transcriber(),
        available_slots: state.synth.available_slots(),
    })
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|l| l.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    let cache = state.synth.cache_stats();
    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0),
            system_load,
        },
        endpoints: EndpointMetricsResponse {
            tts: state.metrics.tts.snapshot(),
            speakers: state.metrics.speakers.snapshot(),
            transcribe: state.metrics.transcribe.snapshot(),
        },
        synthesis: state.metrics.synthesis.snapshot(),
        pipeline: PipelineStats {
            available_slots: state.synth.available_slots(),
            max_concurrent_requests: state.synth.config().max_concurrent_requests,
            speakers: state.synth.registry().len(),
            embedding_cache_hits: cache.hits,
            embedding_cache_misses: cache.misses,
            embedding_cache_entries: cache.entries,
        },
    })
}

pub async fn list_speakers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.synth.registry().list())
}

pub async fn enroll_speaker(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<SpeakerSummary>), ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = enroll(&state, req).await;
    state
        .metrics
        .speakers
        .observe(started.elapsed().as_millis() as u64, result.is_ok());
    result.map(|summary| (StatusCode::CREATED, Json(summary)))
}

async fn enroll(state: &AppState, req: EnrollRequest) -> Result<SpeakerSummary, ApiError> {
    validate_speaker_id(&req.id)?;
    let clip = AudioClip::from_wav_base64(&req.prompt_audio_base64)?;
    let prompt_text = req.prompt_text.filter(|t| !t.trim().is_empty());
    let profile = state
        .synth
        .enroll_speaker(&req.id, clip, prompt_text, req.overwrite)
        .await?;

    let registry = state.synth.registry().clone();
    if registry.has_store() {
        tokio::task::spawn_blocking(move || registry.persist())
            .await
            .map_err(|e| ApiError::InternalError(format!("Task join error: {e}")))??;
    }

    info!(speaker = %profile.id, "speaker enrolled via API");
    Ok(SpeakerSummary {
        id: profile.id,
        embedding_dim: profile.embedding.len(),
        prompt_tokens: profile.prompt_tokens.len(),
        prompt_text: profile.prompt_text,
    })
}

pub async fn transcribe_endpoint(
    State(state): State<AppState>,
    Json(req): Json<TranscribeRequest>,
) -> Result<Json<TranscribeResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = async {
        if !state.synth.has_transcriber() {
            return Err(ApiError::Unavailable("no transcriber configured".into()));
        }
        let clip = AudioClip::from_wav_base64(&req.audio_base64)?;
        match state.synth.transcribe(&clip).await {
            Some(text) => Ok(TranscribeResponse { transcribed_text: text? }),
            None => Err(ApiError::Unavailable("no transcriber configured".into())),
        }
    }
    .await;
    state
        .metrics
        .transcribe
        .observe(started.elapsed().as_millis() as u64, result.is_ok());
    result.map(Json)
}

pub async fn tts_endpoint(
    State(state): State<AppState>,
    Json(req): Json<TtsRequest>,
) -> Result<Json<TtsResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = synthesize_tts(&state, req).await;
    state
        .metrics
        .tts
        .observe(started.elapsed().as_millis() as u64, result.is_ok());
    result.map(Json)
}

async fn synthesize_tts(state: &AppState, req: TtsRequest) -> Result<TtsResponse, ApiError> {
    let streaming = req.stream;
    let (request, prompt_text) = prepare_request(state, req).await?;
    let clip = render_clip(state, request, streaming).await?;

    Ok(TtsResponse {
        audio_base64: clip.encode_wav_base64()?,
        sample_rate: clip.sample_rate,
        duration_ms: clip.duration_ms(),
        prompt_text,
    })
}

/// Run a request to completion, collecting the stream when `streaming`.
async fn render_clip(state: &AppState, request: SynthesisRequest, streaming: bool) -> Result<WaveformClip, ApiError> {
    let started = Instant::now();
    let outcome = match state.synth.synthesize(request.streaming(streaming)).await {
        Ok(Synthesis::Clip(clip)) => Ok(clip),
        Ok(Synthesis::Stream(stream)) => stream.collect_clip().await,
        Err(e) => Err(e),
    };
    let clip = outcome.map_err(|e| {
        state.metrics.synthesis.record_failure();
        ApiError::from(e)
    })?;

    state
        .metrics
        .synthesis
        .record(started.elapsed().as_millis() as u64, clip.duration_ms(), streaming);
    Ok(clip)
}

/// Zero-shot cloning from an uploaded WAV. Form fields: `text`,
/// `prompt_audio` (file), optional `seed`, `stream`, `speed`. The reply is
/// the WAV itself with the prompt transcript in `x-transcribed-text`.
pub async fn zero_shot_file_endpoint(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = zero_shot_file(&state, multipart).await;
    state
        .metrics
        .tts
        .observe(started.elapsed().as_millis() as u64, result.is_ok());
    result
}

async fn zero_shot_file(state: &AppState, mut multipart: Multipart) -> Result<Response, ApiError> {
    let mut text = None;
    let mut audio = None;
    let mut seed = None;
    let mut stream = false;
    let mut speed = None;

    let bad_form =
        |e: axum::extract::multipart::MultipartError| ApiError::InvalidInput(format!("Invalid form data: {e}"));
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt_audio" => audio = Some(field.bytes().await.map_err(bad_form)?),
            "text" => text = Some(field.text().await.map_err(bad_form)?),
            "seed" => seed = Some(parse_field::<u64>(&name, &field.text().await.map_err(bad_form)?)?),
            "speed" => speed = Some(parse_field::<f32>(&name, &field.text().await.map_err(bad_form)?)?),
            "stream" => stream = parse_field::<bool>(&name, &field.text().await.map_err(bad_form)?)?,
            other => warn!("ignoring unknown form field '{other}'"),
        }
    }

    let text = text.ok_or_else(|| ApiError::InvalidInput("Missing form field 'text'".into()))?;
    let audio = audio.ok_or_else(|| ApiError::InvalidInput("Missing form field 'prompt_audio'".into()))?;
    if !state.synth.has_transcriber() {
        return Err(ApiError::Unavailable("no transcriber configured".into()));
    }

    let clip = AudioClip::from_wav_bytes(&audio)?;
    let transcript = match state.synth.transcribe(&clip).await {
        Some(Ok(t)) if !t.trim().is_empty() => t,
        Some(Err(e)) => {
            warn!("prompt transcription failed: {e}");
            return Err(ApiError::InvalidInput("Failed to transcribe prompt audio".into()));
        }
        _ => return Err(ApiError::InvalidInput("Failed to transcribe prompt audio".into())),
    };

    let req = TtsRequest {
        text,
        language: None,
        mode: Some(ModeKind::ZeroShot.as_str().to_string()),
        speaker_id: None,
        prompt_audio_base64: None,
        prompt_text: Some(transcript.clone()),
        instruction: None,
        seed,
        speed,
        stream,
    };
    let (request, _) = build_request(state, req, Some(clip)).await?;
    let wav = render_clip(state, request, stream).await?.to_wav_bytes()?;

    let mut response = (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("audio/wav")),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=generated_audio.wav"),
            ),
        ],
        wav,
    )
        .into_response();
    match HeaderValue::from_bytes(transcript.as_bytes()) {
        Ok(value) => {
            response.headers_mut().insert("x-transcribed-text", value);
        }
        Err(_) => warn!("transcript is not a valid header value, omitting x-transcribed-text"),
    }
    Ok(response)
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::InvalidInput(format!("Invalid value for form field '{name}': {value}")))
}

/// Validate a host request and turn it into a pipeline request. Returns
/// the prompt transcript in effect when a reference clip was supplied.
pub async fn prepare_request(
    state: &AppState,
    req: TtsRequest,
) -> Result<(SynthesisRequest, Option<String>), ApiError> {
    let audio = match &req.prompt_audio_base64 {
        Some(data) => Some(AudioClip::from_wav_base64(data)?),
        None => None,
    };
    build_request(state, req, audio).await
}

/// [`prepare_request`] with the reference audio already decoded.
async fn build_request(
    state: &AppState,
    req: TtsRequest,
    audio: Option<AudioClip>,
) -> Result<(SynthesisRequest, Option<String>), ApiError> {
    validate_tts_request(&req.text, req.language.as_deref())?;
    if let Some(speed) = req.speed {
        validate_speed(speed)?;
    }
    if let Some(seed) = req.seed {
        validate_seed(seed)?;
    }
    if let Some(id) = &req.speaker_id {
        validate_speaker_id(id)?;
    }

    let language = parse_language(req.language.as_deref())?;
    let kind = match req.mode.as_deref() {
        Some(m) => m.parse::<ModeKind>()?,
        None => ModeKind::FixedSpeaker,
    };

    let reference = match audio {
        Some(audio) => {
            let mut clip = speech_core::ReferenceClip::new(audio);
            if let Some(text) = req.prompt_text.as_ref().filter(|t| !t.trim().is_empty()) {
                clip = clip.with_prompt_text(text.clone());
            }
            Some(clip)
        }
        None => None,
    };

    let mut mode = SynthesisMode::from_parts(kind, req.speaker_id, reference, req.instruction)?;

    // fill in a missing transcript here so it can be echoed back
    if let SynthesisMode::ZeroShot { speaker: SpeakerRef::Reference(clip) } = &mut mode {
        if clip.prompt_text.is_none() {
            match state.synth.transcribe(&clip.audio).await {
                Some(Ok(text)) if !text.trim().is_empty() => clip.prompt_text = Some(text),
                Some(Err(e)) => warn!("prompt transcription failed: {e}"),
                _ => {}
            }
        }
    }
    let prompt_text = mode.reference().and_then(|c| c.prompt_text.clone());

    let mut request = SynthesisRequest::new(req.text, mode).language(language);
    if let Some(speed) = req.speed {
        request = request.speed(speed);
    }
    if let Some(seed) = req.seed {
        request = request.seed(seed);
    }
    Ok((request, prompt_text))
}
