//! Common utilities for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use speech_core::{
    AudioClip, PipelineConfig, SpeakerRegistry, Stages, Synthesizer, Transcriber, WaveformClip,
};
use tower::ServiceExt;

use speech_server::config::ServerConfig;
use speech_server::{build_app, AppState};

/// Base64 WAV of a voiced 16 kHz clip.
pub fn voice_wav_base64(f0: f32, secs: f32) -> String {
    let rate = 16_000u32;
    let n = (secs * rate as f32) as usize;
    let samples = (0..n)
        .map(|i| {
            let p = 2.0 * std::f32::consts::PI * f0 * i as f32 / rate as f32;
            0.4 * p.sin() + 0.2 * (2.0 * p).sin()
        })
        .collect();
    WaveformClip { samples, sample_rate: rate }.encode_wav_base64().unwrap()
}

pub struct FixedTranscriber;

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _clip: &AudioClip) -> speech_core::Result<String> {
        Ok("hello from the reference clip".into())
    }
}

/// Synthesizer with `spk_A` enrolled.
pub async fn test_synth(registry: SpeakerRegistry) -> Synthesizer {
    let config = PipelineConfig::default();
    let stages = Stages::builtin(&config);
    let synth = Synthesizer::new(config, stages, Arc::new(registry));
    let clip = AudioClip::from_wav_base64(&voice_wav_base64(140.0, 2.0)).unwrap();
    synth
        .enroll_speaker("spk_A", clip, Some("reference sentence".into()), false)
        .await
        .unwrap();
    synth
}

/// Create a test app instance
pub async fn create_test_app() -> Router {
    app_for(test_synth(SpeakerRegistry::new()).await)
}

pub async fn create_test_app_with_transcriber() -> Router {
    app_for(
        test_synth(SpeakerRegistry::new())
            .await
            .with_transcriber(Arc::new(FixedTranscriber)),
    )
}

pub fn app_for(synth: Synthesizer) -> Router {
    let config = ServerConfig::default();
    build_app(AppState::new(synth, config.clone()), &config).unwrap()
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

pub const BOUNDARY: &str = "speech-test-boundary";

/// `multipart/form-data` body. Fields given as `(name, Some(filename), bytes)`
/// are sent as file parts.
pub fn multipart_body(fields: &[(&str, Option<&str>, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, data) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(file) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file}\"\r\nContent-Type: audio/wav\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes()),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_multipart(app: &Router, uri: &str, body: Vec<u8>) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
}
