//! WebSocket streaming synthesis.
//!
//! The client sends one `/tts`-shaped JSON message. The server answers with
//! `status`, `metadata` and `chunk` messages as audio is produced, then a
//! final `metadata` and `status: complete`. Closing the socket cancels the
//! request.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::SinkExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::{prepare_request, AppState, TtsRequest};

pub async fn tts_stream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn send_error(socket: &mut WebSocket, err: ApiError) {
    let body = err.body();
    let _ = send_json(socket, json!({ "type": "error", "error": body.error, "code": body.code })).await;
    let _ = socket.close().await;
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let req: TtsRequest = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
            Ok(req) => req,
            Err(e) => {
                send_error(&mut socket, ApiError::InvalidInput(format!("Invalid request: {e}"))).await;
                return;
            }
        },
        Some(Ok(_)) => {
            send_error(&mut socket, ApiError::InvalidInput("Expected a JSON text message".into())).await;
            return;
        }
        _ => return,
    };

    let started = Instant::now();
    let (request, prompt_text) = match prepare_request(&state, req).await {
        Ok(r) => r,
        Err(e) => {
            send_error(&mut socket, e).await;
            return;
        }
    };

    let _ = send_json(
        &mut socket,
        json!({ "type": "status", "status": "synthesizing", "message": "Generating audio..." }),
    )
    .await;

    let mut stream = match state.synth.synthesize_stream(request).await {
        Ok(s) => s,
        Err(e) => {
            state.metrics.synthesis.record_failure();
            send_error(&mut socket, e.into()).await;
            return;
        }
    };

    let sample_rate = stream.sample_rate();
    let _ = send_json(
        &mut socket,
        json!({ "type": "metadata", "sample_rate": sample_rate, "prompt_text": prompt_text }),
    )
    .await;
    let _ = send_json(
        &mut socket,
        json!({ "type": "status", "status": "streaming", "message": "Streaming audio chunks..." }),
    )
    .await;

    let mut offset = 0usize;
    let mut chunks = 0usize;
    loop {
        tokio::select! {
            item = stream.next_chunk() => match item {
                Some(Ok(chunk)) => {
                    let len = chunk.samples.len();
                    let msg = json!({
                        "type": "chunk",
                        "chunk": chunk.index,
                        "audio": chunk.samples,
                        "offset": offset,
                        "timestamp": offset as f32 / sample_rate as f32,
                        "duration": len as f32 / sample_rate as f32,
                    });
                    if !send_json(&mut socket, msg).await {
                        warn!(chunks, "failed to send WS message, cancelling synthesis");
                        stream.cancel();
                        return;
                    }
                    offset += len;
                    chunks += 1;
                }
                Some(Err(e)) => {
                    state.metrics.synthesis.record_failure();
                    send_error(&mut socket, e.into()).await;
                    return;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!(chunks, "client disconnected, cancelling synthesis");
                    stream.cancel();
                    return;
                }
                Some(Ok(_)) => debug!("ignoring client message during streaming"),
            },
        }
    }

    let duration_ms = (offset as u64 * 1000) / sample_rate.max(1) as u64;
    state
        .metrics
        .synthesis
        .record(started.elapsed().as_millis() as u64, duration_ms, true);

    let _ = send_json(
        &mut socket,
        json!({
            "type": "metadata",
            "sample_rate": sample_rate,
            "total_chunks": chunks,
            "total_samples": offset,
            "duration_ms": duration_ms,
        }),
    )
    .await;
    let _ = send_json(&mut socket, json!({ "type": "status", "status": "complete" })).await;
    let _ = socket.close().await;
}
