// Request and synthesis metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Latency samples kept for percentile estimates.
const LATENCY_WINDOW: usize = 1000;

/// Per-endpoint request counters and latency distribution.
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    requests: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    total_latency_ms: Arc<AtomicU64>,
    max_latency_ms: Arc<AtomicU64>,
    recent: Arc<Mutex<VecDeque<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW))),
        }
    }

    /// Record one finished request, successful or not.
    pub fn observe(&self, latency_ms: u64, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == LATENCY_WINDOW {
                recent.pop_front();
            }
            recent.push_back(latency_ms);
        }
    }

    pub fn snapshot(&self) -> EndpointStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let mut sorted: Vec<u64> = self
            .recent
            .lock()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();
        let pick = |p: usize| -> u64 {
            if sorted.is_empty() {
                0
            } else {
                sorted[(sorted.len() * p / 100).min(sorted.len() - 1)]
            }
        };

        EndpointStats {
            request_count: requests,
            error_count: self.errors.load(Ordering::Relaxed),
            avg_latency_ms: if requests == 0 { 0.0 } else { total as f64 / requests as f64 },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: pick(50),
            p95_latency_ms: pick(95),
            p99_latency_ms: pick(99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for completed syntheses.
#[derive(Debug, Clone, Default)]
pub struct SynthesisMetrics {
    completed: Arc<AtomicU64>,
    streamed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    synthesis_time_ms: Arc<AtomicU64>,
    audio_ms: Arc<AtomicU64>,
}

impl SynthesisMetrics {
    pub fn record(&self, elapsed_ms: u64, audio_ms: u64, streamed: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if streamed {
            self.streamed.fetch_add(1, Ordering::Relaxed);
        }
        self.synthesis_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.audio_ms.fetch_add(audio_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SynthesisStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let time = self.synthesis_time_ms.load(Ordering::Relaxed);
        let audio = self.audio_ms.load(Ordering::Relaxed);
        SynthesisStats {
            completed,
            streamed: self.streamed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_synthesis_time_ms: if completed == 0 { 0.0 } else { time as f64 / completed as f64 },
            audio_seconds: audio as f64 / 1000.0,
            // below 1.0 means faster than real time
            real_time_factor: if audio == 0 { 0.0 } else { time as f64 / audio as f64 },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub tts: EndpointMetrics,
    pub speakers: EndpointMetrics,
    pub transcribe: EndpointMetrics,
    pub synthesis: SynthesisMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub synthesis: SynthesisStats,
    pub pipeline: PipelineStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub tts: EndpointStats,
    pub speakers: EndpointStats,
    pub transcribe: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SynthesisStats {
    pub completed: u64,
    pub streamed: u64,
    pub failed: u64,
    pub avg_synthesis_time_ms: f64,
    pub audio_seconds: f64,
    pub real_time_factor: f64,
}

#[derive(Serialize)]
pub struct PipelineStats {
    pub available_slots: usize,
    pub max_concurrent_requests: usize,
    pub speakers: usize,
    pub embedding_cache_hits: u64,
    pub embedding_cache_misses: u64,
    pub embedding_cache_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_percentiles() {
        let m = EndpointMetrics::new();
        for ms in 1..=100 {
            m.observe(ms, ms % 10 != 0);
        }
        let s = m.snapshot();
        assert_eq!(s.request_count, 100);
        assert_eq!(s.error_count, 10);
        assert_eq!(s.max_latency_ms, 100);
        assert_eq!(s.p50_latency_ms, 51);
        assert_eq!(s.p99_latency_ms, 100);
        assert!((s.avg_latency_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn latency_window_is_bounded() {
        let m = EndpointMetrics::new();
        for _ in 0..LATENCY_WINDOW {
            m.observe(1000, true);
        }
        for _ in 0..LATENCY_WINDOW {
            m.observe(1, true);
        }
        let s = m.snapshot();
        assert_eq!(s.p99_latency_ms, 1);
        assert_eq!(s.max_latency_ms, 1000);
    }

    #[test]
    fn real_time_factor() {
        let m = SynthesisMetrics::default();
        m.record(500, 2000, false);
        m.record(500, 2000, true);
        let s = m.snapshot();
        assert_eq!(s.completed, 2);
        assert_eq!(s.streamed, 1);
        assert!((s.real_time_factor - 0.25).abs() < 1e-9);
        assert!((s.audio_seconds - 4.0).abs() < 1e-9);
    }
}
