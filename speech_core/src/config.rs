// Pipeline configuration: defaults, environment overrides and JSON files.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunables for the whole pipeline. Every field has a default so a partial
/// JSON file is enough to override a handful of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output sample rate of the vocoder.
    pub sample_rate: u32,
    /// Rate reference clips are resampled to before embedding.
    pub prompt_sample_rate: u32,
    /// Shortest accepted reference clip, in seconds.
    pub min_prompt_secs: f32,
    /// Longest accepted reference clip, in seconds.
    pub max_prompt_secs: f32,

    /// Absolute cap on request text, in characters.
    pub max_text_chars: usize,
    /// Budget of a single text unit, in characters.
    pub max_unit_chars: usize,
    /// Trailing units shorter than this are merged into their predecessor.
    pub min_unit_chars: usize,

    /// Tokens in the first decoder window.
    pub window_tokens: usize,
    /// Tokens added to each following window.
    pub window_growth: usize,
    pub max_window_tokens: usize,
    /// Tokens of right context the decoder sees beyond a window.
    pub lookahead_tokens: usize,
    /// Upper bound on generated speech tokens per text token.
    pub max_token_text_ratio: f32,
    /// Lower bound on generated speech tokens per text token.
    pub min_token_text_ratio: f32,
    pub speech_vocab_size: u32,

    /// Acoustic frames per speech token at speed 1.0.
    pub frames_per_token: f32,
    /// Waveform samples per acoustic frame.
    pub samples_per_frame: usize,
    pub n_mels: usize,

    /// Samples blended across each chunk boundary.
    pub crossfade_samples: usize,

    /// Budget for any single stage invocation.
    pub stage_timeout_ms: u64,
    pub max_concurrent_requests: usize,
    /// Chunks buffered between the producer task and a streaming consumer.
    pub channel_capacity: usize,
    pub embedding_cache_size: usize,

    /// Default seed when a request does not supply one.
    pub seed: u64,
    pub default_speed: f32,

    /// Reference clip post-processing.
    pub trim_top_db: f32,
    pub prompt_max_val: f32,
    pub prompt_tail_secs: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            prompt_sample_rate: 16_000,
            min_prompt_secs: 0.5,
            max_prompt_secs: 30.0,
            max_text_chars: 5000,
            max_unit_chars: 80,
            min_unit_chars: 6,
            window_tokens: 25,
            window_growth: 25,
            max_window_tokens: 100,
            lookahead_tokens: 3,
            max_token_text_ratio: 20.0,
            min_token_text_ratio: 2.0,
            speech_vocab_size: 4096,
            frames_per_token: 2.0,
            samples_per_frame: 480,
            n_mels: 80,
            crossfade_samples: 240,
            stage_timeout_ms: 30_000,
            max_concurrent_requests: 4,
            channel_capacity: 4,
            embedding_cache_size: 64,
            seed: 42,
            default_speed: 1.0,
            trim_top_db: 60.0,
            prompt_max_val: 0.8,
            prompt_tail_secs: 0.2,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Start from defaults and apply any `SPEECH_*` environment overrides.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sample_rate: env_or("SPEECH_SAMPLE_RATE", d.sample_rate),
            max_text_chars: env_or("SPEECH_MAX_TEXT_CHARS", d.max_text_chars),
            max_unit_chars: env_or("SPEECH_MAX_UNIT_CHARS", d.max_unit_chars),
            window_tokens: env_or("SPEECH_WINDOW_TOKENS", d.window_tokens),
            window_growth: env_or("SPEECH_WINDOW_GROWTH", d.window_growth),
            max_window_tokens: env_or("SPEECH_MAX_WINDOW_TOKENS", d.max_window_tokens),
            lookahead_tokens: env_or("SPEECH_LOOKAHEAD_TOKENS", d.lookahead_tokens),
            crossfade_samples: env_or("SPEECH_CROSSFADE_SAMPLES", d.crossfade_samples),
            stage_timeout_ms: env_or("SPEECH_STAGE_TIMEOUT_MS", d.stage_timeout_ms),
            max_concurrent_requests: env_or("SPEECH_MAX_CONCURRENT", d.max_concurrent_requests),
            channel_capacity: env_or("SPEECH_CHANNEL_CAPACITY", d.channel_capacity),
            embedding_cache_size: env_or("SPEECH_EMBEDDING_CACHE", d.embedding_cache_size),
            seed: env_or("SPEECH_SEED", d.seed),
            ..d
        }
    }

    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to read {}", p.as_ref().display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid pipeline config", p.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sample_rate == 0 || self.prompt_sample_rate == 0 {
            anyhow::bail!("sample rates must be positive");
        }
        if self.window_tokens == 0 {
            anyhow::bail!("window_tokens must be at least 1");
        }
        if self.max_window_tokens < self.window_tokens {
            anyhow::bail!("max_window_tokens must not be smaller than window_tokens");
        }
        if self.max_unit_chars == 0 || self.max_text_chars == 0 {
            anyhow::bail!("text budgets must be positive");
        }
        if self.max_concurrent_requests == 0 || self.channel_capacity == 0 {
            anyhow::bail!("max_concurrent_requests and channel_capacity must be positive");
        }
        if !(self.frames_per_token > 0.0) || self.samples_per_frame == 0 || self.n_mels == 0 {
            anyhow::bail!("frame geometry must be positive");
        }
        if self.min_token_text_ratio > self.max_token_text_ratio {
            anyhow::bail!("min_token_text_ratio exceeds max_token_text_ratio");
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}
