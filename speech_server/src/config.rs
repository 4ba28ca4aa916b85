// Configuration for the HTTP host

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use speech_core::PipelineConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub body_limit_bytes: usize,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// JSON file backing the speaker registry. In-memory only when unset.
    pub registry_path: Option<PathBuf>,
    /// JSON pipeline config. `SPEECH_*` variables are used when unset.
    pub pipeline_config_path: Option<PathBuf>,
    pub vocab_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 120,
            body_limit_bytes: 16 * 1024 * 1024,
            cors_allowed_origins: None,
            registry_path: None,
            pipeline_config_path: None,
            vocab_path: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

        Self {
            port: env_parse("PORT", d.port),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", d.rate_limit_per_minute),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", d.request_timeout_secs),
            body_limit_bytes: env_parse("BODY_LIMIT_BYTES", d.body_limit_bytes),
            cors_allowed_origins,
            registry_path: env_path("SPEAKER_REGISTRY_PATH"),
            pipeline_config_path: env_path("PIPELINE_CONFIG_PATH"),
            vocab_path: env_path("TOKENIZER_VOCAB_PATH"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Load and check the pipeline settings.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let config = match &self.pipeline_config_path {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::from_env(),
        };
        config.validate().context("invalid pipeline configuration")?;
        Ok(config)
    }
}
