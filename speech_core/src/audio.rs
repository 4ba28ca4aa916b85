//! Audio containers: reference clips going in, waveform chunks coming out.
//!
//! Reference clips arrive as WAV (optionally base64 wrapped) and are
//! conditioned before embedding: resampled to the prompt rate, trimmed of
//! leading and trailing silence, peak normalised and padded with a short
//! silent tail.

use std::io::Cursor;
use std::path::Path;

use base64::Engine;

use crate::config::PipelineConfig;
use crate::error::{Result, SynthesisError};

const TRIM_FRAME: usize = 440;
const TRIM_HOP: usize = 220;

/// Mono PCM clip with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Decode a WAV file held in memory. Multi-channel input is averaged
    /// down to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(SynthesisError::InvalidAudio("WAV header has zero rate or channels".into()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = spec.channels as usize;
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        Ok(Self::new(samples, spec.sample_rate))
    }

    pub fn from_wav_base64(data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| SynthesisError::InvalidAudio(format!("invalid base64 audio: {e}")))?;
        Self::from_wav_bytes(&bytes)
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Linear-interpolation resampling. Returns a copy when the rate
    /// already matches.
    pub fn resample(&self, target_rate: u32) -> AudioClip {
        if target_rate == self.sample_rate || self.samples.is_empty() {
            return AudioClip::new(self.samples.clone(), target_rate);
        }
        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = ((self.samples.len() as f64) / ratio).floor() as usize;
        let last = self.samples.len() - 1;
        let samples = (0..out_len)
            .map(|i| {
                let pos = i as f64 * ratio;
                let lo = (pos.floor() as usize).min(last);
                let hi = (lo + 1).min(last);
                let frac = (pos - lo as f64) as f32;
                self.samples[lo] * (1.0 - frac) + self.samples[hi] * frac
            })
            .collect();
        AudioClip::new(samples, target_rate)
    }

    /// Validate and condition a reference clip for the speaker embedder.
    pub fn prepare_prompt(&self, config: &PipelineConfig) -> Result<AudioClip> {
        if self.sample_rate < config.prompt_sample_rate {
            return Err(SynthesisError::InvalidAudio(format!(
                "sample rate {} is lower than the required {}",
                self.sample_rate, config.prompt_sample_rate
            )));
        }
        let duration = self.duration_secs();
        if duration < config.min_prompt_secs {
            return Err(SynthesisError::InvalidAudio(format!(
                "reference clip is {duration:.2}s, minimum is {:.2}s",
                config.min_prompt_secs
            )));
        }
        if duration > config.max_prompt_secs {
            return Err(SynthesisError::InvalidAudio(format!(
                "reference clip is {duration:.2}s, maximum is {:.2}s",
                config.max_prompt_secs
            )));
        }

        let resampled = self.resample(config.prompt_sample_rate);
        let mut samples = trim_silence(&resampled.samples, config.trim_top_db);
        if samples.is_empty() {
            return Err(SynthesisError::InvalidAudio("reference clip is silent".into()));
        }
        let voiced = samples.len() as f32 / config.prompt_sample_rate as f32;
        if voiced < config.min_prompt_secs {
            return Err(SynthesisError::InvalidAudio(format!(
                "reference clip has {voiced:.2}s of speech after trimming silence, minimum is {:.2}s",
                config.min_prompt_secs
            )));
        }

        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > config.prompt_max_val {
            let gain = config.prompt_max_val / peak;
            samples.iter_mut().for_each(|s| *s *= gain);
        }

        let tail = (config.prompt_tail_secs * config.prompt_sample_rate as f32) as usize;
        samples.extend(std::iter::repeat(0.0).take(tail));

        Ok(AudioClip::new(samples, config.prompt_sample_rate))
    }
}

/// Drop leading and trailing frames whose RMS is more than `top_db` below
/// the loudest frame.
fn trim_silence(samples: &[f32], top_db: f32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let rms: Vec<f32> = frame_starts(samples.len())
        .map(|start| {
            let end = (start + TRIM_FRAME).min(samples.len());
            let frame = &samples[start..end];
            (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
        })
        .collect();

    let max_rms = rms.iter().cloned().fold(0.0f32, f32::max);
    if max_rms <= 0.0 {
        return Vec::new();
    }
    let threshold = max_rms * 10f32.powf(-top_db / 20.0);

    let first = rms.iter().position(|&r| r > threshold);
    let last = rms.iter().rposition(|&r| r > threshold);
    match (first, last) {
        (Some(first), Some(last)) => {
            let start = first * TRIM_HOP;
            let end = (last * TRIM_HOP + TRIM_FRAME).min(samples.len());
            samples[start..end].to_vec()
        }
        _ => Vec::new(),
    }
}

fn frame_starts(len: usize) -> impl Iterator<Item = usize> {
    let count = if len <= TRIM_FRAME { 1 } else { 1 + (len - TRIM_FRAME).div_ceil(TRIM_HOP) };
    (0..count).map(|i| i * TRIM_HOP)
}

/// One piece of synthesized audio, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformChunk {
    pub index: usize,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A complete synthesized utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl WaveformClip {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as f64 / self.sample_rate as f64 * 1000.0) as u64
    }

    /// 16-bit PCM WAV bytes.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + self.samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(self.sample_rate))?;
            for &s in &self.samples {
                writer.write_sample(to_i16(s))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    pub fn encode_wav_base64(&self) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_wav_bytes()?))
    }

    pub fn write_wav<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = hound::WavWriter::create(path, wav_spec(self.sample_rate))?;
        for &s in &self.samples {
            writer.write_sample(to_i16(s))?;
        }
        writer.finalize()?;
        Ok(())
    }
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn to_i16(s: f32) -> i16 {
    const I16_MAX_F32: f32 = i16::MAX as f32;
    (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(secs: f32, rate: u32, amp: f32) -> AudioClip {
        let n = (secs * rate as f32) as usize;
        let samples = (0..n)
            .map(|i| amp * (i as f32 * 2.0 * std::f32::consts::PI * 220.0 / rate as f32).sin())
            .collect();
        AudioClip::new(samples, rate)
    }

    #[test]
    fn wav_round_trip_keeps_rate_and_length() {
        let clip = WaveformClip { samples: tone(0.1, 24_000, 0.5).samples, sample_rate: 24_000 };
        let b64 = clip.encode_wav_base64().unwrap();
        let back = AudioClip::from_wav_base64(&b64).unwrap();
        assert_eq!(back.sample_rate, 24_000);
        assert_eq!(back.samples.len(), clip.samples.len());
        assert!((back.samples[100] - clip.samples[100]).abs() < 1e-3);
    }

    #[test]
    fn low_sample_rate_prompt_is_rejected() {
        let cfg = PipelineConfig::default();
        let err = tone(2.0, 8_000, 0.5).prepare_prompt(&cfg).unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidAudio(_)));
    }

    #[test]
    fn short_prompt_is_rejected() {
        let cfg = PipelineConfig::default();
        let err = tone(0.1, 16_000, 0.5).prepare_prompt(&cfg).unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidAudio(_)));
    }

    #[test]
    fn mostly_silent_prompt_is_rejected_after_trimming() {
        let cfg = PipelineConfig::default();
        // one second long, but only 50 ms of it is speech
        let mut samples = vec![0.0; 16_000];
        let burst = tone(0.05, 16_000, 0.5).samples;
        samples[8_000..8_000 + burst.len()].copy_from_slice(&burst);
        let clip = AudioClip::new(samples, 16_000);
        assert!(clip.duration_secs() >= cfg.min_prompt_secs);

        let err = clip.prepare_prompt(&cfg).unwrap_err();
        assert!(matches!(&err, SynthesisError::InvalidAudio(msg) if msg.contains("after trimming")));
    }

    #[test]
    fn silent_prompt_is_rejected() {
        let cfg = PipelineConfig::default();
        let clip = AudioClip::new(vec![0.0; 32_000], 16_000);
        assert!(matches!(clip.prepare_prompt(&cfg), Err(SynthesisError::InvalidAudio(_))));
    }

    #[test]
    fn prompt_is_resampled_normalised_and_padded() {
        let cfg = PipelineConfig::default();
        let mut clip = tone(1.0, 48_000, 1.0);
        // half a second of leading silence
        let mut padded = vec![0.0; 24_000];
        padded.append(&mut clip.samples);
        let clip = AudioClip::new(padded, 48_000);

        let prepared = clip.prepare_prompt(&cfg).unwrap();
        assert_eq!(prepared.sample_rate, 16_000);
        let peak = prepared.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.8 + 1e-4);
        // silence trimmed, 0.2s tail added
        assert!(prepared.duration_secs() < 1.3);
        assert!(prepared.duration_secs() > 1.1);
        assert!(prepared.samples[prepared.samples.len() - 100..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn stereo_is_mixed_down() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..100 {
                w.write_sample(16_384i16).unwrap();
                w.write_sample(0i16).unwrap();
            }
            w.finalize().unwrap();
        }
        let clip = AudioClip::from_wav_bytes(&cursor.into_inner()).unwrap();
        assert_eq!(clip.samples.len(), 100);
        assert!((clip.samples[0] - 0.25).abs() < 1e-3);
    }
}
