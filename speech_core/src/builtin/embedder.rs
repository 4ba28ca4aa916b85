use mel_spec::prelude::*;
use ndarray::Array1;
use num_complex::Complex;

use crate::audio::AudioClip;
use crate::config::PipelineConfig;
use crate::error::{Result, SynthesisError};
use crate::stages::{SpeakerEmbedder, SpeakerFeatures};

const FRAME_SIZE: usize = 400;
const HOP_SIZE: usize = 160;
/// Mel frames per prompt token: 100 frames/s down to 25 tokens/s.
const FRAMES_PER_TOKEN: usize = 4;

/// Speaker features from the clip's mel spectrogram: the embedding is the
/// centred, L2-normalised mean log-mel profile; prompt tokens quantise the
/// dominant band and energy of each token-rate slice.
#[derive(Debug, Clone)]
pub struct SpectralEmbedder {
    n_mels: usize,
    vocab_size: u32,
}

impl SpectralEmbedder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            n_mels: config.n_mels,
            vocab_size: config.speech_vocab_size,
        }
    }

    fn mel_frames(&self, samples: &[f32], sample_rate: u32) -> Vec<Vec<f64>> {
        let mut stft = Spectrogram::new(FRAME_SIZE, HOP_SIZE);
        let mut mel = MelSpectrogram::new(FRAME_SIZE, sample_rate as f64, self.n_mels);

        let mut frames = Vec::with_capacity(samples.len() / HOP_SIZE);
        let mut offset = 0usize;
        while offset + HOP_SIZE <= samples.len() {
            let slice = &samples[offset..offset + HOP_SIZE];
            if let Some(fft_frame) = stft.add(slice) {
                let arr_f64: Array1<Complex<f64>> =
                    Array1::from_iter(fft_frame.into_iter().map(|c: Complex<f64>| c));
                let (flat, _off) = mel.add(&arr_f64).into_raw_vec_and_offset();
                frames.push(
                    flat.into_iter()
                        .map(|v| if v.is_finite() { v } else { 0.0 })
                        .collect(),
                );
            }
            offset += HOP_SIZE;
        }
        frames
    }
}

impl SpeakerEmbedder for SpectralEmbedder {
    fn embed(&self, clip: &AudioClip) -> Result<SpeakerFeatures> {
        let frames = self.mel_frames(&clip.samples, clip.sample_rate);
        if frames.is_empty() {
            return Err(SynthesisError::InvalidAudio("clip too short for a spectrogram".into()));
        }

        let mut profile = vec![0.0f64; self.n_mels];
        for frame in &frames {
            for (acc, v) in profile.iter_mut().zip(frame) {
                *acc += v;
            }
        }
        let n = frames.len() as f64;
        profile.iter_mut().for_each(|v| *v /= n);
        let mean = profile.iter().sum::<f64>() / self.n_mels as f64;
        profile.iter_mut().for_each(|v| *v -= mean);
        let norm = profile.iter().map(|v| v * v).sum::<f64>().sqrt();
        let embedding: Vec<f32> = if norm > 1e-9 {
            profile.iter().map(|v| (v / norm) as f32).collect()
        } else {
            vec![(1.0 / (self.n_mels as f64).sqrt()) as f32; self.n_mels]
        };

        let energies: Vec<f64> = frames.iter().map(|f| f.iter().sum::<f64>() / f.len().max(1) as f64).collect();
        let lo = energies.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = energies.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let span = if hi > lo { hi - lo } else { 1.0 };
        let buckets = (self.vocab_size as usize / self.n_mels.max(1)).max(1);

        let prompt_tokens = frames
            .chunks(FRAMES_PER_TOKEN)
            .zip(energies.chunks(FRAMES_PER_TOKEN))
            .map(|(group, energy)| {
                let mut avg = vec![0.0f64; self.n_mels];
                for frame in group {
                    for (acc, v) in avg.iter_mut().zip(frame) {
                        *acc += v;
                    }
                }
                let band = avg
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let e = energy.iter().sum::<f64>() / energy.len() as f64;
                let level = (((e - lo) / span) * (buckets - 1) as f64).round() as usize;
                ((band * buckets + level.min(buckets - 1)) as u32) % self.vocab_size
            })
            .collect();

        Ok(SpeakerFeatures { embedding, prompt_tokens })
    }
}
