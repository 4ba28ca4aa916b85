use std::f64::consts::TAU;

use crate::audio::WaveformChunk;
use crate::config::PipelineConfig;
use crate::error::{Result, SynthesisError};
use crate::stages::{AcousticChunk, Vocoder};

/// Harmonic synthesis driven by the dominant band of each frame. Phase is
/// computed from the global sample index, so chunks need no shared state.
#[derive(Debug, Clone)]
pub struct HarmonicVocoder {
    sample_rate: u32,
    samples_per_frame: usize,
    n_mels: usize,
}

impl HarmonicVocoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            samples_per_frame: config.samples_per_frame,
            n_mels: config.n_mels,
        }
    }
}

impl Vocoder for HarmonicVocoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn vocode(&self, chunk: &AcousticChunk) -> Result<WaveformChunk> {
        if chunk.bins != self.n_mels || chunk.data.len() != chunk.frames * chunk.bins {
            return Err(SynthesisError::Decode(format!(
                "acoustic chunk is {}x{} with {} values, vocoder expects {} bins",
                chunk.frames,
                chunk.bins,
                chunk.data.len(),
                self.n_mels
            )));
        }

        let spf = self.samples_per_frame;
        let rate = self.sample_rate as f64;
        let mut samples = Vec::with_capacity(chunk.frames * spf);
        for f in 0..chunk.frames {
            let frame = chunk.frame(f);
            let (band, peak) = frame
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
            let f0 = 90.0 + 4.0 * band as f64;
            let amp = 0.3 / (1.0 + (-(peak as f64)).exp());

            let first = (chunk.start_frame + f as u64) * spf as u64;
            for k in 0..spf as u64 {
                let phase = TAU * f0 * (first + k) as f64 / rate;
                let s = phase.sin() + 0.5 * (2.0 * phase).sin() + 0.25 * (3.0 * phase).sin();
                samples.push((amp * s / 1.75) as f32);
            }
        }

        Ok(WaveformChunk {
            index: chunk.index,
            samples,
            sample_rate: self.sample_rate,
        })
    }
}
