use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::generator::TokenWindow;
use crate::stages::{ensure_vocabulary, AcousticChunk, AcousticDecoder, Conditioning, LengthState};

use super::mix;

const FLOOR: f32 = -4.0;
const PEAK: f32 = 3.0;
const BAND_WIDTH: f32 = 2.5;

/// Length-regulated feature synthesis. Each frame is a band pattern
/// centred on the bin selected by its aligned token, coloured by the
/// speaker embedding and perturbed by noise seeded from the request seed
/// and the frame's global index.
#[derive(Debug, Clone)]
pub struct FlowDecoder {
    vocab_size: u32,
    n_mels: usize,
    frames_per_token: f64,
}

impl FlowDecoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            vocab_size: config.speech_vocab_size,
            n_mels: config.n_mels,
            frames_per_token: config.frames_per_token as f64,
        }
    }
}

impl AcousticDecoder for FlowDecoder {
    fn decode(
        &self,
        window: &TokenWindow,
        conditioning: &Conditioning,
        state: LengthState,
    ) -> Result<(AcousticChunk, LengthState)> {
        ensure_vocabulary(&window.tokens, self.vocab_size)?;
        ensure_vocabulary(&window.lookahead, self.vocab_size)?;

        let speed = if conditioning.speed > 0.0 { conditioning.speed as f64 } else { 1.0 };
        let (frames, next) = state.advance(window.tokens.len(), self.frames_per_token / speed);

        let bins = self.n_mels;
        let prompt_shift = if conditioning.flow_prompt_tokens.is_empty() {
            0
        } else {
            let sum: u64 = conditioning.flow_prompt_tokens.iter().map(|&t| t as u64).sum();
            (sum / conditioning.flow_prompt_tokens.len() as u64) as usize % 7
        };

        let mut data = Vec::with_capacity(frames * bins);
        for j in 0..frames {
            let global = state.frames_emitted + j as u64;
            let pos = ((j as f64 + 0.5) * window.tokens.len() as f64 / frames as f64) as usize;
            let token = window.tokens[pos.min(window.tokens.len() - 1)];
            let mut center = ((token as usize + prompt_shift) % bins) as f32;
            if j + 1 == frames {
                if let Some(&next_token) = window.lookahead.first() {
                    center = (center + ((next_token as usize + prompt_shift) % bins) as f32) / 2.0;
                }
            }

            let mut rng = StdRng::seed_from_u64(mix(conditioning.seed, global));
            for b in 0..bins {
                let d = b as f32 - center;
                let band = (PEAK - FLOOR) * (-(d * d) / (2.0 * BAND_WIDTH * BAND_WIDTH)).exp();
                let timbre = conditioning
                    .embedding
                    .get(b % conditioning.embedding.len().max(1))
                    .copied()
                    .unwrap_or(0.0);
                let noise: f32 = rng.gen_range(-0.05..0.05);
                data.push(FLOOR + band + 0.5 * timbre + noise);
            }
        }

        Ok((
            AcousticChunk {
                index: window.index,
                start_frame: state.frames_emitted,
                frames,
                bins,
                data,
            },
            next,
        ))
    }
}
