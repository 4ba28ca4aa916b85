use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, SynthesisError};
use crate::stages::{LmInput, LmSession, SpeechLm};

use super::{mix, mix_all};

/// Seeded stand-in for the speech language model. Emits roughly
/// `tokens_per_text_token` speech tokens per text token, each drawn from
/// the aligned text token, the previous token and the conditioning.
#[derive(Debug, Clone)]
pub struct PatternLm {
    vocab_size: u32,
    tokens_per_text_token: f32,
}

impl PatternLm {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(2),
            tokens_per_text_token: 3.0,
        }
    }
}

struct PatternSession {
    rng: StdRng,
    text: Vec<u32>,
    target: usize,
    pos: usize,
    prev: u32,
    bias: u32,
    vocab_size: u32,
}

impl SpeechLm for PatternLm {
    fn start(&self, input: LmInput) -> Result<Box<dyn LmSession>> {
        if input.text_tokens.is_empty() {
            return Err(SynthesisError::Generation("no text tokens to condition on".into()));
        }
        let cond = &input.conditioning;

        let mut seed = mix_all(cond.seed, &input.text_tokens);
        seed = mix_all(seed, &cond.prompt_text_tokens);
        seed = mix_all(seed, &cond.lm_prompt_tokens);
        let mut rng = StdRng::seed_from_u64(seed);

        let text_len = input.text_tokens.len();
        let base = (text_len as f32 * self.tokens_per_text_token) as usize;
        let jitter = rng.gen_range(0..=text_len / 4);
        let target = (base + jitter).max(input.min_tokens).min(input.max_tokens.max(1));

        // voice colour from the embedding, folded into a token offset
        let timbre = cond
            .embedding
            .iter()
            .take(8)
            .fold(0u64, |acc, v| mix(acc, (v * 1000.0).round() as i64 as u64));
        let bias = (mix_all(timbre, &cond.lm_prompt_tokens) % self.vocab_size as u64) as u32;

        Ok(Box::new(PatternSession {
            rng,
            text: input.text_tokens,
            target,
            pos: 0,
            prev: cond.lm_prompt_tokens.last().copied().unwrap_or(0),
            bias,
            vocab_size: self.vocab_size,
        }))
    }
}

impl LmSession for PatternSession {
    fn next_token(&mut self) -> Result<Option<u32>> {
        if self.pos >= self.target {
            return Ok(None);
        }
        let aligned = self.text[self.pos * self.text.len() / self.target];
        let jitter: u32 = self.rng.gen_range(0..16);
        let token = (aligned as u64 * 31 + self.prev as u64 * 7 + self.bias as u64 + jitter as u64)
            % self.vocab_size as u64;
        self.pos += 1;
        self.prev = token as u32;
        Ok(Some(token as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Conditioning;
    use std::sync::Arc;

    fn run(lm: &PatternLm, text: Vec<u32>, cond: Conditioning) -> Vec<u32> {
        let mut session = lm
            .start(LmInput {
                text_tokens: text,
                conditioning: Arc::new(cond),
                min_tokens: 0,
                max_tokens: 10_000,
            })
            .unwrap();
        let mut out = Vec::new();
        while let Some(t) = session.next_token().unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn same_seed_same_tokens() {
        let lm = PatternLm::new(4096);
        let cond = Conditioning { seed: 7, embedding: vec![0.1, 0.2], ..Default::default() };
        let a = run(&lm, vec![10, 11, 12, 13], cond.clone());
        let b = run(&lm, vec![10, 11, 12, 13], cond);
        assert_eq!(a, b);
        assert!(a.iter().all(|&t| t < 4096));
    }

    #[test]
    fn length_scales_with_text() {
        let lm = PatternLm::new(4096);
        let short = run(&lm, vec![9; 10], Conditioning::default()).len();
        let long = run(&lm, vec![9; 40], Conditioning::default()).len();
        assert!(short >= 30 && short <= 33);
        assert!(long >= 120 && long <= 130);
    }

    #[test]
    fn seed_changes_output() {
        let lm = PatternLm::new(4096);
        let a = run(&lm, vec![10; 20], Conditioning { seed: 1, ..Default::default() });
        let b = run(&lm, vec![10; 20], Conditioning { seed: 2, ..Default::default() });
        assert_ne!(a, b);
    }

    #[test]
    fn empty_text_is_a_generation_error() {
        let lm = PatternLm::new(4096);
        let res = lm.start(LmInput {
            text_tokens: vec![],
            conditioning: Arc::new(Conditioning::default()),
            min_tokens: 0,
            max_tokens: 10,
        });
        assert!(matches!(res, Err(SynthesisError::Generation(_))));
    }
}
