//! Deterministic reference implementations of every stage.
//!
//! They carry no trained weights. Output is a function of the inputs and
//! the seed only, which makes the whole pipeline reproducible end to end
//! and gives real backends a behavioural baseline to test against.

mod embedder;
mod flow;
mod lm;
mod tokenizer;
mod vocoder;

pub use embedder::SpectralEmbedder;
pub use flow::FlowDecoder;
pub use lm::PatternLm;
pub use tokenizer::CharTokenizer;
pub use vocoder::HarmonicVocoder;

/// SplitMix64 step, used to derive independent seeds from a base seed.
pub(crate) fn mix(seed: u64, salt: u64) -> u64 {
    let mut z = seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub(crate) fn mix_all(seed: u64, values: &[u32]) -> u64 {
    values.iter().fold(seed, |acc, &v| mix(acc, v as u64 + 1))
}
