//! Stitches vocoder chunks into continuous audio.
//!
//! The last `crossfade` samples of each chunk are held back and blended
//! linearly into the head of the next chunk. The final chunk is flushed
//! whole, with nothing held back.

use crate::audio::{WaveformChunk, WaveformClip};
use crate::error::{Result, SynthesisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Emit the non-overlapping part of every chunk right away.
    Streaming,
    /// Buffer everything and hand out one clip at the end.
    FullUtterance,
}

#[derive(Debug)]
pub struct StreamingAssembler {
    mode: AssemblyMode,
    crossfade: usize,
    sample_rate: u32,
    tail: Vec<f32>,
    buffer: Vec<f32>,
    next_index: usize,
    finished: bool,
}

impl StreamingAssembler {
    pub fn new(mode: AssemblyMode, crossfade: usize, sample_rate: u32) -> Self {
        Self {
            mode,
            crossfade,
            sample_rate,
            tail: Vec::with_capacity(crossfade),
            buffer: Vec::new(),
            next_index: 0,
            finished: false,
        }
    }

    pub fn mode(&self) -> AssemblyMode {
        self.mode
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the next chunk. In streaming mode the emitted audio comes back
    /// immediately; in full-utterance mode it is buffered and `None` is
    /// returned.
    pub fn push(&mut self, chunk: WaveformChunk, last: bool) -> Result<Option<WaveformChunk>> {
        if self.finished {
            return Err(SynthesisError::Decode("chunk received after the final flush".into()));
        }
        if chunk.index != self.next_index {
            return Err(SynthesisError::Decode(format!(
                "chunk {} arrived, expected {}",
                chunk.index, self.next_index
            )));
        }
        if chunk.sample_rate != self.sample_rate {
            return Err(SynthesisError::Decode(format!(
                "chunk sample rate {} does not match {}",
                chunk.sample_rate, self.sample_rate
            )));
        }

        let mut samples = chunk.samples;
        if !self.tail.is_empty() {
            let tail = std::mem::take(&mut self.tail);
            samples = append_with_crossfade(tail, samples);
        }

        if last {
            self.finished = true;
        } else {
            let hold = self.crossfade.min(samples.len());
            self.tail = samples.split_off(samples.len() - hold);
        }

        let index = self.next_index;
        self.next_index += 1;
        match self.mode {
            AssemblyMode::Streaming => Ok(Some(WaveformChunk {
                index,
                samples,
                sample_rate: self.sample_rate,
            })),
            AssemblyMode::FullUtterance => {
                self.buffer.extend_from_slice(&samples);
                Ok(None)
            }
        }
    }

    /// The buffered utterance. Only valid in full-utterance mode after the
    /// final chunk was pushed.
    pub fn finish(self) -> Result<WaveformClip> {
        if self.mode != AssemblyMode::FullUtterance {
            return Err(SynthesisError::Decode("streaming assembler holds no utterance".into()));
        }
        if !self.finished {
            return Err(SynthesisError::Decode("utterance finished before its final chunk".into()));
        }
        Ok(WaveformClip {
            samples: self.buffer,
            sample_rate: self.sample_rate,
        })
    }
}

/// Blend the end of `tail` into the head of `next`. When `next` is shorter
/// than the tail, the earlier part of the tail goes out unblended first.
fn append_with_crossfade(tail: Vec<f32>, next: Vec<f32>) -> Vec<f32> {
    let overlap = tail.len().min(next.len());
    let split = tail.len() - overlap;
    let mut out = Vec::with_capacity(split + next.len());
    out.extend_from_slice(&tail[..split]);
    for i in 0..overlap {
        let t = (i + 1) as f32 / (overlap + 1) as f32;
        out.push(tail[split + i] * (1.0 - t) + next[i] * t);
    }
    out.extend_from_slice(&next[overlap..]);
    out
}
