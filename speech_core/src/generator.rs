//! Incremental speech-token generation.
//!
//! A [`TokenGenerator`] drives one language-model session and hands out
//! windows of tokens as soon as the decoder has enough right context to
//! process them. Tokens are never revised once handed out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, SynthesisError};
use crate::stages::{LmInput, LmSession, SpeechLm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Idle,
    Priming,
    Emitting,
    Done,
    Failed,
}

/// Append-only token buffer with a monotonic consumption cursor.
#[derive(Debug, Default, Clone)]
pub struct SpeechTokenSequence {
    tokens: Vec<u32>,
    consumed: usize,
}

impl SpeechTokenSequence {
    pub fn push(&mut self, token: u32) {
        self.tokens.push(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn pending(&self) -> usize {
        self.tokens.len() - self.consumed
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.tokens
    }

    /// Consume up to `n` tokens and return them together with up to
    /// `lookahead` tokens that follow without consuming those.
    fn take_window(&mut self, n: usize, lookahead: usize) -> (Vec<u32>, Vec<u32>) {
        let end = (self.consumed + n).min(self.tokens.len());
        let window = self.tokens[self.consumed..end].to_vec();
        let ahead_end = (end + lookahead).min(self.tokens.len());
        let ahead = self.tokens[end..ahead_end].to_vec();
        self.consumed = end;
        (window, ahead)
    }
}

/// How many tokens go into each decoder window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub first: usize,
    pub growth: usize,
    pub max: usize,
    pub lookahead: usize,
}

impl WindowPolicy {
    pub fn fixed(size: usize, lookahead: usize) -> Self {
        Self { first: size, growth: 0, max: size, lookahead }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            first: config.window_tokens.max(1),
            growth: config.window_growth,
            max: config.max_window_tokens.max(config.window_tokens).max(1),
            lookahead: config.lookahead_tokens,
        }
    }

    pub fn size_for(&self, index: usize) -> usize {
        self.first.saturating_add(self.growth.saturating_mul(index)).min(self.max)
    }
}

/// Tokens handed to the decoder in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWindow {
    pub index: usize,
    pub tokens: Vec<u32>,
    /// Right context, not consumed by this window.
    pub lookahead: Vec<u32>,
    /// No window follows this one for the current text unit.
    pub last: bool,
}

pub struct TokenGenerator {
    lm: Arc<dyn SpeechLm>,
    input: Option<LmInput>,
    session: Option<Box<dyn LmSession>>,
    state: GeneratorState,
    sequence: SpeechTokenSequence,
    policy: WindowPolicy,
    windows: usize,
    max_tokens: usize,
    model_finished: bool,
}

impl TokenGenerator {
    pub fn new(lm: Arc<dyn SpeechLm>, input: LmInput, policy: WindowPolicy) -> Self {
        let max_tokens = input.max_tokens;
        Self {
            lm,
            input: Some(input),
            session: None,
            state: GeneratorState::Idle,
            sequence: SpeechTokenSequence::default(),
            policy,
            windows: 0,
            max_tokens,
            model_finished: false,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn tokens(&self) -> &SpeechTokenSequence {
        &self.sequence
    }

    pub fn windows_emitted(&self) -> usize {
        self.windows
    }

    /// Stop without producing further windows. Already returned windows
    /// stay valid.
    pub fn cancel(&mut self) {
        if !matches!(self.state, GeneratorState::Failed) {
            self.state = GeneratorState::Done;
        }
        self.session = None;
    }

    fn fail(&mut self, e: SynthesisError) -> SynthesisError {
        self.state = GeneratorState::Failed;
        self.session = None;
        e
    }

    /// Run the model until the next window is ready. Returns `None` once
    /// the final window has been handed out.
    pub fn next_window(&mut self) -> Result<Option<TokenWindow>> {
        match self.state {
            GeneratorState::Done => return Ok(None),
            GeneratorState::Failed => {
                return Err(SynthesisError::Generation("generator already failed".into()))
            }
            GeneratorState::Idle => self.prime()?,
            GeneratorState::Priming | GeneratorState::Emitting => {}
        }

        loop {
            let size = self.policy.size_for(self.windows);
            // hold a window back until something follows it, so the last
            // one is never empty
            let needed = size + self.policy.lookahead.max(1);
            if self.sequence.pending() >= needed {
                return Ok(Some(self.emit(size, false)));
            }

            if self.model_finished {
                if self.sequence.pending() == 0 {
                    let e = SynthesisError::Generation("model produced no speech tokens".into());
                    return Err(self.fail(e));
                }
                self.state = GeneratorState::Done;
                self.session = None;
                let rest = self.sequence.pending();
                return Ok(Some(self.emit(rest, true)));
            }

            self.pull()?;
        }
    }

    fn prime(&mut self) -> Result<()> {
        self.state = GeneratorState::Priming;
        let Some(input) = self.input.take() else {
            return Err(self.fail(SynthesisError::Generation("generator primed twice".into())));
        };
        match self.lm.start(input) {
            Ok(session) => {
                self.session = Some(session);
                self.state = GeneratorState::Emitting;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn pull(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fail(SynthesisError::Generation("no active session".into())));
        };
        match session.next_token() {
            Ok(Some(token)) => {
                if self.sequence.len() >= self.max_tokens {
                    warn!(max_tokens = self.max_tokens, "speech token budget exhausted, stopping generation");
                    self.model_finished = true;
                } else {
                    self.sequence.push(token);
                }
                Ok(())
            }
            Ok(None) => {
                self.model_finished = true;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn emit(&mut self, size: usize, last: bool) -> TokenWindow {
        let (tokens, lookahead) = self.sequence.take_window(size, self.policy.lookahead);
        let window = TokenWindow { index: self.windows, tokens, lookahead, last };
        self.windows += 1;
        debug!(
            window = window.index,
            tokens = window.tokens.len(),
            last,
            "speech token window ready"
        );
        window
    }
}
