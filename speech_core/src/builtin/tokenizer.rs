use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::error::Result;
use crate::stages::Tokenizer;
use crate::text::Language;

pub const PAD: u32 = 0;
pub const END_OF_INSTRUCTION: u32 = 1;
const LANGUAGE_BASE: u32 = 2;
const FIRST_CHAR: u32 = LANGUAGE_BASE + Language::ALL.len() as u32;
const DEFAULT_VOCAB: u32 = 8192;

/// Character-level tokenizer. Without a vocabulary file characters are
/// hashed into a fixed id range.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    vocab: Option<HashMap<char, u32>>,
    vocab_size: u32,
}

impl Default for CharTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_VOCAB)
    }
}

impl CharTokenizer {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab: None,
            vocab_size: vocab_size.max(FIRST_CHAR + 1),
        }
    }

    /// Load a `{"a": 7, "b": 8, ...}` map. Ids below the reserved range
    /// are rejected; characters missing from the map share one unknown id.
    pub fn from_vocab_file<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to load {}", p.as_ref().display()))?;
        let raw: HashMap<String, u32> =
            serde_json::from_str(&text).with_context(|| "vocabulary is not a JSON object of ids")?;

        let mut vocab = HashMap::with_capacity(raw.len());
        for (key, id) in raw {
            let mut chars = key.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                anyhow::bail!("vocabulary key '{key}' is not a single character");
            };
            if id < FIRST_CHAR {
                anyhow::bail!("id {id} for '{key}' collides with reserved ids below {FIRST_CHAR}");
            }
            vocab.insert(c, id);
        }
        let max_id = vocab.values().copied().max().unwrap_or(FIRST_CHAR);
        Ok(Self {
            vocab: Some(vocab),
            // one past the largest id is the unknown token
            vocab_size: max_id + 2,
        })
    }

    fn unknown(&self) -> u32 {
        self.vocab_size - 1
    }

    fn char_id(&self, c: char) -> u32 {
        match &self.vocab {
            Some(map) => map.get(&c).copied().unwrap_or_else(|| self.unknown()),
            None => FIRST_CHAR + (c as u32) % (self.vocab_size - FIRST_CHAR),
        }
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str, language: Language) -> Result<Vec<u32>> {
        let ids = match language {
            Language::En => text.chars().flat_map(char::to_lowercase).map(|c| self.char_id(c)).collect(),
            _ => text.chars().map(|c| self.char_id(c)).collect(),
        };
        Ok(ids)
    }

    fn language_token(&self, language: Language) -> u32 {
        let pos = Language::ALL.iter().position(|l| *l == language).unwrap_or(0);
        LANGUAGE_BASE + pos as u32
    }

    fn end_of_instruction(&self) -> u32 {
        END_OF_INSTRUCTION
    }

    fn vocab_size(&self) -> u32 {
        self.vocab_size
    }
}
