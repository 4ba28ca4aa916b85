//! Text front-end: cleans raw input and segments it into units that fit the
//! per-unit budget.
//!
//! Splitting happens on sentence boundaries first, then on clause
//! boundaries, and only as a last resort at a hard character boundary that
//! never separates a base character from a following combining mark or
//! joiner.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{Result, SynthesisError};

/// Languages the front-end and tokenizer understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
    Ja,
    Ko,
    Yue,
}

impl Language {
    pub const ALL: [Language; 5] = [Language::Zh, Language::En, Language::Ja, Language::Ko, Language::Yue];

    pub fn code(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
            Language::Ja => "ja",
            Language::Ko => "ko",
            Language::Yue => "yue",
        }
    }

    fn uses_spaces(&self) -> bool {
        matches!(self, Language::En | Language::Ko)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = SynthesisError;

    /// Accepts `ll`, `ll_CC` and `ll-CC` tags, case-insensitive on the
    /// language part.
    fn from_str(tag: &str) -> Result<Self> {
        let primary = tag
            .split(['_', '-'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "zh" | "cmn" => Ok(Language::Zh),
            "en" => Ok(Language::En),
            "ja" | "jp" => Ok(Language::Ja),
            "ko" => Ok(Language::Ko),
            "yue" => Ok(Language::Yue),
            _ => Err(SynthesisError::InvalidInput(format!("unsupported language '{tag}'"))),
        }
    }
}

/// A segment of normalized text ready for tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUnit {
    pub index: usize,
    pub text: String,
    pub language: Language,
}

/// Clean and segment `text`. Deterministic for identical input and config.
pub fn normalize(text: &str, language: Language, config: &PipelineConfig) -> Result<Vec<TextUnit>> {
    if text.trim().is_empty() {
        return Err(SynthesisError::InvalidInput("text is empty".into()));
    }
    let char_count = text.chars().count();
    if char_count > config.max_text_chars {
        return Err(SynthesisError::InvalidInput(format!(
            "text has {char_count} characters, limit is {}",
            config.max_text_chars
        )));
    }

    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return Err(SynthesisError::InvalidInput("text has nothing to pronounce".into()));
    }

    let budget = config.max_unit_chars.max(1);
    let mut pieces = Vec::new();
    for sentence in split_sentences(&cleaned) {
        if char_len(&sentence) <= budget {
            pieces.push(sentence);
            continue;
        }
        for clause in pack(split_clauses(&sentence), budget, language) {
            if char_len(&clause) <= budget {
                pieces.push(clause);
            } else {
                pieces.extend(hard_cut(&clause, budget));
            }
        }
    }

    let pieces = merge_short(pieces, config.min_unit_chars, budget, language);
    Ok(pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(index, text)| TextUnit { index, text, language })
        .collect())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Strip markup the synthesizer should not read aloud and tidy whitespace
/// and punctuation spacing.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = text.to_string();

    // fenced code blocks are dropped entirely
    while let Some(start) = cleaned.find("```") {
        match cleaned[start + 3..].find("```") {
            Some(end) => cleaned.replace_range(start..start + end + 6, ""),
            None => break,
        }
    }

    // inline code keeps its content
    while let Some(start) = cleaned.find('`') {
        match cleaned[start + 1..].find('`') {
            Some(end) => {
                let inner = cleaned[start + 1..start + 1 + end].to_string();
                cleaned.replace_range(start..start + end + 2, &inner);
            }
            None => {
                cleaned.replace_range(start..start + 1, "");
            }
        }
    }

    // [text](url) -> text
    let mut pos = 0;
    while let Some(rel) = cleaned[pos..].find('[') {
        let start = pos + rel;
        let Some(mid) = cleaned[start + 1..].find(']').map(|m| start + 1 + m) else {
            break;
        };
        if !cleaned[mid + 1..].starts_with('(') {
            pos = mid + 1;
            continue;
        }
        let Some(end) = cleaned[mid + 1..].find(')').map(|e| mid + 1 + e) else {
            break;
        };
        let link_text = cleaned[start + 1..mid].to_string();
        cleaned.replace_range(start..end + 1, &link_text);
        pos = start + link_text.len();
    }

    let lines: Vec<String> = cleaned
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let trimmed = trimmed.trim_start_matches('#').trim_start();
            let trimmed = ["- ", "* ", "+ "]
                .iter()
                .find_map(|m| trimmed.strip_prefix(m))
                .unwrap_or(trimmed);
            match trimmed.find(". ") {
                Some(n) if n > 0 && trimmed[..n].chars().all(|c| c.is_ascii_digit()) => {
                    trimmed[n + 2..].to_string()
                }
                _ => trimmed.to_string(),
            }
        })
        .collect();
    cleaned = lines.join("\n");

    for marker in ["**", "__", "~~", "*"] {
        cleaned = cleaned.replace(marker, "");
    }

    let mut result = String::with_capacity(cleaned.len());
    let mut last_was_whitespace = false;
    for ch in cleaned.chars() {
        if ch.is_whitespace() {
            if !last_was_whitespace {
                result.push(' ');
                last_was_whitespace = true;
            }
        } else {
            result.push(ch);
            last_was_whitespace = false;
        }
    }

    for p in [",", ".", "!", "?", ";", ":"] {
        result = result.replace(&format!(" {p}"), p);
    }

    result.trim().to_string()
}

const ABBREVIATIONS: [&str; 14] = [
    "Dr.", "Mr.", "Mrs.", "Ms.", "Prof.", "etc.", "vs.", "e.g.", "i.e.", "a.m.", "p.m.", "Inc.", "Ltd.", "Corp.",
];

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…')
}

fn is_clause_end(c: char) -> bool {
    matches!(c, ',' | ';' | ':' | '，' | '；' | '：' | '、')
}

fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        if is_sentence_end(c) {
            let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let next_digit = chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            let abbreviation = c == '.' && ABBREVIATIONS.iter().any(|a| current.ends_with(a));
            // absorb runs like "?!" or "..."
            while chars.get(i + 1).is_some_and(|&n| is_sentence_end(n)) {
                i += 1;
                current.push(chars[i]);
            }
            let at_break = chars.get(i + 1).map_or(true, |n| n.is_whitespace() || !c.is_ascii());
            if !(prev_digit && next_digit) && !abbreviation && at_break {
                out.push(std::mem::take(&mut current));
            }
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_clauses(sentence: &str) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        current.push(c);
        if is_clause_end(c) {
            // 1,000 and 3,14 stay together
            let numeric = c == ','
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if !numeric {
                out.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn joiner(language: Language) -> &'static str {
    if language.uses_spaces() {
        " "
    } else {
        ""
    }
}

/// Greedily join consecutive clauses while they fit the budget.
fn pack(clauses: Vec<String>, budget: usize, language: Language) -> Vec<String> {
    let sep = joiner(language);
    let mut out: Vec<String> = Vec::new();
    for clause in clauses {
        match out.last_mut() {
            Some(last) if char_len(last) + sep.len() + char_len(&clause) <= budget => {
                last.push_str(sep);
                last.push_str(&clause);
            }
            _ => out.push(clause),
        }
    }
    out
}

/// Characters that must stay attached to whatever precedes them.
fn is_attached(c: char) -> bool {
    let cp = c as u32;
    matches!(cp,
        0x0300..=0x036F   // combining diacritics
        | 0x1AB0..=0x1AFF
        | 0x1DC0..=0x1DFF
        | 0x20D0..=0x20FF
        | 0xFE20..=0xFE2F
        | 0x3099..=0x309A // kana voicing marks
        | 0xFE00..=0xFE0F // variation selectors
        | 0xE0100..=0xE01EF
        | 0x200C..=0x200D // ZWNJ / ZWJ
        | 0x1F3FB..=0x1F3FF // skin tone modifiers
    )
}

/// Cut into pieces of at most `budget` characters, preferring the last
/// whitespace in range and never splitting an attached sequence. A single
/// attached cluster longer than the budget is kept whole.
fn hard_cut(text: &str, budget: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        if chars.len() - start <= budget {
            out.push(chars[start..].iter().collect());
            break;
        }
        let limit = start + budget;
        let mut cut = limit;
        // a cut at index `cut` is safe when chars[cut] and, for ZWJ, the
        // char before it do not bind the two sides together
        let safe = |i: usize| !is_attached(chars[i]) && chars[i - 1] != '\u{200D}';
        while cut > start + 1 && !safe(cut) {
            cut -= 1;
        }
        if cut == start + 1 && !safe(cut) {
            cut = limit;
            while cut < chars.len() && !safe(cut) {
                cut += 1;
            }
        }
        if let Some(ws) = (start + 1..cut).rev().find(|&i| chars[i].is_whitespace()) {
            if ws > start + budget / 2 {
                cut = ws;
            }
        }
        out.push(chars[start..cut].iter().collect());
        start = cut;
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }
    out.into_iter()
        .map(|s: String| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn merge_short(pieces: Vec<String>, min_chars: usize, budget: usize, language: Language) -> Vec<String> {
    let sep = joiner(language);
    let mut out: Vec<String> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let short = char_len(piece.trim()) < min_chars;
        match out.last_mut() {
            Some(last) if short && char_len(last) + sep.len() + char_len(&piece) <= budget => {
                last.push_str(sep);
                last.push_str(&piece);
            }
            _ => out.push(piece),
        }
    }
    out
}
