//! Synthesis requests and the mode-specific inputs they carry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::AudioClip;
use crate::error::{Result, SynthesisError};
use crate::text::Language;

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    #[serde(alias = "sft")]
    FixedSpeaker,
    ZeroShot,
    CrossLingual,
    Instruct,
}

impl ModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::FixedSpeaker => "fixed_speaker",
            ModeKind::ZeroShot => "zero_shot",
            ModeKind::CrossLingual => "cross_lingual",
            ModeKind::Instruct => "instruct",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModeKind {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed_speaker" | "sft" => Ok(ModeKind::FixedSpeaker),
            "zero_shot" => Ok(ModeKind::ZeroShot),
            "cross_lingual" => Ok(ModeKind::CrossLingual),
            "instruct" => Ok(ModeKind::Instruct),
            other => Err(SynthesisError::InvalidInput(format!("unknown mode '{other}'"))),
        }
    }
}

/// Register the speaker extracted from a reference clip under `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: String,
    pub overwrite: bool,
}

/// An unregistered voice supplied inline.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceClip {
    pub audio: AudioClip,
    /// Transcript of `audio`. Filled in by the transcriber when absent.
    pub prompt_text: Option<String>,
    pub register_as: Option<Enrollment>,
}

impl ReferenceClip {
    pub fn new(audio: AudioClip) -> Self {
        Self { audio, prompt_text: None, register_as: None }
    }

    pub fn with_prompt_text(mut self, text: impl Into<String>) -> Self {
        self.prompt_text = Some(text.into());
        self
    }

    pub fn register_as(mut self, id: impl Into<String>, overwrite: bool) -> Self {
        self.register_as = Some(Enrollment { id: id.into(), overwrite });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerRef {
    Registered(String),
    Reference(ReferenceClip),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisMode {
    FixedSpeaker { speaker_id: String },
    ZeroShot { speaker: SpeakerRef },
    CrossLingual { speaker: SpeakerRef },
    Instruct { speaker: SpeakerRef, instruction: String },
}

impl SynthesisMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            SynthesisMode::FixedSpeaker { .. } => ModeKind::FixedSpeaker,
            SynthesisMode::ZeroShot { .. } => ModeKind::ZeroShot,
            SynthesisMode::CrossLingual { .. } => ModeKind::CrossLingual,
            SynthesisMode::Instruct { .. } => ModeKind::Instruct,
        }
    }

    fn speaker_ref(&self) -> Option<&SpeakerRef> {
        match self {
            SynthesisMode::FixedSpeaker { .. } => None,
            SynthesisMode::ZeroShot { speaker }
            | SynthesisMode::CrossLingual { speaker }
            | SynthesisMode::Instruct { speaker, .. } => Some(speaker),
        }
    }

    /// Registered speaker id, if the mode refers to one.
    pub fn speaker_id(&self) -> Option<&str> {
        match self {
            SynthesisMode::FixedSpeaker { speaker_id } => Some(speaker_id),
            _ => match self.speaker_ref() {
                Some(SpeakerRef::Registered(id)) => Some(id),
                _ => None,
            },
        }
    }

    /// Inline reference clip, if the mode carries one.
    pub fn reference(&self) -> Option<&ReferenceClip> {
        match self.speaker_ref() {
            Some(SpeakerRef::Reference(clip)) => Some(clip),
            _ => None,
        }
    }

    pub fn instruction(&self) -> Option<&str> {
        match self {
            SynthesisMode::Instruct { instruction, .. } => Some(instruction),
            _ => None,
        }
    }

    /// Build a mode from loosely typed parts, as they arrive from a host.
    pub fn from_parts(
        kind: ModeKind,
        speaker_id: Option<String>,
        reference: Option<ReferenceClip>,
        instruction: Option<String>,
    ) -> Result<Self> {
        let invalid = |reason: &str| SynthesisError::InvalidRequest {
            mode: kind,
            reason: reason.to_string(),
        };

        if instruction.is_some() && kind != ModeKind::Instruct {
            return Err(invalid("an instruction is only accepted in instruct mode"));
        }

        let speaker = match (speaker_id, reference) {
            (Some(_), Some(_)) => return Err(invalid("give either a speaker id or a reference clip, not both")),
            (Some(id), None) => SpeakerRef::Registered(id),
            (None, Some(clip)) => SpeakerRef::Reference(clip),
            (None, None) => return Err(invalid("a speaker id or a reference clip is required")),
        };

        let mode = match kind {
            ModeKind::FixedSpeaker => match speaker {
                SpeakerRef::Registered(speaker_id) => SynthesisMode::FixedSpeaker { speaker_id },
                SpeakerRef::Reference(_) => {
                    return Err(invalid("fixed-speaker mode takes a registered speaker id, not a reference clip"))
                }
            },
            ModeKind::ZeroShot => SynthesisMode::ZeroShot { speaker },
            ModeKind::CrossLingual => SynthesisMode::CrossLingual { speaker },
            ModeKind::Instruct => SynthesisMode::Instruct {
                speaker,
                instruction: instruction.ok_or_else(|| invalid("instruct mode requires an instruction"))?,
            },
        };
        mode.validate()?;
        Ok(mode)
    }

    /// Check mode-specific fields that the type alone cannot guarantee.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        let invalid = |reason: String| SynthesisError::InvalidRequest { mode: kind, reason };

        if let Some(id) = self.speaker_id() {
            if id.trim().is_empty() {
                return Err(invalid("speaker id is empty".into()));
            }
        }
        if let Some(clip) = self.reference() {
            if clip.audio.samples.is_empty() {
                return Err(invalid("reference clip has no samples".into()));
            }
            if let Some(e) = &clip.register_as {
                if e.id.trim().is_empty() {
                    return Err(invalid("enrollment id is empty".into()));
                }
            }
        }
        if let Some(instruction) = self.instruction() {
            if instruction.trim().is_empty() {
                return Err(invalid("instruction is empty".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SynthesisOptions {
    /// Speaking rate, 0.5 to 2.0. Defaults to the configured rate.
    pub speed: Option<f32>,
    /// Sampling seed. Identical seeds give identical audio.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: Language,
    pub mode: SynthesisMode,
    pub streaming: bool,
    pub options: SynthesisOptions,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, mode: SynthesisMode) -> Self {
        Self {
            text: text.into(),
            language: Language::En,
            mode,
            streaming: false,
            options: SynthesisOptions::default(),
        }
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.options.speed = Some(speed);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.options.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.mode.validate()?;
        if let Some(speed) = self.options.speed {
            if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
                return Err(SynthesisError::InvalidInput(format!(
                    "speed {speed} outside {MIN_SPEED}..={MAX_SPEED}"
                )));
            }
        }
        if self.text.trim().is_empty() {
            return Err(SynthesisError::InvalidInput("text is empty".into()));
        }
        Ok(())
    }
}
