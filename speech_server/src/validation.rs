use crate::error::ApiError;

/// Maximum text length for TTS requests
const MAX_TEXT_LENGTH: usize = 5000;
/// Maximum length of a speaker id
const MAX_SPEAKER_ID_LENGTH: usize = 64;
const MIN_SPEED: f32 = 0.5;
const MAX_SPEED: f32 = 2.0;
const MAX_SEED: u64 = 100_000_000;

/// Validate TTS request
pub fn validate_tts_request(text: &str, language: Option<&str>) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }

    if let Some(lang) = language {
        if !is_valid_language_code(lang) {
            return Err(ApiError::InvalidInput(format!(
                "Invalid language code format: {}. Expected format: ll or ll_CC (e.g., en, zh_CN)",
                lang
            )));
        }
    }

    Ok(())
}

/// Language code format: `ll` or `ll_CC`.
fn is_valid_language_code(code: &str) -> bool {
    // `ll`, `lll` (yue) or `ll_CC`
    let primary = |p: &str| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_lowercase());
    match code.split_once('_') {
        None => primary(code),
        Some((lang, region)) => {
            primary(lang) && region.len() == 2 && region.chars().all(|c| c.is_ascii_uppercase())
        }
    }
}

/// Speaker ids: 1-64 ASCII letters, digits, `_` or `-`.
pub fn validate_speaker_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id.len() > MAX_SPEAKER_ID_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Speaker id must be 1-{} characters",
            MAX_SPEAKER_ID_LENGTH
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ApiError::InvalidInput(format!(
            "Invalid speaker id: {}. Use letters, digits, '_' or '-'",
            id
        )));
    }
    Ok(())
}

pub fn validate_speed(speed: f32) -> Result<(), ApiError> {
    if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        return Err(ApiError::InvalidInput(format!(
            "Speed must be between {} and {}",
            MIN_SPEED, MAX_SPEED
        )));
    }
    Ok(())
}

pub fn validate_seed(seed: u64) -> Result<(), ApiError> {
    if !(1..=MAX_SEED).contains(&seed) {
        return Err(ApiError::InvalidInput(format!("Seed must be between 1 and {}", MAX_SEED)));
    }
    Ok(())
}
