use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;
use crate::diagnosis::DiagnosisOutcome;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai transport error: {0}")]
    Transport(String),
    #[error("ai upstream error: {0}")]
    Upstream(String),
    #[error("ai response decode error: {0}")]
    InvalidResponse(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Happy,
    Fearful,
    Neutral,
    Surprised,
    Disgusted,
    Calm,
    Sad,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Emotion::Angry => "angry",
            Emotion::Happy => "happy",
            Emotion::Fearful => "fearful",
            Emotion::Neutral => "neutral",
            Emotion::Surprised => "surprised",
            Emotion::Disgusted => "disgusted",
            Emotion::Calm => "calm",
            Emotion::Sad => "sad",
            Emotion::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmotionScore {
    pub emotion: Emotion,
    pub score: f32,
}

/// Combined speech-to-text and emotion-recognition result for one upload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AudioAnalysis {
    pub transcript: String,
    pub dominant_emotion: Emotion,
    pub emotions: Vec<EmotionScore>,
}

/// One chat message as presented to the diagnosis model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    pub content: String,
    pub from_ai: bool,
}

pub trait LanguageModel: Send + Sync {
    fn generate_response(
        &self,
        message: &str,
        message_id: &str,
        chat_id: &str,
    ) -> BoxFuture<'_, Result<String, AiError>>;
}

pub trait DiagnosisModel: Send + Sync {
    fn generate_diagnosis(
        &self,
        chat_id: &str,
        diagnosis_id: &str,
        transcript: &[TranscriptEntry],
    ) -> BoxFuture<'_, Result<DiagnosisOutcome, AiError>>;
}

pub trait AudioAnalyzer: Send + Sync {
    fn analyze(&self, wav_path: &Path) -> BoxFuture<'_, Result<AudioAnalysis, AiError>>;
}

pub trait SpeechSynthesizer: Send + Sync {
    /// Returns the synthesized reply as raw WAV bytes.
    fn synthesize(&self, text: &str) -> BoxFuture<'_, Result<Vec<u8>, AiError>>;
}
