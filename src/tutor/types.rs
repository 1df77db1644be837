use serde::{Deserialize, Serialize};

use crate::models::provider::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Learner,
    Tutor,
    System,
}

impl TurnRole {
    /// Role name on the gateway wire format.
    pub fn as_wire(&self) -> &'static str {
        match self {
            TurnRole::Learner => "user",
            TurnRole::Tutor => "assistant",
            TurnRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: TurnRole,
    pub content: String,
}

impl TurnMessage {
    pub fn learner(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Learner,
            content: content.into(),
        }
    }

    pub fn tutor(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tutor,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub history: Vec<TurnMessage>,
    pub message: String,
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: Option<String>,
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub text: String,
    pub language: String,
    pub max_sentences: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub language: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub size: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProficiencyLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl ProficiencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "beginner",
            ProficiencyLevel::Intermediate => "intermediate",
            ProficiencyLevel::Advanced => "advanced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseSetRequest {
    pub topic: String,
    pub language: String,
    pub level: ProficiencyLevel,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleplayRequest {
    pub scenario: String,
    pub persona: String,
    pub history: Vec<TurnMessage>,
    pub message: String,
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutorTurn {
    pub reply: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Translation {
    pub translated_text: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub model: String,
}

/// Synthesized audio. The payload stays base64 so the rendering layer
/// decides how to decode and play it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechClip {
    pub audio_base64: String,
    pub format: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub image_base64: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub prompt: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseSet {
    pub exercises: Vec<Exercise>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleplayTurn {
    pub reply: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub request_id: String,
}
