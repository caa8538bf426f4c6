use serde::{Deserialize, Serialize};

use crate::chat::MessageKind;

/// Typed events pushed to a chat's topic. The serialized `event` tag is the
/// wire name clients subscribe on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ChatEvent {
    /// Immediate echo of a persisted user-origin message, sent before any
    /// AI work begins.
    MessageReceived {
        chat_id: String,
        message_id: String,
        content: String,
        kind: MessageKind,
        created_at_ms: i64,
    },
    AiResponseReady {
        chat_id: String,
        message_id: String,
        content: String,
        kind: MessageKind,
        created_at_ms: i64,
    },
    /// The synthesized reply audio is on disk and downloadable.
    AiAudioReady {
        chat_id: String,
        message_id: String,
    },
    AiResponseFailed {
        chat_id: String,
        reason: String,
    },
    /// Sent for structured outcomes, successful or not; `failure_reason`
    /// and the success fields are mutually exclusive.
    DiagnosisReady {
        chat_id: String,
        diagnosis_id: String,
        diagnosed_problem: Option<String>,
        reasoning: Option<String>,
        prescriptions: Vec<String>,
        failure_reason: Option<String>,
        requested_at_ms: i64,
        completed_at_ms: i64,
    },
    DiagnosisFailed {
        chat_id: String,
        diagnosis_id: String,
        reason: String,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::MessageReceived { .. } => "message-received",
            ChatEvent::AiResponseReady { .. } => "ai-response-ready",
            ChatEvent::AiAudioReady { .. } => "ai-audio-ready",
            ChatEvent::AiResponseFailed { .. } => "ai-response-failed",
            ChatEvent::DiagnosisReady { .. } => "diagnosis-ready",
            ChatEvent::DiagnosisFailed { .. } => "diagnosis-failed",
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            ChatEvent::MessageReceived { chat_id, .. }
            | ChatEvent::AiResponseReady { chat_id, .. }
            | ChatEvent::AiAudioReady { chat_id, .. }
            | ChatEvent::AiResponseFailed { chat_id, .. }
            | ChatEvent::DiagnosisReady { chat_id, .. }
            | ChatEvent::DiagnosisFailed { chat_id, .. } => chat_id,
        }
    }
}
