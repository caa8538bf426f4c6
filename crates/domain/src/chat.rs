use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::ai::Emotion;
use crate::ports::chat::ChatRepository;
use crate::util::now_ms;

pub const MAX_TITLE_LENGTH: usize = 50;
pub const MAX_MESSAGE_LENGTH: usize = 2_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    VoiceText,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub chat_id: String,
    pub patient_id: String,
    pub title: Option<String>,
    pub created_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

impl Chat {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

/// Speech analysis persisted alongside the user-origin voice message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VoiceAnalysis {
    pub transcript: String,
    pub dominant_emotion: Emotion,
    pub llm_prompt: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub chat_id: String,
    pub message_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub from_ai: bool,
    pub created_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
    pub voice_analysis: Option<VoiceAnalysis>,
}

#[derive(Clone)]
pub struct ChatService {
    repository: Arc<dyn ChatRepository>,
}

impl ChatService {
    pub fn new(repository: Arc<dyn ChatRepository>) -> Self {
        Self { repository }
    }

    pub async fn create_chat(
        &self,
        actor: &ActorIdentity,
        title: Option<String>,
    ) -> DomainResult<Chat> {
        let title = validate_title(title)?;
        let chat = Chat {
            chat_id: crate::util::uuid_v7_without_dashes(),
            patient_id: actor.user_id.clone(),
            title,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
        };
        self.repository.create_chat(&chat).await
    }

    pub async fn rename_chat(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
        title: Option<String>,
    ) -> DomainResult<Chat> {
        let title = validate_title(title)?;
        let mut chat = self.owned_chat(actor, chat_id).await?;
        chat.title = title;
        self.repository.update_chat(&chat).await
    }

    pub async fn delete_chat(&self, actor: &ActorIdentity, chat_id: &str) -> DomainResult<()> {
        let mut chat = self.owned_chat(actor, chat_id).await?;
        chat.deleted_at_ms = Some(now_ms());
        self.repository.update_chat(&chat).await?;
        Ok(())
    }

    pub async fn list_chats(&self, actor: &ActorIdentity) -> DomainResult<Vec<Chat>> {
        self.repository.list_chats_by_patient(&actor.user_id).await
    }

    pub async fn get_messages(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
    ) -> DomainResult<(Chat, Vec<ChatMessage>)> {
        let chat = self.owned_chat(actor, chat_id).await?;
        let messages = self.repository.list_messages(chat_id).await?;
        Ok((chat, messages))
    }

    /// Messages the client has not seen yet, for catch-up after reconnect.
    pub async fn sync_messages(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
        last_message_id: Option<&str>,
    ) -> DomainResult<Vec<ChatMessage>> {
        self.owned_chat(actor, chat_id).await?;
        self.repository
            .list_messages_since(chat_id, last_message_id)
            .await
    }

    pub async fn get_ai_message(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
        message_id: &str,
    ) -> DomainResult<ChatMessage> {
        self.owned_chat(actor, chat_id).await?;
        let message = self
            .repository
            .get_message(chat_id, message_id)
            .await?
            .filter(|message| message.from_ai && message.deleted_at_ms.is_none())
            .ok_or(DomainError::NotFound)?;
        Ok(message)
    }

    /// The chat, iff it is alive and belongs to the acting patient.
    pub async fn owned_chat(&self, actor: &ActorIdentity, chat_id: &str) -> DomainResult<Chat> {
        let chat = self
            .repository
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted())
            .ok_or(DomainError::NotFound)?;
        if chat.patient_id != actor.user_id {
            return Err(DomainError::NotFound);
        }
        Ok(chat)
    }
}

fn validate_title(title: Option<String>) -> DomainResult<Option<String>> {
    let Some(title) = title else {
        return Ok(None);
    };
    let title = title.trim().to_string();
    if title.is_empty() {
        return Ok(None);
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(DomainError::Validation(format!(
            "title exceeds max length of {MAX_TITLE_LENGTH}"
        )));
    }
    Ok(Some(title))
}

pub fn validate_message_content(content: &str) -> DomainResult<String> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(DomainError::Validation("message is required".into()));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(DomainError::Validation(format!(
            "message exceeds max length of {MAX_MESSAGE_LENGTH}"
        )));
    }
    Ok(content)
}
