//! In-memory repository backends, used in development mode and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use telecare_domain::DomainResult;
use telecare_domain::chat::{Chat, ChatMessage};
use telecare_domain::diagnosis::Diagnosis;
use telecare_domain::error::DomainError;
use telecare_domain::ports::BoxFuture;
use telecare_domain::ports::chat::ChatRepository;
use telecare_domain::ports::diagnosis::DiagnosisRepository;
use telecare_domain::ports::verification::VerificationRepository;
use telecare_domain::verification::{VerificationAttachment, VerificationRequest, VerificationStatus};

#[derive(Default)]
pub struct InMemoryChatRepository {
    chats: Arc<RwLock<HashMap<String, Chat>>>,
    // Messages per chat in insertion order.
    messages: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatRepository for InMemoryChatRepository {
    fn create_chat(&self, chat: &Chat) -> BoxFuture<'_, DomainResult<Chat>> {
        let chat = chat.clone();
        let chats = self.chats.clone();
        Box::pin(async move {
            let mut chats = chats.write().await;
            if chats.contains_key(&chat.chat_id) {
                return Err(DomainError::Conflict);
            }
            chats.insert(chat.chat_id.clone(), chat.clone());
            Ok(chat)
        })
    }

    fn get_chat(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<Option<Chat>>> {
        let chat_id = chat_id.to_string();
        let chats = self.chats.clone();
        Box::pin(async move { Ok(chats.read().await.get(&chat_id).cloned()) })
    }

    fn update_chat(&self, chat: &Chat) -> BoxFuture<'_, DomainResult<Chat>> {
        let chat = chat.clone();
        let chats = self.chats.clone();
        Box::pin(async move {
            let mut chats = chats.write().await;
            if !chats.contains_key(&chat.chat_id) {
                return Err(DomainError::NotFound);
            }
            chats.insert(chat.chat_id.clone(), chat.clone());
            Ok(chat)
        })
    }

    fn list_chats_by_patient(&self, patient_id: &str) -> BoxFuture<'_, DomainResult<Vec<Chat>>> {
        let patient_id = patient_id.to_string();
        let chats = self.chats.clone();
        Box::pin(async move {
            let chats = chats.read().await;
            let mut out: Vec<Chat> = chats
                .values()
                .filter(|chat| chat.patient_id == patient_id && !chat.is_deleted())
                .cloned()
                .collect();
            out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
            Ok(out)
        })
    }

    fn chat_alive(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let chat_id = chat_id.to_string();
        let chats = self.chats.clone();
        Box::pin(async move {
            Ok(chats
                .read()
                .await
                .get(&chat_id)
                .is_some_and(|chat| !chat.is_deleted()))
        })
    }

    fn create_message(&self, message: &ChatMessage) -> BoxFuture<'_, DomainResult<ChatMessage>> {
        let message = message.clone();
        let chats = self.chats.clone();
        let messages = self.messages.clone();
        Box::pin(async move {
            if !chats.read().await.contains_key(&message.chat_id) {
                return Err(DomainError::NotFound);
            }
            let mut messages = messages.write().await;
            let chat_messages = messages.entry(message.chat_id.clone()).or_default();
            if chat_messages
                .iter()
                .any(|existing| existing.message_id == message.message_id)
            {
                return Err(DomainError::Conflict);
            }
            chat_messages.push(message.clone());
            Ok(message)
        })
    }

    fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<ChatMessage>>> {
        let chat_id = chat_id.to_string();
        let message_id = message_id.to_string();
        let messages = self.messages.clone();
        Box::pin(async move {
            let messages = messages.read().await;
            Ok(messages.get(&chat_id).and_then(|chat_messages| {
                chat_messages
                    .iter()
                    .find(|message| message.message_id == message_id)
                    .cloned()
            }))
        })
    }

    fn list_messages(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<Vec<ChatMessage>>> {
        let chat_id = chat_id.to_string();
        let messages = self.messages.clone();
        Box::pin(async move {
            let messages = messages.read().await;
            Ok(messages
                .get(&chat_id)
                .map(|chat_messages| {
                    chat_messages
                        .iter()
                        .filter(|message| message.deleted_at_ms.is_none())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn list_messages_since(
        &self,
        chat_id: &str,
        since_message_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<Vec<ChatMessage>>> {
        let chat_id = chat_id.to_string();
        let since_message_id = since_message_id.map(ToOwned::to_owned);
        let messages = self.messages.clone();
        Box::pin(async move {
            let messages = messages.read().await;
            let Some(chat_messages) = messages.get(&chat_id) else {
                return Ok(Vec::new());
            };
            let start = match &since_message_id {
                Some(since) => chat_messages
                    .iter()
                    .position(|message| &message.message_id == since)
                    .map(|index| index + 1)
                    .unwrap_or(0),
                None => 0,
            };
            Ok(chat_messages[start..]
                .iter()
                .filter(|message| message.deleted_at_ms.is_none())
                .cloned()
                .collect())
        })
    }

    fn patient_message_span(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<(String, String)>>> {
        let chat_id = chat_id.to_string();
        let messages = self.messages.clone();
        Box::pin(async move {
            let messages = messages.read().await;
            let Some(chat_messages) = messages.get(&chat_id) else {
                return Ok(None);
            };
            let mut patient_ids = chat_messages
                .iter()
                .filter(|message| !message.from_ai && message.deleted_at_ms.is_none())
                .map(|message| message.message_id.clone());
            let Some(first) = patient_ids.next() else {
                return Ok(None);
            };
            let last = patient_ids.last().unwrap_or_else(|| first.clone());
            Ok(Some((first, last)))
        })
    }
}

#[derive(Default)]
pub struct InMemoryDiagnosisRepository {
    store: Arc<RwLock<HashMap<String, Diagnosis>>>,
}

impl InMemoryDiagnosisRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiagnosisRepository for InMemoryDiagnosisRepository {
    fn create(&self, diagnosis: &Diagnosis) -> BoxFuture<'_, DomainResult<Diagnosis>> {
        let diagnosis = diagnosis.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            if store.contains_key(&diagnosis.diagnosis_id) {
                return Err(DomainError::Conflict);
            }
            store.insert(diagnosis.diagnosis_id.clone(), diagnosis.clone());
            Ok(diagnosis)
        })
    }

    fn get(&self, diagnosis_id: &str) -> BoxFuture<'_, DomainResult<Option<Diagnosis>>> {
        let diagnosis_id = diagnosis_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.get(&diagnosis_id).cloned()) })
    }

    fn update(&self, diagnosis: &Diagnosis) -> BoxFuture<'_, DomainResult<Diagnosis>> {
        let diagnosis = diagnosis.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            if !store.contains_key(&diagnosis.diagnosis_id) {
                return Err(DomainError::NotFound);
            }
            store.insert(diagnosis.diagnosis_id.clone(), diagnosis.clone());
            Ok(diagnosis)
        })
    }

    fn list_by_chat(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<Vec<Diagnosis>>> {
        let chat_id = chat_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let store = store.read().await;
            let mut out: Vec<Diagnosis> = store
                .values()
                .filter(|diagnosis| {
                    diagnosis.chat_id == chat_id && diagnosis.deleted_at_ms.is_none()
                })
                .cloned()
                .collect();
            out.sort_by(|a, b| b.requested_at_ms.cmp(&a.requested_at_ms));
            Ok(out)
        })
    }

    fn has_pending(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let chat_id = chat_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            Ok(store.read().await.values().any(|diagnosis| {
                diagnosis.chat_id == chat_id
                    && diagnosis.deleted_at_ms.is_none()
                    && diagnosis.completed_at_ms.is_none()
            }))
        })
    }
}

#[derive(Default)]
pub struct InMemoryVerificationRepository {
    requests: Arc<RwLock<HashMap<String, VerificationRequest>>>,
    attachments: Arc<RwLock<HashMap<String, VerificationAttachment>>>,
}

impl InMemoryVerificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VerificationRepository for InMemoryVerificationRepository {
    fn create_request(
        &self,
        request: &VerificationRequest,
    ) -> BoxFuture<'_, DomainResult<VerificationRequest>> {
        let request = request.clone();
        let requests = self.requests.clone();
        Box::pin(async move {
            let mut requests = requests.write().await;
            if requests.contains_key(&request.request_id) {
                return Err(DomainError::Conflict);
            }
            requests.insert(request.request_id.clone(), request.clone());
            Ok(request)
        })
    }

    fn get_request(
        &self,
        request_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<VerificationRequest>>> {
        let request_id = request_id.to_string();
        let requests = self.requests.clone();
        Box::pin(async move { Ok(requests.read().await.get(&request_id).cloned()) })
    }

    fn update_request(
        &self,
        request: &VerificationRequest,
    ) -> BoxFuture<'_, DomainResult<VerificationRequest>> {
        let request = request.clone();
        let requests = self.requests.clone();
        Box::pin(async move {
            let mut requests = requests.write().await;
            if !requests.contains_key(&request.request_id) {
                return Err(DomainError::NotFound);
            }
            requests.insert(request.request_id.clone(), request.clone());
            Ok(request)
        })
    }

    fn get_pending_request_by_doctor(
        &self,
        doctor_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<VerificationRequest>>> {
        let doctor_id = doctor_id.to_string();
        let requests = self.requests.clone();
        Box::pin(async move {
            Ok(requests
                .read()
                .await
                .values()
                .find(|request| {
                    request.doctor_id == doctor_id
                        && request.status == VerificationStatus::Pending
                })
                .cloned())
        })
    }

    fn create_attachment(
        &self,
        attachment: &VerificationAttachment,
    ) -> BoxFuture<'_, DomainResult<VerificationAttachment>> {
        let attachment = attachment.clone();
        let attachments = self.attachments.clone();
        Box::pin(async move {
            let mut attachments = attachments.write().await;
            if attachments.contains_key(&attachment.attachment_id) {
                return Err(DomainError::Conflict);
            }
            attachments.insert(attachment.attachment_id.clone(), attachment.clone());
            Ok(attachment)
        })
    }

    fn get_attachment(
        &self,
        attachment_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<VerificationAttachment>>> {
        let attachment_id = attachment_id.to_string();
        let attachments = self.attachments.clone();
        Box::pin(async move { Ok(attachments.read().await.get(&attachment_id).cloned()) })
    }

    fn list_attachments(
        &self,
        request_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<VerificationAttachment>>> {
        let request_id = request_id.to_string();
        let attachments = self.attachments.clone();
        Box::pin(async move {
            let attachments = attachments.read().await;
            let mut out: Vec<VerificationAttachment> = attachments
                .values()
                .filter(|attachment| attachment.request_id == request_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| {
                a.uploaded_at_ms
                    .cmp(&b.uploaded_at_ms)
                    .then_with(|| a.attachment_id.cmp(&b.attachment_id))
            });
            Ok(out)
        })
    }
}
