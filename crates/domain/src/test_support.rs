//! In-memory repository fakes shared by the unit tests in this crate.
//!
//! These live behind `cfg(test)` so the library itself carries no test
//! scaffolding. The integration tests under `tests/` exercise the real
//! infrastructure backends instead.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::DomainResult;
use crate::chat::{Chat, ChatMessage};
use crate::diagnosis::Diagnosis;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::chat::ChatRepository;
use crate::ports::diagnosis::DiagnosisRepository;
use crate::ports::verification::VerificationRepository;
use crate::verification::{VerificationAttachment, VerificationRequest, VerificationStatus};

#[derive(Default)]
pub struct MemoryChatRepository {
    chats: Mutex<HashMap<String, Chat>>,
    // Messages per chat in insertion order.
    messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatRepository for MemoryChatRepository {
    fn create_chat(&self, chat: &Chat) -> BoxFuture<'_, DomainResult<Chat>> {
        let chat = chat.clone();
        Box::pin(async move {
            let mut chats = self.chats.lock().expect("chats");
            if chats.contains_key(&chat.chat_id) {
                return Err(DomainError::Conflict);
            }
            chats.insert(chat.chat_id.clone(), chat.clone());
            Ok(chat)
        })
    }

    fn get_chat(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<Option<Chat>>> {
        let chat_id = chat_id.to_string();
        Box::pin(async move { Ok(self.chats.lock().expect("chats").get(&chat_id).cloned()) })
    }

    fn update_chat(&self, chat: &Chat) -> BoxFuture<'_, DomainResult<Chat>> {
        let chat = chat.clone();
        Box::pin(async move {
            let mut chats = self.chats.lock().expect("chats");
            if !chats.contains_key(&chat.chat_id) {
                return Err(DomainError::NotFound);
            }
            chats.insert(chat.chat_id.clone(), chat.clone());
            Ok(chat)
        })
    }

    fn list_chats_by_patient(&self, patient_id: &str) -> BoxFuture<'_, DomainResult<Vec<Chat>>> {
        let patient_id = patient_id.to_string();
        Box::pin(async move {
            let chats = self.chats.lock().expect("chats");
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
        Box::pin(async move {
            Ok(self
                .chats
                .lock()
                .expect("chats")
                .get(&chat_id)
                .is_some_and(|chat| !chat.is_deleted()))
        })
    }

    fn create_message(&self, message: &ChatMessage) -> BoxFuture<'_, DomainResult<ChatMessage>> {
        let message = message.clone();
        Box::pin(async move {
            if !self
                .chats
                .lock()
                .expect("chats")
                .contains_key(&message.chat_id)
            {
                return Err(DomainError::NotFound);
            }
            let mut messages = self.messages.lock().expect("messages");
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
        Box::pin(async move {
            let messages = self.messages.lock().expect("messages");
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
        Box::pin(async move {
            let messages = self.messages.lock().expect("messages");
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
        Box::pin(async move {
            let messages = self.messages.lock().expect("messages");
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
        Box::pin(async move {
            let messages = self.messages.lock().expect("messages");
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
pub struct MemoryDiagnosisRepository {
    store: Mutex<HashMap<String, Diagnosis>>,
}

impl MemoryDiagnosisRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiagnosisRepository for MemoryDiagnosisRepository {
    fn create(&self, diagnosis: &Diagnosis) -> BoxFuture<'_, DomainResult<Diagnosis>> {
        let diagnosis = diagnosis.clone();
        Box::pin(async move {
            let mut store = self.store.lock().expect("diagnoses");
            if store.contains_key(&diagnosis.diagnosis_id) {
                return Err(DomainError::Conflict);
            }
            store.insert(diagnosis.diagnosis_id.clone(), diagnosis.clone());
            Ok(diagnosis)
        })
    }

    fn get(&self, diagnosis_id: &str) -> BoxFuture<'_, DomainResult<Option<Diagnosis>>> {
        let diagnosis_id = diagnosis_id.to_string();
        Box::pin(async move {
            Ok(self
                .store
                .lock()
                .expect("diagnoses")
                .get(&diagnosis_id)
                .cloned())
        })
    }

    fn update(&self, diagnosis: &Diagnosis) -> BoxFuture<'_, DomainResult<Diagnosis>> {
        let diagnosis = diagnosis.clone();
        Box::pin(async move {
            let mut store = self.store.lock().expect("diagnoses");
            if !store.contains_key(&diagnosis.diagnosis_id) {
                return Err(DomainError::NotFound);
            }
            store.insert(diagnosis.diagnosis_id.clone(), diagnosis.clone());
            Ok(diagnosis)
        })
    }

    fn list_by_chat(&self, chat_id: &str) -> BoxFuture<'_, DomainResult<Vec<Diagnosis>>> {
        let chat_id = chat_id.to_string();
        Box::pin(async move {
            let store = self.store.lock().expect("diagnoses");
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
        Box::pin(async move {
            Ok(self
                .store
                .lock()
                .expect("diagnoses")
                .values()
                .any(|diagnosis| {
                    diagnosis.chat_id == chat_id
                        && diagnosis.deleted_at_ms.is_none()
                        && diagnosis.completed_at_ms.is_none()
                }))
        })
    }
}

#[derive(Default)]
pub struct MemoryVerificationRepository {
    requests: Mutex<HashMap<String, VerificationRequest>>,
    attachments: Mutex<HashMap<String, VerificationAttachment>>,
}

impl MemoryVerificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VerificationRepository for MemoryVerificationRepository {
    fn create_request(
        &self,
        request: &VerificationRequest,
    ) -> BoxFuture<'_, DomainResult<VerificationRequest>> {
        let request = request.clone();
        Box::pin(async move {
            let mut requests = self.requests.lock().expect("requests");
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
        Box::pin(async move {
            Ok(self
                .requests
                .lock()
                .expect("requests")
                .get(&request_id)
                .cloned())
        })
    }

    fn update_request(
        &self,
        request: &VerificationRequest,
    ) -> BoxFuture<'_, DomainResult<VerificationRequest>> {
        let request = request.clone();
        Box::pin(async move {
            let mut requests = self.requests.lock().expect("requests");
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
        Box::pin(async move {
            Ok(self
                .requests
                .lock()
                .expect("requests")
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
        Box::pin(async move {
            let mut attachments = self.attachments.lock().expect("attachments");
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
        Box::pin(async move {
            Ok(self
                .attachments
                .lock()
                .expect("attachments")
                .get(&attachment_id)
                .cloned())
        })
    }

    fn list_attachments(
        &self,
        request_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<VerificationAttachment>>> {
        let request_id = request_id.to_string();
        Box::pin(async move {
            let attachments = self.attachments.lock().expect("attachments");
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
