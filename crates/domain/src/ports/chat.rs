use crate::DomainResult;
use crate::chat::{Chat, ChatMessage};

pub trait ChatRepository: Send + Sync {
    fn create_chat(&self, chat: &Chat) -> crate::ports::BoxFuture<'_, DomainResult<Chat>>;

    fn get_chat(&self, chat_id: &str) -> crate::ports::BoxFuture<'_, DomainResult<Option<Chat>>>;

    fn update_chat(&self, chat: &Chat) -> crate::ports::BoxFuture<'_, DomainResult<Chat>>;

    fn list_chats_by_patient(
        &self,
        patient_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Chat>>>;

    /// Point-in-time check that the chat exists and is not soft-deleted.
    fn chat_alive(&self, chat_id: &str) -> crate::ports::BoxFuture<'_, DomainResult<bool>>;

    fn create_message(
        &self,
        message: &ChatMessage,
    ) -> crate::ports::BoxFuture<'_, DomainResult<ChatMessage>>;

    fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<ChatMessage>>>;

    /// Non-deleted messages of a chat, ordered oldest first.
    fn list_messages(
        &self,
        chat_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<ChatMessage>>>;

    /// Messages strictly after the given id, ordered oldest first. `None`
    /// returns the full history.
    fn list_messages_since(
        &self,
        chat_id: &str,
        since_message_id: Option<&str>,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<ChatMessage>>>;

    /// First and last non-deleted patient message ids, if any.
    fn patient_message_span(
        &self,
        chat_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<(String, String)>>>;
}
