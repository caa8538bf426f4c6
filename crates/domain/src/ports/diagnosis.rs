use crate::DomainResult;
use crate::diagnosis::Diagnosis;

pub trait DiagnosisRepository: Send + Sync {
    fn create(&self, diagnosis: &Diagnosis) -> crate::ports::BoxFuture<'_, DomainResult<Diagnosis>>;

    fn get(
        &self,
        diagnosis_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Diagnosis>>>;

    fn update(&self, diagnosis: &Diagnosis) -> crate::ports::BoxFuture<'_, DomainResult<Diagnosis>>;

    /// Non-deleted diagnoses for a chat, newest request first.
    fn list_by_chat(
        &self,
        chat_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Diagnosis>>>;

    /// True when the chat has a non-deleted diagnosis with no completion
    /// timestamp yet.
    fn has_pending(&self, chat_id: &str) -> crate::ports::BoxFuture<'_, DomainResult<bool>>;
}
