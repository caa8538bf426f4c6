use crate::DomainResult;
use crate::verification::{VerificationAttachment, VerificationRequest};

pub trait VerificationRepository: Send + Sync {
    fn create_request(
        &self,
        request: &VerificationRequest,
    ) -> crate::ports::BoxFuture<'_, DomainResult<VerificationRequest>>;

    fn get_request(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<VerificationRequest>>>;

    fn update_request(
        &self,
        request: &VerificationRequest,
    ) -> crate::ports::BoxFuture<'_, DomainResult<VerificationRequest>>;

    fn get_pending_request_by_doctor(
        &self,
        doctor_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<VerificationRequest>>>;

    fn create_attachment(
        &self,
        attachment: &VerificationAttachment,
    ) -> crate::ports::BoxFuture<'_, DomainResult<VerificationAttachment>>;

    fn get_attachment(
        &self,
        attachment_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<VerificationAttachment>>>;

    /// Attachments of a request in upload order.
    fn list_attachments(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<VerificationAttachment>>>;
}
