use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::{ActorIdentity, Role};
use crate::locks::KeyedRwLock;
use crate::ports::files::AttachmentFiles;
use crate::ports::verification::VerificationRepository;
use crate::util::{now_ms, uuid_v7_without_dashes};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerificationRequest {
    pub request_id: String,
    pub doctor_id: String,
    pub status: VerificationStatus,
    pub submitted_at_ms: i64,
    pub reviewed_at_ms: Option<i64>,
    pub rejection_note: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerificationAttachment {
    pub attachment_id: String,
    pub request_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub uploaded_at_ms: i64,
}

/// Doctor verification requests plus the credential files backing them.
///
/// Every file access goes through a per-request reader-writer lock so a
/// rejection (which deletes the whole folder) can never race a download or
/// an archive that is mid-read.
#[derive(Clone)]
pub struct AttachmentVault {
    repository: Arc<dyn VerificationRepository>,
    files: Arc<dyn AttachmentFiles>,
    folder_locks: KeyedRwLock<String>,
}

impl AttachmentVault {
    pub fn new(
        repository: Arc<dyn VerificationRepository>,
        files: Arc<dyn AttachmentFiles>,
        folder_locks: KeyedRwLock<String>,
    ) -> Self {
        Self {
            repository,
            files,
            folder_locks,
        }
    }

    /// Opens a verification request and stores its credential files. One
    /// pending request per doctor at a time.
    pub async fn submit_request(
        &self,
        actor: &ActorIdentity,
        uploads: Vec<(String, Vec<u8>)>,
    ) -> DomainResult<VerificationRequest> {
        require_role(actor, Role::Doctor)?;
        if uploads.is_empty() {
            return Err(DomainError::Validation(
                "at least one credential file is required".into(),
            ));
        }
        if self
            .repository
            .get_pending_request_by_doctor(&actor.user_id)
            .await?
            .is_some()
        {
            return Err(DomainError::Conflict);
        }

        let request = VerificationRequest {
            request_id: uuid_v7_without_dashes(),
            doctor_id: actor.user_id.clone(),
            status: VerificationStatus::Pending,
            submitted_at_ms: now_ms(),
            reviewed_at_ms: None,
            rejection_note: None,
        };
        let request = self.repository.create_request(&request).await?;

        let _guard = self.folder_locks.write(&request.request_id).await;
        for (file_name, bytes) in uploads {
            let relative_path = self
                .files
                .write(&request.doctor_id, &request.request_id, &file_name, bytes)
                .await?;
            let attachment = VerificationAttachment {
                attachment_id: uuid_v7_without_dashes(),
                request_id: request.request_id.clone(),
                file_name,
                relative_path,
                uploaded_at_ms: now_ms(),
            };
            self.repository.create_attachment(&attachment).await?;
        }
        info!(request_id = %request.request_id, doctor_id = %request.doctor_id, "verification request submitted");
        Ok(request)
    }

    /// One attachment's bytes, readable while the request is pending or
    /// already approved.
    pub async fn fetch_attachment(
        &self,
        actor: &ActorIdentity,
        attachment_id: &str,
    ) -> DomainResult<(String, Vec<u8>)> {
        require_role(actor, Role::Admin)?;
        let attachment = self
            .repository
            .get_attachment(attachment_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let request = self.viewable_request(&attachment.request_id).await?;

        let _guard = self.folder_locks.read(&request.request_id).await;
        let bytes = self.files.read(&attachment.relative_path).await?;
        Ok((attachment.file_name, bytes))
    }

    /// Every attachment of a request as `(file_name, bytes)` pairs, read
    /// under a single reader scope so the set is internally consistent.
    pub async fn archive_attachments(
        &self,
        actor: &ActorIdentity,
        request_id: &str,
    ) -> DomainResult<Vec<(String, Vec<u8>)>> {
        require_role(actor, Role::Admin)?;
        let request = self.viewable_request(request_id).await?;

        let _guard = self.folder_locks.read(&request.request_id).await;
        let attachments = self.repository.list_attachments(request_id).await?;
        if attachments.is_empty() {
            return Err(DomainError::NotFound);
        }
        let mut bundle = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let bytes = self.files.read(&attachment.relative_path).await?;
            bundle.push((attachment.file_name, bytes));
        }
        Ok(bundle)
    }

    pub async fn approve(
        &self,
        actor: &ActorIdentity,
        request_id: &str,
    ) -> DomainResult<VerificationRequest> {
        require_role(actor, Role::Admin)?;
        let mut request = self.pending_request(request_id).await?;
        request.status = VerificationStatus::Approved;
        request.reviewed_at_ms = Some(now_ms());
        let request = self.repository.update_request(&request).await?;
        info!(request_id = %request.request_id, "verification request approved");
        Ok(request)
    }

    /// Rejects a pending request and deletes its folder. The writer scope
    /// waits out any in-flight download or archive first.
    pub async fn reject(
        &self,
        actor: &ActorIdentity,
        request_id: &str,
        note: Option<String>,
    ) -> DomainResult<VerificationRequest> {
        require_role(actor, Role::Admin)?;
        let mut request = self.pending_request(request_id).await?;

        {
            let _guard = self.folder_locks.write(&request.request_id).await;
            self.files
                .purge(&request.doctor_id, &request.request_id)
                .await?;
        }

        request.status = VerificationStatus::Rejected;
        request.reviewed_at_ms = Some(now_ms());
        request.rejection_note = note;
        let request = self.repository.update_request(&request).await?;
        info!(request_id = %request.request_id, "verification request rejected");
        Ok(request)
    }

    async fn pending_request(&self, request_id: &str) -> DomainResult<VerificationRequest> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if request.status != VerificationStatus::Pending {
            return Err(DomainError::Conflict);
        }
        Ok(request)
    }

    async fn viewable_request(&self, request_id: &str) -> DomainResult<VerificationRequest> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        // Rejected requests have no files left on disk.
        if request.status == VerificationStatus::Rejected {
            return Err(DomainError::NotFound);
        }
        Ok(request)
    }
}

fn require_role(actor: &ActorIdentity, role: Role) -> DomainResult<()> {
    if actor.role != role {
        return Err(DomainError::NotFound);
    }
    Ok(())
}
