use std::path::{Path, PathBuf};

use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file io error: {0}")]
    Io(String),
    #[error("invalid or unsupported audio: {0}")]
    InvalidAudio(String),
    #[error("file not found: {0}")]
    NotFound(String),
}

impl From<FileStoreError> for DomainError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Io(message) => DomainError::Storage(message),
            FileStoreError::InvalidAudio(message) => DomainError::Validation(message),
            FileStoreError::NotFound(_) => DomainError::NotFound,
        }
    }
}

/// Per-chat audio file area: raw uploads and synthesized replies.
pub trait MediaStore: Send + Sync {
    fn store_upload(
        &self,
        chat_id: &str,
        extension: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>>;

    fn write_reply_audio(
        &self,
        chat_id: &str,
        message_id: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>>;

    fn read_reply_audio(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, Result<Vec<u8>, FileStoreError>>;

    fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), FileStoreError>>;
}

/// Validates an uploaded audio blob and converts it to the canonical
/// encoding expected by the analysis service (16 kHz mono WAV). The input
/// file is removed once converted.
pub trait AudioTranscoder: Send + Sync {
    fn to_canonical_wav(&self, input: &Path) -> BoxFuture<'_, Result<PathBuf, FileStoreError>>;
}

/// File area for verification-request attachments, one private folder per
/// request. All access goes through the vault's reader-writer lock.
pub trait AttachmentFiles: Send + Sync {
    /// Writes one file and returns its path relative to the attachment root.
    fn write(
        &self,
        doctor_id: &str,
        request_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String, FileStoreError>>;

    fn read(&self, relative_path: &str) -> BoxFuture<'_, Result<Vec<u8>, FileStoreError>>;

    /// Recursively deletes the request folder. Missing folders are fine.
    fn purge(
        &self,
        doctor_id: &str,
        request_id: &str,
    ) -> BoxFuture<'_, Result<(), FileStoreError>>;
}
