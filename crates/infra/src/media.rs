//! Local-filesystem media adapters: chat audio, verification attachments,
//! ffmpeg transcoding and the reply-audio retention sweep.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::process::Command;
use tracing::{debug, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use telecare_domain::ports::BoxFuture;
use telecare_domain::ports::files::{AttachmentFiles, AudioTranscoder, FileStoreError, MediaStore};
use telecare_domain::util::uuid_v7_without_dashes;

use crate::config::AppConfig;

fn io_error(err: std::io::Error) -> FileStoreError {
    FileStoreError::Io(err.to_string())
}

/// Per-chat audio layout: raw uploads under the upload folder, synthesized
/// replies under the output folder as `<chat_id>/<message_id>.wav`.
#[derive(Clone)]
pub struct LocalMediaStore {
    upload_root: PathBuf,
    output_root: PathBuf,
}

impl LocalMediaStore {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            upload_root: PathBuf::from(&config.upload_folder),
            output_root: PathBuf::from(&config.ai_output_folder),
        }
    }

    pub fn new(upload_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
            output_root: output_root.into(),
        }
    }

    fn reply_path(&self, chat_id: &str, message_id: &str) -> PathBuf {
        self.output_root.join(chat_id).join(format!("{message_id}.wav"))
    }
}

impl MediaStore for LocalMediaStore {
    fn store_upload(
        &self,
        chat_id: &str,
        extension: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
        let dir = self.upload_root.join(chat_id);
        let path = dir.join(format!("{}.{extension}", uuid_v7_without_dashes()));
        Box::pin(async move {
            tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
            tokio::fs::write(&path, bytes).await.map_err(io_error)?;
            Ok(path)
        })
    }

    fn write_reply_audio(
        &self,
        chat_id: &str,
        message_id: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
        let dir = self.output_root.join(chat_id);
        let path = self.reply_path(chat_id, message_id);
        Box::pin(async move {
            tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
            tokio::fs::write(&path, bytes).await.map_err(io_error)?;
            Ok(path)
        })
    }

    fn read_reply_audio(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, Result<Vec<u8>, FileStoreError>> {
        let path = self.reply_path(chat_id, message_id);
        Box::pin(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(FileStoreError::NotFound(path.display().to_string()))
                }
                Err(err) => Err(io_error(err)),
            }
        })
    }

    fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), FileStoreError>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(io_error(err)),
            }
        })
    }
}

/// Shells out to ffmpeg: first a decode pass to reject non-audio uploads,
/// then a conversion to 16 kHz mono WAV. The raw upload is removed once the
/// conversion succeeds.
#[derive(Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
}

impl FfmpegTranscoder {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(), FileStoreError> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .await
            .map_err(|err| FileStoreError::Io(format!("spawn ffmpeg: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FileStoreError::InvalidAudio(stderr.trim().to_string()));
        }
        Ok(())
    }
}

impl AudioTranscoder for FfmpegTranscoder {
    fn to_canonical_wav(&self, input: &Path) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
        let input = input.to_path_buf();
        Box::pin(async move {
            let input_str = input.to_string_lossy().into_owned();
            self.run(&["-v", "error", "-i", &input_str, "-f", "null", "-"])
                .await?;

            let output = input.with_extension("16k.wav");
            let output_str = output.to_string_lossy().into_owned();
            self.run(&[
                "-y",
                "-v",
                "error",
                "-i",
                &input_str,
                "-ar",
                "16000",
                "-ac",
                "1",
                "-f",
                "wav",
                &output_str,
            ])
            .await?;

            if let Err(err) = tokio::fs::remove_file(&input).await {
                warn!(error = %err, "failed to remove raw upload after transcode");
            }
            Ok(output)
        })
    }
}

/// Attachment folders laid out as `<root>/<doctor_id>/<request_id>/<file>`.
#[derive(Clone)]
pub struct LocalAttachmentFiles {
    root: PathBuf,
}

impl LocalAttachmentFiles {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            root: PathBuf::from(&config.attachment_root),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn safe_segment(segment: &str) -> Result<&str, FileStoreError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(FileStoreError::Io(format!(
            "unsafe path segment: {segment}"
        )));
    }
    Ok(segment)
}

impl AttachmentFiles for LocalAttachmentFiles {
    fn write(
        &self,
        doctor_id: &str,
        request_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String, FileStoreError>> {
        let doctor_id = doctor_id.to_string();
        let request_id = request_id.to_string();
        let file_name = file_name.to_string();
        Box::pin(async move {
            safe_segment(&doctor_id)?;
            safe_segment(&request_id)?;
            safe_segment(&file_name)?;
            let dir = self.root.join(&doctor_id).join(&request_id);
            tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
            tokio::fs::write(dir.join(&file_name), bytes)
                .await
                .map_err(io_error)?;
            Ok(format!("{doctor_id}/{request_id}/{file_name}"))
        })
    }

    fn read(&self, relative_path: &str) -> BoxFuture<'_, Result<Vec<u8>, FileStoreError>> {
        let relative_path = relative_path.to_string();
        Box::pin(async move {
            for segment in relative_path.split('/') {
                safe_segment(segment)?;
            }
            let path = self.root.join(&relative_path);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(FileStoreError::NotFound(relative_path))
                }
                Err(err) => Err(io_error(err)),
            }
        })
    }

    fn purge(
        &self,
        doctor_id: &str,
        request_id: &str,
    ) -> BoxFuture<'_, Result<(), FileStoreError>> {
        let doctor_id = doctor_id.to_string();
        let request_id = request_id.to_string();
        Box::pin(async move {
            safe_segment(&doctor_id)?;
            safe_segment(&request_id)?;
            let dir = self.root.join(&doctor_id).join(&request_id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(io_error(err)),
            }
        })
    }
}

/// Bundles `(file_name, bytes)` pairs into a single zip archive in memory.
pub fn zip_bundle(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, FileStoreError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (file_name, bytes) in entries {
        writer
            .start_file(file_name, options)
            .map_err(|err| FileStoreError::Io(err.to_string()))?;
        writer
            .write_all(bytes)
            .map_err(|err| FileStoreError::Io(err.to_string()))?;
    }
    let cursor = writer
        .finish()
        .map_err(|err| FileStoreError::Io(err.to_string()))?;
    Ok(cursor.into_inner())
}

/// Periodically deletes synthesized reply audio older than the configured
/// TTL. Runs until the process shuts down.
pub async fn run_reply_audio_sweep(output_root: PathBuf, ttl: Duration, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = sweep_once(&output_root, ttl).await {
            warn!(error = %err, "reply audio sweep failed");
        }
    }
}

async fn sweep_once(output_root: &Path, ttl: Duration) -> std::io::Result<()> {
    let cutoff = SystemTime::now().checked_sub(ttl);
    let Some(cutoff) = cutoff else {
        return Ok(());
    };
    let mut chats = match tokio::fs::read_dir(output_root).await {
        Ok(chats) => chats,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let mut removed = 0usize;
    while let Some(chat_dir) = chats.next_entry().await? {
        if !chat_dir.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(chat_dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let metadata = file.metadata().await?;
            let modified = metadata.modified()?;
            if modified < cutoff {
                if let Err(err) = tokio::fs::remove_file(file.path()).await {
                    warn!(path = %file.path().display(), error = %err, "failed to remove expired reply audio");
                } else {
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        debug!(removed, "expired reply audio removed");
    }
    Ok(())
}
