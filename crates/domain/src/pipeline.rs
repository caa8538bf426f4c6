//! Orchestration of the asynchronous AI pipelines.
//!
//! Each pipeline follows the same accept/spawn shape: validate and persist
//! synchronously under a per-chat try-lock, return an acknowledgement to the
//! caller, then run the model stages on a detached task that reports through
//! the notification channel. The try-lock admits one in-flight run per chat
//! per pipeline family; a second request is rejected immediately rather than
//! queued.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::DomainResult;
use crate::chat::{Chat, ChatMessage, MessageKind, VoiceAnalysis, validate_message_content};
use crate::diagnosis::{Diagnosis, DiagnosisOutcome};
use crate::error::DomainError;
use crate::events::ChatEvent;
use crate::identity::ActorIdentity;
use crate::locks::{KeyedMutex, ProgressTracker};
use crate::ports::ai::{
    AudioAnalyzer, DiagnosisModel, LanguageModel, SpeechSynthesizer, TranscriptEntry,
};
use crate::ports::chat::ChatRepository;
use crate::ports::diagnosis::DiagnosisRepository;
use crate::ports::files::{AudioTranscoder, MediaStore};
use crate::ports::notify::NotificationChannel;
use crate::util::{now_ms, uuid_v7_without_dashes};

pub const MAX_VOICE_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Accepted upload MIME types, mapped to the extension the raw blob is
/// stored under before transcoding.
const VOICE_MIME_TYPES: &[(&str, &str)] = &[
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/webm", "webm"),
    ("video/webm", "webm"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/flac", "flac"),
    ("audio/x-matroska", "mka"),
];

/// Synchronous acknowledgement for an accepted text message.
#[derive(Clone, Debug, Serialize)]
pub struct ResponseReceipt {
    pub chat_id: String,
    pub message_id: String,
    pub created_at_ms: i64,
}

pub struct VoiceUpload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Everything the orchestrator talks to. Grouped so construction sites stay
/// readable.
pub struct PipelineDeps {
    pub chats: Arc<dyn ChatRepository>,
    pub diagnoses: Arc<dyn DiagnosisRepository>,
    pub language_model: Arc<dyn LanguageModel>,
    pub diagnosis_model: Arc<dyn DiagnosisModel>,
    pub analyzer: Arc<dyn AudioAnalyzer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub media: Arc<dyn MediaStore>,
    pub transcoder: Arc<dyn AudioTranscoder>,
    pub notifier: Arc<dyn NotificationChannel>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    chats: Arc<dyn ChatRepository>,
    diagnoses: Arc<dyn DiagnosisRepository>,
    language_model: Arc<dyn LanguageModel>,
    diagnosis_model: Arc<dyn DiagnosisModel>,
    analyzer: Arc<dyn AudioAnalyzer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    media: Arc<dyn MediaStore>,
    transcoder: Arc<dyn AudioTranscoder>,
    notifier: Arc<dyn NotificationChannel>,
    response_locks: KeyedMutex<String>,
    diagnosis_locks: KeyedMutex<String>,
    response_tracker: ProgressTracker<String>,
    diagnosis_tracker: ProgressTracker<String>,
    stage_timeout: Duration,
}

/// Releases a run's lock and progress flag when dropped, on every exit path
/// of the run including panics inside the detached task.
struct RunCleanup {
    locks: KeyedMutex<String>,
    tracker: ProgressTracker<String>,
    chat_id: String,
}

impl RunCleanup {
    fn start(locks: &KeyedMutex<String>, tracker: &ProgressTracker<String>, chat_id: &str) -> Self {
        tracker.start(&chat_id.to_string());
        Self {
            locks: locks.clone(),
            tracker: tracker.clone(),
            chat_id: chat_id.to_string(),
        }
    }
}

impl Drop for RunCleanup {
    fn drop(&mut self) {
        self.tracker.complete(&self.chat_id);
        self.locks.release(&self.chat_id);
    }
}

impl PipelineOrchestrator {
    pub fn new(deps: PipelineDeps, stage_timeout: Duration) -> Self {
        Self {
            chats: deps.chats,
            diagnoses: deps.diagnoses,
            language_model: deps.language_model,
            diagnosis_model: deps.diagnosis_model,
            analyzer: deps.analyzer,
            synthesizer: deps.synthesizer,
            media: deps.media,
            transcoder: deps.transcoder,
            notifier: deps.notifier,
            response_locks: KeyedMutex::new(),
            diagnosis_locks: KeyedMutex::new(),
            response_tracker: ProgressTracker::new(),
            diagnosis_tracker: ProgressTracker::new(),
            stage_timeout,
        }
    }

    pub fn is_response_in_progress(&self, chat_id: &str) -> bool {
        self.response_tracker.is_active(&chat_id.to_string())
    }

    pub fn is_diagnosis_in_progress(&self, chat_id: &str) -> bool {
        self.diagnosis_tracker.is_active(&chat_id.to_string())
    }

    /// Accepts a text message: persists it, echoes it to subscribers, and
    /// schedules the reply generation. Returns [`DomainError::Busy`] while a
    /// previous response run for the chat is still in flight.
    pub async fn try_start_text_response(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
        content: &str,
    ) -> DomainResult<ResponseReceipt> {
        let content = validate_message_content(content)?;
        self.owned_alive_chat(actor, chat_id).await?;

        if !self.response_locks.try_acquire(&chat_id.to_string()) {
            return Err(DomainError::Busy);
        }
        let cleanup = RunCleanup::start(&self.response_locks, &self.response_tracker, chat_id);

        let message = ChatMessage {
            chat_id: chat_id.to_string(),
            message_id: uuid_v7_without_dashes(),
            content,
            kind: MessageKind::Text,
            from_ai: false,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
            voice_analysis: None,
        };
        let message = self.chats.create_message(&message).await?;
        self.notifier
            .push(
                chat_id,
                &ChatEvent::MessageReceived {
                    chat_id: message.chat_id.clone(),
                    message_id: message.message_id.clone(),
                    content: message.content.clone(),
                    kind: message.kind,
                    created_at_ms: message.created_at_ms,
                },
            )
            .await;

        let receipt = ResponseReceipt {
            chat_id: message.chat_id.clone(),
            message_id: message.message_id.clone(),
            created_at_ms: message.created_at_ms,
        };

        let this = self.clone();
        tokio::spawn(async move {
            let _cleanup = cleanup;
            if let Err(err) = this.text_reply_stages(&message).await {
                warn!(chat_id = %message.chat_id, error = %err, "text response pipeline failed");
                this.push_response_failure(&message.chat_id, &err).await;
            }
        });

        Ok(receipt)
    }

    async fn text_reply_stages(&self, user_message: &ChatMessage) -> DomainResult<()> {
        let chat_id = &user_message.chat_id;
        let reply = self
            .stage(
                "language model",
                self.language_model.generate_response(
                    &user_message.content,
                    &user_message.message_id,
                    chat_id,
                ),
            )
            .await?;

        if !self.chats.chat_alive(chat_id).await? {
            info!(chat_id = %chat_id, "chat deleted mid-run, discarding reply");
            return Ok(());
        }

        let ai_message = self
            .persist_ai_message(chat_id, reply, MessageKind::Text)
            .await?;
        self.notifier
            .push(
                chat_id,
                &ChatEvent::AiResponseReady {
                    chat_id: ai_message.chat_id.clone(),
                    message_id: ai_message.message_id.clone(),
                    content: ai_message.content.clone(),
                    kind: ai_message.kind,
                    created_at_ms: ai_message.created_at_ms,
                },
            )
            .await;
        Ok(())
    }

    /// Accepts a voice upload: validates and transcodes it synchronously,
    /// then schedules analysis, reply generation and speech synthesis. The
    /// transcript echo arrives through the notification channel once the
    /// audio has been analyzed.
    pub async fn try_start_voice_response(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
        upload: VoiceUpload,
    ) -> DomainResult<()> {
        let extension = voice_extension(&upload.mime_type)?;
        if upload.bytes.is_empty() {
            return Err(DomainError::Validation("audio file is required".into()));
        }
        if upload.bytes.len() > MAX_VOICE_UPLOAD_BYTES {
            return Err(DomainError::Validation(format!(
                "audio file exceeds max size of {MAX_VOICE_UPLOAD_BYTES} bytes"
            )));
        }
        self.owned_alive_chat(actor, chat_id).await?;

        if !self.response_locks.try_acquire(&chat_id.to_string()) {
            return Err(DomainError::Busy);
        }
        let cleanup = RunCleanup::start(&self.response_locks, &self.response_tracker, chat_id);

        let raw_path = self
            .media
            .store_upload(chat_id, extension, upload.bytes)
            .await?;
        let wav_path = match self.transcoder.to_canonical_wav(&raw_path).await {
            Ok(path) => path,
            Err(err) => {
                if let Err(remove_err) = self.media.remove(&raw_path).await {
                    warn!(error = %remove_err, "failed to remove rejected upload");
                }
                return Err(err.into());
            }
        };

        let this = self.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            let _cleanup = cleanup;
            if let Err(err) = this.voice_reply_stages(&chat_id, &wav_path).await {
                warn!(chat_id = %chat_id, error = %err, "voice response pipeline failed");
                this.push_response_failure(&chat_id, &err).await;
            }
        });

        Ok(())
    }

    async fn voice_reply_stages(
        &self,
        chat_id: &str,
        wav_path: &std::path::Path,
    ) -> DomainResult<()> {
        let analysis = self
            .stage("audio analysis", self.analyzer.analyze(wav_path))
            .await;
        if let Err(remove_err) = self.media.remove(wav_path).await {
            warn!(error = %remove_err, "failed to remove analyzed wav");
        }
        let analysis = analysis?;

        if !self.chats.chat_alive(chat_id).await? {
            info!(chat_id = %chat_id, "chat deleted mid-run, discarding analysis");
            return Ok(());
        }

        let llm_prompt = format!(
            "[voice message, dominant emotion: {}] {}",
            analysis.dominant_emotion, analysis.transcript
        );
        let user_message = ChatMessage {
            chat_id: chat_id.to_string(),
            message_id: uuid_v7_without_dashes(),
            content: analysis.transcript.clone(),
            kind: MessageKind::VoiceText,
            from_ai: false,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
            voice_analysis: Some(VoiceAnalysis {
                transcript: analysis.transcript,
                dominant_emotion: analysis.dominant_emotion,
                llm_prompt: llm_prompt.clone(),
            }),
        };
        let user_message = self.chats.create_message(&user_message).await?;
        self.notifier
            .push(
                chat_id,
                &ChatEvent::MessageReceived {
                    chat_id: user_message.chat_id.clone(),
                    message_id: user_message.message_id.clone(),
                    content: user_message.content.clone(),
                    kind: user_message.kind,
                    created_at_ms: user_message.created_at_ms,
                },
            )
            .await;

        let reply = self
            .stage(
                "language model",
                self.language_model.generate_response(
                    &llm_prompt,
                    &user_message.message_id,
                    chat_id,
                ),
            )
            .await?;
        let reply_audio = self
            .stage("speech synthesis", self.synthesizer.synthesize(&reply))
            .await?;

        if !self.chats.chat_alive(chat_id).await? {
            info!(chat_id = %chat_id, "chat deleted mid-run, discarding reply");
            return Ok(());
        }

        let ai_message = self
            .persist_ai_message(chat_id, reply, MessageKind::VoiceText)
            .await?;
        self.media
            .write_reply_audio(chat_id, &ai_message.message_id, reply_audio)
            .await?;
        self.notifier
            .push(
                chat_id,
                &ChatEvent::AiAudioReady {
                    chat_id: ai_message.chat_id.clone(),
                    message_id: ai_message.message_id.clone(),
                },
            )
            .await;
        self.notifier
            .push(
                chat_id,
                &ChatEvent::AiResponseReady {
                    chat_id: ai_message.chat_id.clone(),
                    message_id: ai_message.message_id.clone(),
                    content: ai_message.content.clone(),
                    kind: ai_message.kind,
                    created_at_ms: ai_message.created_at_ms,
                },
            )
            .await;
        Ok(())
    }

    /// Opens a diagnosis over the chat's current patient messages and
    /// schedules the model call. At most one open diagnosis per chat: a
    /// pending row is a [`DomainError::Conflict`], an in-flight run a
    /// [`DomainError::Busy`].
    pub async fn try_start_diagnosis(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
    ) -> DomainResult<Diagnosis> {
        self.owned_alive_chat(actor, chat_id).await?;
        let (from_message_id, to_message_id) = self
            .chats
            .patient_message_span(chat_id)
            .await?
            .ok_or_else(|| {
                DomainError::Validation("chat has no patient messages to diagnose".into())
            })?;
        if self.diagnoses.has_pending(chat_id).await? {
            return Err(DomainError::Conflict);
        }

        if !self.diagnosis_locks.try_acquire(&chat_id.to_string()) {
            return Err(DomainError::Busy);
        }
        let cleanup = RunCleanup::start(&self.diagnosis_locks, &self.diagnosis_tracker, chat_id);

        let diagnosis = Diagnosis {
            diagnosis_id: uuid_v7_without_dashes(),
            chat_id: chat_id.to_string(),
            requested_at_ms: now_ms(),
            completed_at_ms: None,
            from_message_id,
            to_message_id,
            diagnosed_problem: None,
            reasoning: None,
            prescriptions: Vec::new(),
            failure_reason: None,
            deleted_at_ms: None,
        };
        let diagnosis = self.diagnoses.create(&diagnosis).await?;

        let this = self.clone();
        let spawned = diagnosis.clone();
        tokio::spawn(async move {
            let _cleanup = cleanup;
            if let Err(err) = this.diagnosis_stages(&spawned).await {
                warn!(chat_id = %spawned.chat_id, diagnosis_id = %spawned.diagnosis_id, error = %err, "diagnosis pipeline failed");
                this.record_diagnosis_failure(spawned, &err).await;
            }
        });

        Ok(diagnosis)
    }

    async fn diagnosis_stages(&self, diagnosis: &Diagnosis) -> DomainResult<()> {
        let chat_id = &diagnosis.chat_id;
        let transcript: Vec<TranscriptEntry> = self
            .chats
            .list_messages(chat_id)
            .await?
            .into_iter()
            .map(|message| TranscriptEntry {
                content: message.content,
                from_ai: message.from_ai,
            })
            .collect();

        let outcome = self
            .stage(
                "diagnosis model",
                self.diagnosis_model
                    .generate_diagnosis(chat_id, &diagnosis.diagnosis_id, &transcript),
            )
            .await?;

        if !self.chats.chat_alive(chat_id).await? {
            info!(chat_id = %chat_id, "chat deleted mid-run, discarding diagnosis");
            return Ok(());
        }

        let mut completed = diagnosis.clone();
        completed.apply_outcome(outcome);
        let completed = self.diagnoses.update(&completed).await?;

        self.notifier
            .push(
                chat_id,
                &ChatEvent::DiagnosisReady {
                    chat_id: completed.chat_id.clone(),
                    diagnosis_id: completed.diagnosis_id.clone(),
                    diagnosed_problem: completed.diagnosed_problem.clone(),
                    reasoning: completed.reasoning.clone(),
                    prescriptions: completed
                        .prescriptions
                        .iter()
                        .map(|prescription| prescription.content.clone())
                        .collect(),
                    failure_reason: completed.failure_reason.clone(),
                    requested_at_ms: completed.requested_at_ms,
                    completed_at_ms: completed.completed_at_ms.unwrap_or_else(now_ms),
                },
            )
            .await;
        Ok(())
    }

    /// Closes the diagnosis row with the failure reason so it stops counting
    /// as pending, then reports the failure to subscribers.
    async fn record_diagnosis_failure(&self, mut diagnosis: Diagnosis, err: &DomainError) {
        let reason = err.to_string();
        diagnosis.apply_outcome(DiagnosisOutcome::Failure {
            reason: reason.clone(),
        });
        if let Err(update_err) = self.diagnoses.update(&diagnosis).await {
            warn!(diagnosis_id = %diagnosis.diagnosis_id, error = %update_err, "failed to record diagnosis failure");
        }
        self.notifier
            .push(
                &diagnosis.chat_id,
                &ChatEvent::DiagnosisFailed {
                    chat_id: diagnosis.chat_id.clone(),
                    diagnosis_id: diagnosis.diagnosis_id.clone(),
                    reason,
                },
            )
            .await;
    }

    async fn push_response_failure(&self, chat_id: &str, err: &DomainError) {
        self.notifier
            .push(
                chat_id,
                &ChatEvent::AiResponseFailed {
                    chat_id: chat_id.to_string(),
                    reason: err.to_string(),
                },
            )
            .await;
    }

    async fn persist_ai_message(
        &self,
        chat_id: &str,
        content: String,
        kind: MessageKind,
    ) -> DomainResult<ChatMessage> {
        let message = ChatMessage {
            chat_id: chat_id.to_string(),
            message_id: uuid_v7_without_dashes(),
            content,
            kind,
            from_ai: true,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
            voice_analysis: None,
        };
        self.chats.create_message(&message).await
    }

    async fn owned_alive_chat(&self, actor: &ActorIdentity, chat_id: &str) -> DomainResult<Chat> {
        let chat = self
            .chats
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted())
            .ok_or(DomainError::NotFound)?;
        if chat.patient_id != actor.user_id {
            return Err(DomainError::NotFound);
        }
        Ok(chat)
    }

    /// Runs one model stage under the configured deadline. A timeout is an
    /// explicit stage failure, never a silently stuck run.
    async fn stage<T, E>(
        &self,
        name: &str,
        work: impl std::future::Future<Output = Result<T, E>>,
    ) -> DomainResult<T>
    where
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.stage_timeout, work).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DomainError::External(format!("{name}: {err}"))),
            Err(_) => Err(DomainError::External(format!(
                "{name}: deadline of {:?} exceeded",
                self.stage_timeout
            ))),
        }
    }
}

fn voice_extension(mime_type: &str) -> DomainResult<&'static str> {
    VOICE_MIME_TYPES
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(mime_type))
        .map(|(_, extension)| *extension)
        .ok_or_else(|| DomainError::Validation(format!("unsupported audio type: {mime_type}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use tokio::sync::Semaphore;

    use crate::ports::BoxFuture;
    use crate::ports::ai::{AiError, AudioAnalysis, Emotion};
    use crate::ports::files::FileStoreError;
    use crate::test_support::{MemoryChatRepository, MemoryDiagnosisRepository};

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<ChatEvent>>,
    }

    impl RecordingNotifier {
        fn names(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .expect("events")
                .iter()
                .map(ChatEvent::name)
                .collect()
        }
    }

    impl NotificationChannel for RecordingNotifier {
        fn push(&self, _topic_id: &str, event: &ChatEvent) -> BoxFuture<'_, ()> {
            let event = event.clone();
            Box::pin(async move {
                self.events.lock().expect("events").push(event);
            })
        }
    }

    /// Language model gated on a semaphore so tests control when the stage
    /// finishes.
    struct GatedLlm {
        gate: Arc<Semaphore>,
        fail: bool,
    }

    impl LanguageModel for GatedLlm {
        fn generate_response(
            &self,
            message: &str,
            _message_id: &str,
            _chat_id: &str,
        ) -> BoxFuture<'_, Result<String, AiError>> {
            let message = message.to_string();
            Box::pin(async move {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                if self.fail {
                    Err(AiError::Upstream("model unavailable".to_string()))
                } else {
                    Ok(format!("reply to: {message}"))
                }
            })
        }
    }

    struct ScriptedDiagnosisModel {
        outcome: DiagnosisOutcome,
        delay: Option<Duration>,
    }

    impl DiagnosisModel for ScriptedDiagnosisModel {
        fn generate_diagnosis(
            &self,
            _chat_id: &str,
            _diagnosis_id: &str,
            transcript: &[TranscriptEntry],
        ) -> BoxFuture<'_, Result<DiagnosisOutcome, AiError>> {
            assert!(!transcript.is_empty());
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.outcome.clone())
            })
        }
    }

    struct FixedAnalyzer;

    impl AudioAnalyzer for FixedAnalyzer {
        fn analyze(&self, _wav_path: &Path) -> BoxFuture<'_, Result<AudioAnalysis, AiError>> {
            Box::pin(async {
                Ok(AudioAnalysis {
                    transcript: "i have been feeling anxious".to_string(),
                    dominant_emotion: Emotion::Fearful,
                    emotions: Vec::new(),
                })
            })
        }
    }

    struct FixedSynthesizer;

    impl SpeechSynthesizer for FixedSynthesizer {
        fn synthesize(&self, _text: &str) -> BoxFuture<'_, Result<Vec<u8>, AiError>> {
            Box::pin(async { Ok(b"RIFFwav".to_vec()) })
        }
    }

    #[derive(Default)]
    struct MemoryMedia {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    }

    impl MediaStore for MemoryMedia {
        fn store_upload(
            &self,
            chat_id: &str,
            extension: &str,
            bytes: Vec<u8>,
        ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
            let path = PathBuf::from(format!("{chat_id}/upload.{extension}"));
            Box::pin(async move {
                self.files.lock().expect("files").insert(path.clone(), bytes);
                Ok(path)
            })
        }

        fn write_reply_audio(
            &self,
            chat_id: &str,
            message_id: &str,
            bytes: Vec<u8>,
        ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
            let path = PathBuf::from(format!("{chat_id}/{message_id}.wav"));
            Box::pin(async move {
                self.files.lock().expect("files").insert(path.clone(), bytes);
                Ok(path)
            })
        }

        fn read_reply_audio(
            &self,
            chat_id: &str,
            message_id: &str,
        ) -> BoxFuture<'_, Result<Vec<u8>, FileStoreError>> {
            let path = PathBuf::from(format!("{chat_id}/{message_id}.wav"));
            Box::pin(async move {
                self.files
                    .lock()
                    .expect("files")
                    .get(&path)
                    .cloned()
                    .ok_or_else(|| FileStoreError::NotFound(path.display().to_string()))
            })
        }

        fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), FileStoreError>> {
            let path = path.to_path_buf();
            Box::pin(async move {
                self.files.lock().expect("files").remove(&path);
                Ok(())
            })
        }
    }

    /// Pretends the raw upload is already canonical.
    struct PassthroughTranscoder;

    impl AudioTranscoder for PassthroughTranscoder {
        fn to_canonical_wav(
            &self,
            input: &Path,
        ) -> BoxFuture<'_, Result<PathBuf, FileStoreError>> {
            let output = input.with_extension("16k.wav");
            Box::pin(async move { Ok(output) })
        }
    }

    struct Fixture {
        chats: Arc<MemoryChatRepository>,
        diagnoses: Arc<MemoryDiagnosisRepository>,
        notifier: Arc<RecordingNotifier>,
        media: Arc<MemoryMedia>,
        gate: Arc<Semaphore>,
        orchestrator: PipelineOrchestrator,
    }

    fn fixture(llm_fails: bool, outcome: DiagnosisOutcome, stage_timeout: Duration) -> Fixture {
        let chats = Arc::new(MemoryChatRepository::new());
        let diagnoses = Arc::new(MemoryDiagnosisRepository::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let media = Arc::new(MemoryMedia::default());
        let gate = Arc::new(Semaphore::new(0));
        let orchestrator = PipelineOrchestrator::new(
            PipelineDeps {
                chats: chats.clone(),
                diagnoses: diagnoses.clone(),
                language_model: Arc::new(GatedLlm {
                    gate: gate.clone(),
                    fail: llm_fails,
                }),
                diagnosis_model: Arc::new(ScriptedDiagnosisModel {
                    outcome,
                    delay: None,
                }),
                analyzer: Arc::new(FixedAnalyzer),
                synthesizer: Arc::new(FixedSynthesizer),
                media: media.clone(),
                transcoder: Arc::new(PassthroughTranscoder),
                notifier: notifier.clone(),
            },
            stage_timeout,
        );
        Fixture {
            chats,
            diagnoses,
            notifier,
            media,
            gate,
            orchestrator,
        }
    }

    fn success_outcome() -> DiagnosisOutcome {
        DiagnosisOutcome::Success {
            diagnosed_problem: "anxiety".to_string(),
            reasoning: "consistent worry".to_string(),
            prescriptions: vec!["breathing exercises".to_string()],
        }
    }

    async fn seeded_chat(fixture: &Fixture, actor: &ActorIdentity) -> Chat {
        let chat = Chat {
            chat_id: uuid_v7_without_dashes(),
            patient_id: actor.user_id.clone(),
            title: None,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
        };
        fixture.chats.create_chat(&chat).await.expect("chat")
    }

    async fn wait_for_idle(fixture: &Fixture, chat_id: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !fixture.orchestrator.is_response_in_progress(chat_id)
                    && !fixture.orchestrator.is_diagnosis_in_progress(chat_id)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline settled");
    }

    #[tokio::test]
    async fn text_pipeline_persists_echo_and_reply() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        let receipt = fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "hello there")
            .await
            .expect("accepted");
        assert_eq!(receipt.chat_id, chat.chat_id);

        wait_for_idle(&fixture, &chat.chat_id).await;

        let messages = fixture
            .chats
            .list_messages(&chat.chat_id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 2);
        assert!(!messages[0].from_ai);
        assert!(messages[1].from_ai);
        assert_eq!(messages[1].content, "reply to: hello there");
        assert_eq!(
            fixture.notifier.names(),
            vec!["message-received", "ai-response-ready"]
        );
    }

    #[tokio::test]
    async fn second_message_while_generating_is_rejected() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(5));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "first")
            .await
            .expect("accepted");
        assert!(fixture.orchestrator.is_response_in_progress(&chat.chat_id));

        let err = fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "second")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Busy));

        fixture.gate.add_permits(1);
        wait_for_idle(&fixture, &chat.chat_id).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "third")
            .await
            .expect("accepted after completion");
        wait_for_idle(&fixture, &chat.chat_id).await;
    }

    #[tokio::test]
    async fn stage_failure_releases_lock_and_reports() {
        let fixture = fixture(true, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "hello")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        assert_eq!(
            fixture.notifier.names(),
            vec!["message-received", "ai-response-failed"]
        );
        let messages = fixture
            .chats
            .list_messages(&chat.chat_id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 1);

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "again")
            .await
            .expect("lock released after failure");
    }

    #[tokio::test]
    async fn stage_timeout_is_reported_as_failure() {
        let fixture = fixture(false, success_outcome(), Duration::from_millis(30));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        // Gate never opens, so the language model stage times out.
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "hello")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let names = fixture.notifier.names();
        assert_eq!(names, vec!["message-received", "ai-response-failed"]);
        assert!(!fixture.orchestrator.is_response_in_progress(&chat.chat_id));
    }

    #[tokio::test]
    async fn chat_deleted_mid_run_discards_reply_silently() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(5));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "hello")
            .await
            .expect("accepted");

        let mut deleted = chat.clone();
        deleted.deleted_at_ms = Some(now_ms());
        fixture.chats.update_chat(&deleted).await.expect("delete");

        fixture.gate.add_permits(1);
        wait_for_idle(&fixture, &chat.chat_id).await;

        assert_eq!(fixture.notifier.names(), vec!["message-received"]);
        let messages = fixture
            .chats
            .list_messages(&chat.chat_id)
            .await
            .expect("messages");
        assert!(messages.iter().all(|message| !message.from_ai));
    }

    #[tokio::test]
    async fn voice_pipeline_emits_echo_audio_and_reply() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_voice_response(
                &actor,
                &chat.chat_id,
                VoiceUpload {
                    mime_type: "audio/webm".to_string(),
                    bytes: vec![1, 2, 3],
                },
            )
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        assert_eq!(
            fixture.notifier.names(),
            vec!["message-received", "ai-audio-ready", "ai-response-ready"]
        );
        let messages = fixture
            .chats
            .list_messages(&chat.chat_id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::VoiceText);
        assert_eq!(messages[0].content, "i have been feeling anxious");
        assert!(messages[0].voice_analysis.is_some());
        let audio = fixture
            .media
            .read_reply_audio(&chat.chat_id, &messages[1].message_id)
            .await
            .expect("reply audio");
        assert_eq!(audio, b"RIFFwav");
    }

    #[tokio::test]
    async fn voice_upload_validation_rejects_bad_input() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        let unsupported = fixture
            .orchestrator
            .try_start_voice_response(
                &actor,
                &chat.chat_id,
                VoiceUpload {
                    mime_type: "application/pdf".to_string(),
                    bytes: vec![1],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(unsupported, DomainError::Validation(_)));

        let oversized = fixture
            .orchestrator
            .try_start_voice_response(
                &actor,
                &chat.chat_id,
                VoiceUpload {
                    mime_type: "audio/wav".to_string(),
                    bytes: vec![0; MAX_VOICE_UPLOAD_BYTES + 1],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(oversized, DomainError::Validation(_)));

        // Rejected uploads never take the lock.
        assert!(!fixture.orchestrator.is_response_in_progress(&chat.chat_id));
    }

    #[tokio::test]
    async fn diagnosis_happy_path_completes_row_and_notifies() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(2);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "i feel worried")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let diagnosis = fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let stored = fixture
            .diagnoses
            .get(&diagnosis.diagnosis_id)
            .await
            .expect("get")
            .expect("row");
        assert!(stored.is_completed());
        assert_eq!(stored.diagnosed_problem.as_deref(), Some("anxiety"));
        assert_eq!(stored.prescriptions.len(), 1);
        assert_eq!(stored.prescriptions[0].order_index, 1);
        assert!(stored.failure_reason.is_none());
        assert!(fixture.notifier.names().contains(&"diagnosis-ready"));
    }

    #[tokio::test]
    async fn diagnosis_requires_patient_messages() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(1));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        let err = fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn pending_diagnosis_row_blocks_a_new_request() {
        let fixture = fixture(
            false,
            success_outcome(),
            // Long enough that the first run is still pending when the
            // second request arrives.
            Duration::from_secs(5),
        );
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "i feel worried")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let pending = Diagnosis {
            diagnosis_id: uuid_v7_without_dashes(),
            chat_id: chat.chat_id.clone(),
            requested_at_ms: now_ms(),
            completed_at_ms: None,
            from_message_id: "m-1".to_string(),
            to_message_id: "m-1".to_string(),
            diagnosed_problem: None,
            reasoning: None,
            prescriptions: Vec::new(),
            failure_reason: None,
            deleted_at_ms: None,
        };
        fixture.diagnoses.create(&pending).await.expect("pending");

        let err = fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict));
    }

    #[tokio::test]
    async fn diagnosis_failure_outcome_is_persisted_with_reason() {
        let fixture = fixture(
            false,
            DiagnosisOutcome::Failure {
                reason: "not enough clinical signal".to_string(),
            },
            Duration::from_secs(1),
        );
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "hi")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let diagnosis = fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        let stored = fixture
            .diagnoses
            .get(&diagnosis.diagnosis_id)
            .await
            .expect("get")
            .expect("row");
        assert!(stored.is_completed());
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some("not enough clinical signal")
        );
        assert!(stored.diagnosed_problem.is_none());

        let events = fixture.notifier.events.lock().expect("events").clone();
        let ready = events
            .iter()
            .find(|event| matches!(event, ChatEvent::DiagnosisReady { .. }))
            .expect("diagnosis-ready event");
        if let ChatEvent::DiagnosisReady { failure_reason, .. } = ready {
            assert_eq!(failure_reason.as_deref(), Some("not enough clinical signal"));
        }

        // The row is closed, so a new diagnosis can be requested.
        fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .expect("accepted again");
        wait_for_idle(&fixture, &chat.chat_id).await;
    }

    #[tokio::test]
    async fn text_and_diagnosis_locks_are_independent() {
        let fixture = fixture(false, success_outcome(), Duration::from_secs(5));
        let actor = ActorIdentity::patient("alice");
        let chat = seeded_chat(&fixture, &actor).await;

        fixture.gate.add_permits(1);
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "seed")
            .await
            .expect("accepted");
        wait_for_idle(&fixture, &chat.chat_id).await;

        // Hold the response lock open, then start a diagnosis.
        fixture
            .orchestrator
            .try_start_text_response(&actor, &chat.chat_id, "more")
            .await
            .expect("accepted");
        fixture
            .orchestrator
            .try_start_diagnosis(&actor, &chat.chat_id)
            .await
            .expect("diagnosis unaffected by response lock");

        fixture.gate.add_permits(1);
        wait_for_idle(&fixture, &chat.chat_id).await;
    }
}
