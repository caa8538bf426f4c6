use std::sync::Arc;
use std::time::Duration;

use telecare_domain::chat::ChatService;
use telecare_domain::diagnosis::DiagnosisService;
use telecare_domain::locks::KeyedRwLock;
use telecare_domain::pipeline::{PipelineDeps, PipelineOrchestrator};
use telecare_domain::ports::ai::{AudioAnalyzer, DiagnosisModel, LanguageModel, SpeechSynthesizer};
use telecare_domain::ports::chat::ChatRepository;
use telecare_domain::ports::diagnosis::DiagnosisRepository;
use telecare_domain::ports::files::{AttachmentFiles, AudioTranscoder, MediaStore};
use telecare_domain::ports::verification::VerificationRepository;
use telecare_domain::verification::AttachmentVault;
use telecare_infra::ai::{
    HttpAudioAnalyzer, HttpDiagnosisModel, HttpLanguageModel, HttpSpeechSynthesizer,
};
use telecare_infra::config::AppConfig;
use telecare_infra::media::{FfmpegTranscoder, LocalAttachmentFiles, LocalMediaStore};
use telecare_infra::notify::LocalNotificationChannel;
use telecare_infra::repositories::{
    InMemoryChatRepository, InMemoryDiagnosisRepository, InMemoryVerificationRepository,
};

/// Backends the state is assembled from; tests swap in mocks here.
pub struct StateParts {
    pub chat_repo: Arc<dyn ChatRepository>,
    pub diagnosis_repo: Arc<dyn DiagnosisRepository>,
    pub verification_repo: Arc<dyn VerificationRepository>,
    pub language_model: Arc<dyn LanguageModel>,
    pub diagnosis_model: Arc<dyn DiagnosisModel>,
    pub analyzer: Arc<dyn AudioAnalyzer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub media: Arc<dyn MediaStore>,
    pub transcoder: Arc<dyn AudioTranscoder>,
    pub attachment_files: Arc<dyn AttachmentFiles>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub chats: ChatService,
    pub diagnoses: DiagnosisService,
    pub vault: AttachmentVault,
    pub pipelines: PipelineOrchestrator,
    pub media: Arc<dyn MediaStore>,
    pub realtime: LocalNotificationChannel,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let media = Arc::new(LocalMediaStore::from_config(&config));
        let parts = StateParts {
            chat_repo: Arc::new(InMemoryChatRepository::new()),
            diagnosis_repo: Arc::new(InMemoryDiagnosisRepository::new()),
            verification_repo: Arc::new(InMemoryVerificationRepository::new()),
            language_model: Arc::new(HttpLanguageModel::from_config(&config)),
            diagnosis_model: Arc::new(HttpDiagnosisModel::from_config(&config)),
            analyzer: Arc::new(HttpAudioAnalyzer::from_config(&config)),
            synthesizer: Arc::new(HttpSpeechSynthesizer::from_config(&config)),
            media,
            transcoder: Arc::new(FfmpegTranscoder::from_config(&config)),
            attachment_files: Arc::new(LocalAttachmentFiles::from_config(&config)),
        };
        Self::from_parts(config, parts)
    }

    pub fn from_parts(config: AppConfig, parts: StateParts) -> Self {
        let realtime = LocalNotificationChannel::new(config.broadcast_capacity);
        let stage_timeout = Duration::from_millis(config.pipeline_stage_timeout_ms.max(1));
        let pipelines = PipelineOrchestrator::new(
            PipelineDeps {
                chats: parts.chat_repo.clone(),
                diagnoses: parts.diagnosis_repo.clone(),
                language_model: parts.language_model,
                diagnosis_model: parts.diagnosis_model,
                analyzer: parts.analyzer,
                synthesizer: parts.synthesizer,
                media: parts.media.clone(),
                transcoder: parts.transcoder,
                notifier: Arc::new(realtime.clone()),
            },
            stage_timeout,
        );
        Self {
            config,
            chats: ChatService::new(parts.chat_repo.clone()),
            diagnoses: DiagnosisService::new(parts.diagnosis_repo, parts.chat_repo),
            vault: AttachmentVault::new(
                parts.verification_repo,
                parts.attachment_files,
                KeyedRwLock::new(),
            ),
            pipelines,
            media: parts.media,
            realtime,
        }
    }
}
