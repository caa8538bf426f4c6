use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub jwt_secret: String,
    pub llm_api_url: String,
    pub diagnosis_api_url: String,
    pub audio_analysis_api_url: String,
    pub tts_api_url: String,
    pub ai_api_key: String,
    pub ai_api_key_header: String,
    pub ai_request_timeout_ms: u64,
    pub pipeline_stage_timeout_ms: u64,
    pub upload_folder: String,
    pub ai_output_folder: String,
    pub attachment_root: String,
    pub ffmpeg_path: String,
    pub reply_audio_ttl_ms: u64,
    pub reply_audio_sweep_interval_ms: u64,
    pub broadcast_capacity: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("llm_api_url", "http://127.0.0.1:8100/chat")?
            .set_default("diagnosis_api_url", "http://127.0.0.1:8100/diagnosis")?
            .set_default("audio_analysis_api_url", "http://127.0.0.1:8200/analyze")?
            .set_default("tts_api_url", "http://127.0.0.1:8300/tts")?
            .set_default("ai_api_key", "")?
            .set_default("ai_api_key_header", "X-Api-Key")?
            .set_default("ai_request_timeout_ms", 120_000)?
            .set_default("pipeline_stage_timeout_ms", 150_000)?
            .set_default("upload_folder", "data/uploads")?
            .set_default("ai_output_folder", "data/ai-audio")?
            .set_default("attachment_root", "data/attachments")?
            .set_default("ffmpeg_path", "ffmpeg")?
            .set_default("reply_audio_ttl_ms", 86_400_000)?
            .set_default("reply_audio_sweep_interval_ms", 3_600_000)?
            .set_default("broadcast_capacity", 256)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}
