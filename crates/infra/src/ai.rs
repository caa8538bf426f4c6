//! HTTP adapters for the AI model services.
//!
//! All four upstreams share the same authentication scheme (a static key in
//! a configurable header) and the same failure taxonomy: connection-level
//! problems map to [`AiError::Transport`], non-2xx statuses to
//! [`AiError::Upstream`] and undecodable bodies to
//! [`AiError::InvalidResponse`].

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use telecare_domain::diagnosis::{DiagnosisOutcome, DiagnosisWire};
use telecare_domain::ports::BoxFuture;
use telecare_domain::ports::ai::{
    AiError, AudioAnalysis, AudioAnalyzer, DiagnosisModel, Emotion, EmotionScore, LanguageModel,
    SpeechSynthesizer, TranscriptEntry,
};

use crate::config::AppConfig;

#[derive(Clone)]
struct AiHttp {
    http: reqwest::Client,
    api_key_header: String,
    api_key: Option<String>,
}

impl AiHttp {
    fn from_config(config: &AppConfig) -> Self {
        let timeout = Duration::from_millis(config.ai_request_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let api_key = config.ai_api_key.trim().to_string();
        Self {
            http,
            api_key_header: config.ai_api_key_header.clone(),
            api_key: if api_key.is_empty() {
                None
            } else {
                Some(api_key)
            },
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(&self.api_key_header, key),
            None => request,
        }
    }

    async fn post_json<Req, Resp>(&self, url: &str, payload: &Req) -> Result<Resp, AiError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request = self
            .apply_auth(self.http.post(url))
            .header("accept", "application/json")
            .json(payload);
        let response = request
            .send()
            .await
            .map_err(|err| AiError::Transport(err.to_string()))?;
        decode_response(response).await
    }

    async fn post_multipart<Resp>(
        &self,
        url: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Resp, AiError>
    where
        Resp: DeserializeOwned,
    {
        let request = self
            .apply_auth(self.http.post(url))
            .header("accept", "application/json")
            .multipart(form);
        let response = request
            .send()
            .await
            .map_err(|err| AiError::Transport(err.to_string()))?;
        decode_response(response).await
    }
}

async fn decode_response<Resp>(response: reqwest::Response) -> Result<Resp, AiError>
where
    Resp: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AiError::Upstream(format!(
            "status {}: {}",
            status.as_u16(),
            message
        )));
    }
    response
        .json::<Resp>()
        .await
        .map_err(|err| AiError::InvalidResponse(err.to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LlmRequest<'a> {
    message: &'a str,
    chat_id: &'a str,
    message_id: &'a str,
}

#[derive(Deserialize)]
struct LlmResponse {
    response: String,
}

#[derive(Clone)]
pub struct HttpLanguageModel {
    http: AiHttp,
    url: String,
}

impl HttpLanguageModel {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            http: AiHttp::from_config(config),
            url: config.llm_api_url.clone(),
        }
    }
}

impl LanguageModel for HttpLanguageModel {
    fn generate_response(
        &self,
        message: &str,
        message_id: &str,
        chat_id: &str,
    ) -> BoxFuture<'_, Result<String, AiError>> {
        let message = message.to_string();
        let message_id = message_id.to_string();
        let chat_id = chat_id.to_string();
        Box::pin(async move {
            let payload = LlmRequest {
                message: &message,
                chat_id: &chat_id,
                message_id: &message_id,
            };
            let response: LlmResponse = self.http.post_json(&self.url, &payload).await?;
            Ok(response.response)
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosisRequest<'a> {
    chat_id: &'a str,
    chat_diagnosis_id: &'a str,
    messages: Vec<DiagnosisMessage<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosisMessage<'a> {
    content: &'a str,
    is_ai: bool,
}

#[derive(Clone)]
pub struct HttpDiagnosisModel {
    http: AiHttp,
    url: String,
}

impl HttpDiagnosisModel {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            http: AiHttp::from_config(config),
            url: config.diagnosis_api_url.clone(),
        }
    }
}

impl DiagnosisModel for HttpDiagnosisModel {
    fn generate_diagnosis(
        &self,
        chat_id: &str,
        diagnosis_id: &str,
        transcript: &[TranscriptEntry],
    ) -> BoxFuture<'_, Result<DiagnosisOutcome, AiError>> {
        let chat_id = chat_id.to_string();
        let diagnosis_id = diagnosis_id.to_string();
        let transcript = transcript.to_vec();
        Box::pin(async move {
            let payload = DiagnosisRequest {
                chat_id: &chat_id,
                chat_diagnosis_id: &diagnosis_id,
                messages: transcript
                    .iter()
                    .map(|entry| DiagnosisMessage {
                        content: &entry.content,
                        is_ai: entry.from_ai,
                    })
                    .collect(),
            };
            let wire: DiagnosisWire = self.http.post_json(&self.url, &payload).await?;
            // Contract violations collapse to a failure outcome here, at the
            // deserialization boundary.
            Ok(DiagnosisOutcome::from_wire(wire))
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisResponse {
    transcription: String,
    dominant_emotion: Emotion,
    #[serde(default)]
    emotions: Vec<AnalysisEmotionScore>,
}

#[derive(Deserialize)]
struct AnalysisEmotionScore {
    emotion: Emotion,
    score: f32,
}

#[derive(Clone)]
pub struct HttpAudioAnalyzer {
    http: AiHttp,
    url: String,
}

impl HttpAudioAnalyzer {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            http: AiHttp::from_config(config),
            url: config.audio_analysis_api_url.clone(),
        }
    }
}

impl AudioAnalyzer for HttpAudioAnalyzer {
    fn analyze(&self, wav_path: &Path) -> BoxFuture<'_, Result<AudioAnalysis, AiError>> {
        let wav_path = wav_path.to_path_buf();
        Box::pin(async move {
            let bytes = tokio::fs::read(&wav_path)
                .await
                .map_err(|err| AiError::Transport(format!("read wav: {err}")))?;
            let file_name = wav_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "audio.wav".to_string());
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("audio/wav")
                .map_err(|err| AiError::Transport(err.to_string()))?;
            let form = reqwest::multipart::Form::new().part("file", part);

            let response: AnalysisResponse = self.http.post_multipart(&self.url, form).await?;
            Ok(AudioAnalysis {
                transcript: response.transcription,
                dominant_emotion: response.dominant_emotion,
                emotions: response
                    .emotions
                    .into_iter()
                    .map(|score| EmotionScore {
                        emotion: score.emotion,
                        score: score.score,
                    })
                    .collect(),
            })
        })
    }
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
    preset: &'a str,
    num_autoregressive_samples: u32,
    temperature: f32,
    length_penalty: f32,
    repetition_penalty: f32,
    top_p: f32,
    max_mel_tokens: u32,
}

#[derive(Deserialize)]
struct TtsResponse {
    audio_base64: String,
}

#[derive(Clone)]
pub struct HttpSpeechSynthesizer {
    http: AiHttp,
    url: String,
}

impl HttpSpeechSynthesizer {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            http: AiHttp::from_config(config),
            url: config.tts_api_url.clone(),
        }
    }
}

impl SpeechSynthesizer for HttpSpeechSynthesizer {
    fn synthesize(&self, text: &str) -> BoxFuture<'_, Result<Vec<u8>, AiError>> {
        let text = text.to_string();
        Box::pin(async move {
            let payload = TtsRequest {
                text: &text,
                voice: "tom",
                preset: "ultra_fast",
                num_autoregressive_samples: 50,
                temperature: 0.8,
                length_penalty: 1.0,
                repetition_penalty: 2.0,
                top_p: 0.8,
                max_mel_tokens: 500,
            };
            let response: TtsResponse = self.http.post_json(&self.url, &payload).await?;
            BASE64
                .decode(response.audio_base64.as_bytes())
                .map_err(|err| AiError::InvalidResponse(format!("audio_base64: {err}")))
        })
    }
}
