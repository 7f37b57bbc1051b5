use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::QaConfig;
use crate::error::ProviderError;
use crate::http;
use crate::llm::{ChatResponse, parse_json_object};

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<String, ProviderError>;
}

/// Judge sub-scores, each clamped to 1..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityScores {
    pub pronunciation: u8,
    pub fluency: u8,
    pub pacing: u8,
    pub pauses: u8,
    pub emotion_delivery: u8,
    pub noise_level: u8,
    pub completeness: u8,
    pub overall: u8,
}

impl QualityScores {
    pub const NEUTRAL: u8 = 5;

    pub fn from_json(value: &serde_json::Value) -> Self {
        let score = |key: &str| {
            value
                .get(key)
                .and_then(serde_json::Value::as_f64)
                .map(|v| v.round().clamp(1.0, 10.0) as u8)
                .unwrap_or(Self::NEUTRAL)
        };
        Self {
            pronunciation: score("pronunciation"),
            fluency: score("fluency"),
            pacing: score("pacing"),
            pauses: score("pauses"),
            emotion_delivery: score("emotion_delivery"),
            noise_level: score("noise_level"),
            completeness: score("completeness"),
            overall: score("overall"),
        }
    }

    pub fn dimensions(&self) -> [(&'static str, u8); 8] {
        [
            ("pronunciation", self.pronunciation),
            ("fluency", self.fluency),
            ("pacing", self.pacing),
            ("pauses", self.pauses),
            ("emotion_delivery", self.emotion_delivery),
            ("noise_level", self.noise_level),
            ("completeness", self.completeness),
            ("overall", self.overall),
        ]
    }
}

#[async_trait]
pub trait QualityJudge: Send + Sync {
    async fn judge(
        &self,
        audio: &Path,
        source_text: &str,
        language: &str,
    ) -> Result<QualityScores, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

async fn read_audio(path: &Path) -> Result<Vec<u8>, ProviderError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ProviderError::Fatal(format!("cannot read {}: {e}", path.display())))
}

pub struct HttpTranscriber {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTranscriber {
    pub fn new(config: &QaConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout)?,
            endpoint: config.transcription_endpoint.clone(),
            model: config.transcription_model.clone(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<String, ProviderError> {
        let bytes = read_audio(audio).await?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(ProviderError::from_reqwest)?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language.to_string());
        let builder = http::bearer(self.client.post(&self.endpoint).multipart(form), self.api_key.as_deref());
        let res = http::send(builder, self.timeout).await?;
        let parsed: TranscriptionResponse = res.json().await.map_err(ProviderError::from_reqwest)?;
        Ok(parsed.text)
    }
}

pub struct HttpJudge {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpJudge {
    pub fn new(config: &QaConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout)?,
            endpoint: config.judge_endpoint.clone(),
            model: config.judge_model.clone(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl QualityJudge for HttpJudge {
    async fn judge(
        &self,
        audio: &Path,
        source_text: &str,
        language: &str,
    ) -> Result<QualityScores, ProviderError> {
        let encoded = STANDARD.encode(read_audio(audio).await?);
        let instructions = format!(
            "Rate this children's narration (language '{language}') against the source text. \
             Reply with a JSON object of integer scores 1-10 for pronunciation, fluency, pacing, \
             pauses, emotion_delivery, noise_level, completeness, overall.\n\nSource text:\n{source_text}"
        );
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "input_audio", "input_audio": encoded },
                    { "type": "text", "text": instructions },
                ],
            }],
        });
        let builder = http::bearer(self.client.post(&self.endpoint).json(&body), self.api_key.as_deref());
        let res = http::send(builder, self.timeout).await?;
        let parsed: ChatResponse = res.json().await.map_err(ProviderError::from_reqwest)?;
        let content = parsed.into_content()?;
        let value = parse_json_object(&content)?;
        Ok(QualityScores::from_json(&value))
    }
}
