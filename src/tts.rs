use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::directive::StyleParams;
use crate::error::{ProviderError, Transient};
use crate::http;

/// Anything shorter cannot hold a WAV header plus audio.
pub const MIN_AUDIO_BYTES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub language: String,
    pub exaggeration: f32,
    pub cfg_weight: f32,
}

impl SynthesisRequest {
    pub fn new(text: &str, voice: &str, language: &str, style: StyleParams) -> Self {
        Self {
            text: text.to_string(),
            voice: voice.to_string(),
            language: language.to_string(),
            exaggeration: style.exaggeration,
            cfg_weight: style.cfg_weight,
        }
    }
}

/// Speech-synthesis provider. Returns WAV bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn health(&self) -> Result<(), ProviderError>;

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError>;
}

pub struct HttpSynthesizer {
    client: Client,
    endpoint: String,
    health_endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpSynthesizer {
    pub fn new(config: &SynthesisConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        // per-attempt timeouts are enforced by the retry loop; this one only
        // guards the warm-up path
        let timeout = Duration::from_secs(config.warmup_timeout_secs.max(config.timeout_secs));
        Ok(Self {
            client: http::client(timeout)?,
            endpoint: config.endpoint.clone(),
            health_endpoint: config.health_endpoint.clone(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn health(&self) -> Result<(), ProviderError> {
        let request = http::bearer(self.client.get(&self.health_endpoint), self.api_key.as_deref());
        http::send(request, self.timeout).await?;
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError> {
        debug!(
            voice = %request.voice,
            chars = request.text.chars().count(),
            "POST {}",
            self.endpoint
        );
        let builder = http::bearer(
            self.client.post(&self.endpoint).json(request),
            self.api_key.as_deref(),
        );
        let response = http::send(builder, self.timeout).await?;
        let bytes = response.bytes().await.map_err(ProviderError::from_reqwest)?;
        if bytes.len() < MIN_AUDIO_BYTES {
            return Err(ProviderError::Retryable(Transient::ShortResponse(bytes.len())));
        }
        Ok(bytes.to_vec())
    }
}
