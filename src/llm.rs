use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::ProviderError;
use crate::http;
use crate::model::{AgeRange, ContentKind};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: ContentKind,
    pub language: String,
    /// Recent titles the new piece must not repeat.
    pub avoid_titles: Vec<String>,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedText {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub annotated_text: Option<String>,
    #[serde(default)]
    pub target_age: Option<AgeRange>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText, ProviderError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatResponse {
    pub(crate) fn into_content(self) -> Result<String, ProviderError> {
        self.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Fatal("completion had no choices".to_string()))
    }
}

/// Chat-completions client that asks for a JSON object.
pub struct HttpTextGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTextGenerator {
    pub fn new(config: &GenerationConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout)?,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            timeout,
        })
    }

    async fn complete(&self, body: serde_json::Value) -> Result<String, ProviderError> {
        let builder = http::bearer(self.client.post(&self.endpoint).json(&body), self.api_key.as_deref());
        let res = http::send(builder, self.timeout).await?;
        let parsed: ChatResponse = res.json().await.map_err(ProviderError::from_reqwest)?;
        parsed.into_content()
    }
}

pub fn prompt_for(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "Write one original bedtime {} for young children in language '{}'. \
         Reply with a JSON object with keys title, text, annotated_text, target_age {{min, max}}. \
         annotated_text is the same text with inline delivery markers such as [CALM], [SLEEPY], \
         [WHISPERING], [PAUSE] and blank lines between paragraphs.",
        request.kind, request.language
    );
    if let Some(theme) = &request.theme {
        prompt.push_str(&format!(" Theme: {theme}."));
    }
    if !request.avoid_titles.is_empty() {
        prompt.push_str(" Do not reuse or closely imitate these titles: ");
        prompt.push_str(&request.avoid_titles.join("; "));
        prompt.push('.');
    }
    prompt
}

/// Parse a model's JSON reply, tolerating a fenced code block around it.
pub fn parse_json_object(content: &str) -> Result<serde_json::Value, ProviderError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| ProviderError::Fatal(format!("unparseable model reply: {e}")))
}

pub fn parse_generated(content: &str) -> Result<GeneratedText, ProviderError> {
    let generated: GeneratedText = serde_json::from_value(parse_json_object(content)?)
        .map_err(|e| ProviderError::Fatal(format!("generation reply missing fields: {e}")))?;
    if generated.text.trim().is_empty() {
        return Err(ProviderError::Fatal("generation reply had empty text".to_string()));
    }
    Ok(generated)
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText, ProviderError> {
        debug!(kind = %request.kind, "Requesting generation from {}", self.endpoint);
        let body = json!({
            "model": self.model,
            "temperature": 0.9,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": "You write gentle, age-appropriate bedtime content." },
                { "role": "user", "content": prompt_for(request) },
            ],
        });
        let content = self.complete(body).await?;
        parse_generated(&content)
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        self.complete(body).await.map(|_| ())
    }
}
