//! In-process doubles for every external collaborator, used by unit and
//! integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::{self, AudioBuffer};
use crate::config::PublishTarget;
use crate::error::{ProviderError, Transient};
use crate::hooks::{ItemHook, Publisher};
use crate::llm::{GeneratedText, GenerationRequest, TextGenerator};
use crate::model::{AgeRange, ContentItem, ContentStore, ContentKind};
use crate::notify::{Notifier, RunSummary};
use crate::stt::{QualityJudge, QualityScores, Transcriber};
use crate::tts::{SpeechSynthesizer, SynthesisRequest};

pub const MOCK_SAMPLE_RATE: u32 = 8_000;
const SAMPLES_PER_CHAR: usize = 480;

type RequestPredicate = Box<dyn Fn(&SynthesisRequest) -> bool + Send + Sync>;
type RequestDelay = Box<dyn Fn(&SynthesisRequest) -> Duration + Send + Sync>;

/// Synthesizer returning a tone whose length is proportional to the text.
pub struct MockSynthesizer {
    calls: AtomicUsize,
    health_checks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transient_failures: AtomicU32,
    failure: Option<RequestPredicate>,
    delay: Option<RequestDelay>,
    unavailable: bool,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            transient_failures: AtomicU32::new(0),
            failure: None,
            delay: None,
            unavailable: false,
        }
    }

    /// Requests matching `predicate` fail permanently.
    pub fn with_failure(mut self, predicate: impl Fn(&SynthesisRequest) -> bool + Send + Sync + 'static) -> Self {
        self.failure = Some(Box::new(predicate));
        self
    }

    pub fn with_delay(mut self, delay: impl Fn(&SynthesisRequest) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    /// The next `n` calls fail with a retryable server error.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Health and synthesis both report the provider as gone.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn samples_for(text: &str) -> usize {
        text.chars().count().max(1) * SAMPLES_PER_CHAR
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn render(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError> {
        if self.unavailable {
            return Err(ProviderError::Fatal("service not found".to_string()));
        }
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(request)).await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Retryable(Transient::Server {
                status: 503,
                body: "cold start".to_string(),
            }));
        }
        if self.failure.as_ref().is_some_and(|f| f(request)) {
            return Err(ProviderError::Fatal("mock synthesis failure".to_string()));
        }
        let buffer = tone(MOCK_SAMPLE_RATE, Self::samples_for(&request.text));
        audio::encode_wav(&buffer).map_err(|e| ProviderError::Fatal(e.to_string()))
    }
}

fn tone(sample_rate: u32, len: usize) -> AudioBuffer {
    let samples = (0..len)
        .map(|i| 0.3 * (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin())
        .collect();
    AudioBuffer::new(sample_rate, samples)
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn health(&self) -> Result<(), ProviderError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ProviderError::Fatal("service not found".to_string()));
        }
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.render(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

enum TranscriptSource {
    Fixed(String),
    /// Look up the source text of the item the audio file belongs to.
    Faithful(PathBuf),
    Failing,
}

pub struct MockTranscriber {
    source: TranscriptSource,
    calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn with_text(text: &str) -> Self {
        Self::from_source(TranscriptSource::Fixed(text.to_string()))
    }

    /// Returns the exact text of the item whose audio is transcribed, found
    /// in `content_root/content.json` by the `<item_id>_<voice>.wav` name.
    pub fn faithful(content_root: &Path) -> Self {
        Self::from_source(TranscriptSource::Faithful(content_root.to_path_buf()))
    }

    pub fn failing() -> Self {
        Self::from_source(TranscriptSource::Failing)
    }

    fn from_source(source: TranscriptSource) -> Self {
        Self {
            source,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, audio: &Path, _language: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.source {
            TranscriptSource::Fixed(text) => Ok(text.clone()),
            TranscriptSource::Failing => Err(ProviderError::Fatal("mock transcription failure".to_string())),
            TranscriptSource::Faithful(root) => {
                let stem = audio
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let store = ContentStore::open(root).map_err(|e| ProviderError::Fatal(e.to_string()))?;
                store
                    .items()
                    .iter()
                    .find(|i| stem.starts_with(&format!("{}_", i.id)))
                    .map(|i| i.text.clone())
                    .ok_or_else(|| ProviderError::Fatal(format!("no item for {stem}")))
            }
        }
    }
}

pub struct MockJudge {
    base: u8,
    overrides: BTreeMap<String, u8>,
    calls: AtomicUsize,
    transient_failures: AtomicU32,
}

impl MockJudge {
    pub fn scoring(base: u8) -> Self {
        Self {
            base,
            overrides: BTreeMap::new(),
            calls: AtomicUsize::new(0),
            transient_failures: AtomicU32::new(0),
        }
    }

    /// The next `n` calls fail with a retryable rate limit.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_dimension(mut self, name: &str, score: u8) -> Self {
        self.overrides.insert(name.to_string(), score);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityJudge for MockJudge {
    async fn judge(&self, _audio: &Path, _source: &str, _language: &str) -> Result<QualityScores, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Retryable(Transient::RateLimited { retry_after: None }));
        }
        let mut value = serde_json::Map::new();
        for (name, _) in QualityScores::from_json(&serde_json::Value::Null).dimensions() {
            let score = self.overrides.get(name).copied().unwrap_or(self.base);
            value.insert(name.to_string(), score.into());
        }
        Ok(QualityScores::from_json(&serde_json::Value::Object(value)))
    }
}

/// Generator producing short annotated pieces with unique titles.
pub struct MockTextGenerator {
    calls: AtomicUsize,
    failing: bool,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for MockTextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTextGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every call is rate limited.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn sample(kind: ContentKind, n: usize) -> GeneratedText {
        let (title, text, annotated) = match kind {
            ContentKind::Story => (
                format!("The Sleepy Fox {n}"),
                "A little fox curled up under the old oak tree. The stars blinked hello.\n\nShe yawned and closed her eyes.".to_string(),
                "[CALM] A little fox curled up under the old oak tree. The stars blinked hello.\n\n[SLEEPY] She yawned and closed her eyes. [PAUSE]".to_string(),
            ),
            ContentKind::Poem => (
                format!("Moonlight Song {n}"),
                "Silver moon so round and bright, you keep watch on me tonight.".to_string(),
                "[GENTLE] Silver moon so round and bright, you keep watch on me tonight.".to_string(),
            ),
            ContentKind::Lullaby => (
                format!("Hush Now {n}"),
                "Hush now, little one, the day is done.".to_string(),
                "[HUMMING] Hush now, little one, the day is done.".to_string(),
            ),
        };
        GeneratedText {
            title,
            text,
            annotated_text: Some(annotated),
            target_age: Some(AgeRange { min: 3, max: 6 }),
            metadata: serde_json::json!({ "source": "mock" }),
        }
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.failing {
            return Err(ProviderError::Retryable(Transient::RateLimited { retry_after: None }));
        }
        Ok(Self::sample(request.kind, n))
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Hook returning a fixed stdout, or failing.
pub struct MockHook {
    output: Option<String>,
    calls: AtomicUsize,
}

impl MockHook {
    pub fn returning(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemHook for MockHook {
    async fn run(&self, item: &ContentItem) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.output {
            Some(out) => Ok(out.replace("{id}", &item.id)),
            None => anyhow::bail!("mock hook failure for {}", item.id),
        }
    }
}

/// Publisher that records targets and fails the ones named at construction.
#[derive(Default)]
pub struct MockPublisher {
    failing: Vec<String>,
    published: Mutex<Vec<String>>,
}

impl MockPublisher {
    pub fn failing_on(targets: &[&str]) -> Self {
        Self {
            failing: targets.iter().map(|t| t.to_string()).collect(),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, target: &PublishTarget, _message: &str) -> anyhow::Result<()> {
        if self.failing.contains(&target.name) {
            anyhow::bail!("push to {} rejected", target.name);
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(target.name.clone());
        }
        Ok(())
    }
}

/// Notifier that keeps every summary it is handed.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<RunSummary>>>,
}

impl RecordingNotifier {
    pub fn summaries(&self) -> Vec<RunSummary> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(summary.clone());
        }
        Ok(())
    }
}
