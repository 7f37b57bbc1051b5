use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBuffer};
use crate::checkpoint::CheckpointEvent;
use crate::chunker::Chunk;
use crate::config::SynthesisConfig;
use crate::directive::{self, StyleParams};
use crate::error::{ProviderError, Transient};
use crate::model::{ContentKind, VariantKey};
use crate::retry::{RetryPolicy, with_retry};
use crate::state::ChunkRecord;
use crate::tts::{SpeechSynthesizer, SynthesisRequest};

const WARMUP_TEXT: &str = "Hello.";

/// Everything needed to synthesize one (item, voice) pair.
#[derive(Debug, Clone)]
pub struct VariantJob {
    pub key: VariantKey,
    pub kind: ContentKind,
    pub language: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Error)]
#[error("{failed} of {total} chunks failed for {key}: {first}")]
pub struct SynthesisError {
    pub key: VariantKey,
    pub failed: usize,
    pub total: usize,
    pub first: String,
}

/// Bounded set of concurrent synthesis calls shared by every variant of a run.
pub struct SynthesisPool {
    synth: Arc<dyn SpeechSynthesizer>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    call_timeout: Duration,
    warmup_timeout: Duration,
    exaggeration_range: (f32, f32),
    cfg_weight_range: (f32, f32),
    scratch_dir: PathBuf,
    retries: Arc<AtomicU32>,
    warmed: AtomicBool,
}

impl SynthesisPool {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, config: &SynthesisConfig, scratch_dir: &Path) -> Self {
        Self {
            synth,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            policy: RetryPolicy::new(config.max_attempts, config.backoff_base_ms, config.backoff_max_ms),
            call_timeout: config.call_timeout(),
            warmup_timeout: Duration::from_secs(config.warmup_timeout_secs),
            exaggeration_range: config.exaggeration_range,
            cfg_weight_range: config.cfg_weight_range,
            scratch_dir: scratch_dir.to_path_buf(),
            retries: Arc::new(AtomicU32::new(0)),
            warmed: AtomicBool::new(false),
        }
    }

    /// Retries spent so far by this pool.
    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// One health probe and one short synthesis before the first batch, so
    /// the provider's cold start is not charged to a real chunk. Only a
    /// provider that stays unreachable through both is an error.
    pub async fn warm_up(&self, voice: &str, language: &str) -> Result<(), ProviderError> {
        if self.warmed.load(Ordering::Acquire) {
            return Ok(());
        }
        let started = Instant::now();
        info!("Warming up synthesis provider");
        match tokio::time::timeout(self.warmup_timeout, self.synth.health()).await {
            Ok(Ok(())) => debug!("Synthesis health check passed"),
            Ok(Err(ProviderError::Fatal(msg))) => return Err(ProviderError::Fatal(msg)),
            Ok(Err(e)) => warn!("Synthesis health check failed: {}", e),
            Err(_) => warn!("Synthesis health check timed out after {:?}", self.warmup_timeout),
        }

        let request = SynthesisRequest::new(WARMUP_TEXT, voice, language, self.style(None, ContentKind::Story));
        match tokio::time::timeout(self.warmup_timeout, self.synth.synthesize(&request)).await {
            Ok(Ok(_)) => {
                info!("Synthesis provider warm after {:.1}s", started.elapsed().as_secs_f64());
                self.warmed.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Retryable(Transient::Timeout(self.warmup_timeout))),
        }
    }

    fn style(&self, tag: Option<directive::Emotion>, kind: ContentKind) -> StyleParams {
        directive::resolve_style(tag, kind).clamped(self.exaggeration_range, self.cfg_weight_range)
    }

    fn variant_scratch(&self, key: &VariantKey) -> PathBuf {
        self.scratch_dir.join(&key.item_id).join(&key.voice)
    }

    fn chunk_path(&self, key: &VariantKey, index: usize, digest: &str) -> PathBuf {
        self.variant_scratch(key)
            .join(format!("{index:04}_{}.wav", &digest[..16]))
    }

    /// Drop the chunk audio kept for `key` once its variant is assembled.
    pub async fn discard(&self, key: &VariantKey) {
        let dir = self.variant_scratch(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(key = %key, "Removed chunk scratch"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
        }
        // the item directory goes once its last voice is gone
        if let Some(parent) = dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    /// Synthesize every chunk of `job` and return the audio in chunk order.
    ///
    /// Chunks listed in `resume` whose digest still matches and whose file is
    /// readable are reused without a provider call. Completed chunks are
    /// reported on `progress`. A chunk that exhausts its retries fails the
    /// variant, but its siblings still run to completion so their audio is
    /// kept for the next attempt.
    pub async fn synthesize(
        &self,
        job: &VariantJob,
        resume: &[ChunkRecord],
        progress: Option<&mpsc::Sender<CheckpointEvent>>,
    ) -> Result<Vec<AudioBuffer>, SynthesisError> {
        let total = job.chunks.len();
        let mut slots: Vec<Option<AudioBuffer>> = vec![None; total];
        let mut tasks = JoinSet::new();

        for chunk in &job.chunks {
            let style = self.style(chunk.tag, job.kind);
            let request = SynthesisRequest::new(&chunk.text, &job.key.voice, &job.language, style);
            let digest = request_digest(&request);

            if let Some(buffer) = reusable(resume, chunk.index, &digest) {
                debug!(key = %job.key, chunk = chunk.index, "Reusing synthesized chunk");
                slots[chunk.index] = Some(buffer);
                continue;
            }

            let worker = ChunkWorker {
                synth: Arc::clone(&self.synth),
                permits: Arc::clone(&self.permits),
                retries: Arc::clone(&self.retries),
                policy: self.policy,
                timeout: self.call_timeout,
                key: job.key.clone(),
                index: chunk.index,
                path: self.chunk_path(&job.key, chunk.index, &digest),
                digest,
                request,
                progress: progress.cloned(),
            };
            tasks.spawn(worker.run());
        }

        let mut failed = 0;
        let mut first = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, buffer))) => slots[index] = Some(buffer),
                Ok(Err(e)) => {
                    failed += 1;
                    first.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    failed += 1;
                    first.get_or_insert_with(|| format!("worker panicked: {e}"));
                }
            }
        }

        if failed > 0 {
            return Err(SynthesisError {
                key: job.key.clone(),
                failed,
                total,
                first: first.unwrap_or_default(),
            });
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

struct ChunkWorker {
    synth: Arc<dyn SpeechSynthesizer>,
    permits: Arc<Semaphore>,
    retries: Arc<AtomicU32>,
    policy: RetryPolicy,
    timeout: Duration,
    key: VariantKey,
    index: usize,
    path: PathBuf,
    digest: String,
    request: SynthesisRequest,
    progress: Option<mpsc::Sender<CheckpointEvent>>,
}

impl ChunkWorker {
    async fn run(self) -> Result<(usize, AudioBuffer), ProviderError> {
        let _permit = self
            .permits
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Fatal("synthesis pool closed".to_string()))?;

        let label = format!("synthesize {} chunk {}", self.key, self.index);
        let synth = &self.synth;
        let request = &self.request;
        let (bytes, buffer) = with_retry(&label, &self.policy, self.timeout, &self.retries, |_| async move {
            let bytes = synth.synthesize(request).await?;
            let buffer = audio::decode_wav(&bytes)
                .map_err(|e| ProviderError::Retryable(Transient::BadAudio(e.to_string())))?;
            Ok((bytes, buffer))
        })
        .await?;

        if let Err(e) = persist(&self.path, &bytes).await {
            warn!("Could not keep chunk audio {}: {}", self.path.display(), e);
        } else if let Some(tx) = &self.progress {
            let event = CheckpointEvent::ChunkDone {
                key: self.key.clone(),
                record: ChunkRecord {
                    index: self.index,
                    digest: self.digest.clone(),
                    file: self.path.clone(),
                },
            };
            if tx.send(event).await.is_err() {
                warn!("Checkpoint writer gone; chunk {} not recorded", self.index);
            }
        }
        debug!(key = %self.key, chunk = self.index, "Chunk synthesized");
        Ok((self.index, buffer))
    }
}

async fn persist(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

fn reusable(resume: &[ChunkRecord], index: usize, digest: &str) -> Option<AudioBuffer> {
    let record = resume.iter().find(|r| r.index == index && r.digest == digest)?;
    audio::read_wav(&record.file).ok()
}

/// Content address of a synthesis request.
pub fn request_digest(request: &SynthesisRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.text.as_bytes());
    hasher.update([0]);
    hasher.update(request.voice.as_bytes());
    hasher.update([0]);
    hasher.update(request.language.as_bytes());
    hasher.update(request.exaggeration.to_le_bytes());
    hasher.update(request.cfg_weight.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
