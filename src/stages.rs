//! Work performed by each checkpointed stage. The orchestrator owns stage
//! transitions; this module only does the work and reports an outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assembler::Assembler;
use crate::audio;
use crate::checkpoint::{CheckpointEvent, CheckpointWriter};
use crate::chunker::Chunker;
use crate::config::Config;
use crate::error::PipelineError;
use crate::hooks::{self, ItemHook, Publisher};
use crate::llm::{GeneratedText, GenerationRequest, TextGenerator};
use crate::model::{AudioVariant, ContentItem, ContentKind, ContentStore, RunFlags, VariantKey, Verdict};
use crate::pool::{SynthesisPool, VariantJob};
use crate::qa::{Assessment, QaEngine, QaEntry, QaReport};
use crate::retry::{RetryPolicy, with_retry};
use crate::state::{CheckpointStore, ChunkRecord, PipelineState, Stage, StageStatus};
use crate::stt::{QualityJudge, Transcriber};
use crate::tts::SpeechSynthesizer;

const RECENT_TITLES: usize = 20;
const DEFAULT_COVER: &str = "default.svg";
const SYNC_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Every external collaborator a run talks to, constructed once per run.
#[derive(Clone)]
pub struct Providers {
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub judge: Option<Arc<dyn QualityJudge>>,
    pub enricher: Option<Arc<dyn ItemHook>>,
    pub cover_artist: Option<Arc<dyn ItemHook>>,
    pub publisher: Arc<dyn Publisher>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Done(Option<String>),
    Skipped(String),
    Failed(String),
}

impl StageOutcome {
    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Done(_) => StageStatus::Done,
            StageOutcome::Skipped(_) => StageStatus::Skipped,
            StageOutcome::Failed(_) => StageStatus::Failed,
        }
    }

    pub fn into_message(self) -> Option<String> {
        match self {
            StageOutcome::Done(note) => note,
            StageOutcome::Skipped(reason) | StageOutcome::Failed(reason) => Some(reason),
        }
    }
}

pub struct StageExecutor {
    config: Arc<Config>,
    providers: Providers,
    flags: RunFlags,
    checkpoint: Option<CheckpointStore>,
    pool: SynthesisPool,
    qa: QaEngine,
    chunker: Chunker,
    assembler: Assembler,
}

impl StageExecutor {
    /// `checkpoint` is `None` when nothing may be persisted.
    pub fn new(
        config: Arc<Config>,
        providers: Providers,
        flags: RunFlags,
        checkpoint: Option<CheckpointStore>,
    ) -> Self {
        let pool = SynthesisPool::new(
            Arc::clone(&providers.synthesizer),
            &config.synthesis,
            &config.scratch_dir,
        );
        let qa = QaEngine::new(
            Arc::clone(&providers.transcriber),
            providers.judge.clone(),
            config.qa.clone(),
        );
        Self {
            chunker: Chunker::new(&config.chunking, &config.assembly),
            assembler: Assembler::new(config.assembly.clone()),
            pool,
            qa,
            flags,
            checkpoint,
            providers,
            config,
        }
    }

    pub async fn execute(&self, stage: Stage, state: &mut PipelineState) -> StageOutcome {
        let result = match stage {
            Stage::Generate => self.generate(state).await,
            Stage::Audio => self.audio(state).await,
            Stage::Qa => self.qa(state).await,
            Stage::Enrich => self.enrich(state).await,
            Stage::Covers => self.covers(state).await,
            Stage::Sync => self.sync(state).await,
            Stage::Publish => self.publish(state).await,
            other => Err(PipelineError::Invocation(format!(
                "{other} is not a checkpointed stage"
            ))),
        };
        result.unwrap_or_else(|e| {
            error!("Stage {} failed: {}", stage, e);
            StageOutcome::Failed(e.to_string())
        })
    }

    fn content(&self) -> Result<ContentStore, PipelineError> {
        Ok(ContentStore::open(&self.config.content_root)?)
    }

    fn persist(&self, state: &PipelineState) -> Result<(), PipelineError> {
        if let Some(store) = &self.checkpoint {
            store.save(state)?;
        }
        Ok(())
    }

    async fn generate(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let mut store = self.content()?;

        // items written to content.json by a run that died before checkpointing them
        let orphans: Vec<String> = store
            .produced_by(&state.run_id)
            .map(|i| i.id.clone())
            .filter(|id| !state.item_ids.contains(id))
            .collect();
        for id in &orphans {
            info!("Adopting item {} from an interrupted run", id);
            state.add_item(id);
        }
        if !orphans.is_empty() {
            self.persist(state)?;
        }

        let gen_config = &self.config.generation;
        let policy = RetryPolicy::new(
            gen_config.max_attempts,
            gen_config.backoff_base_ms,
            gen_config.backoff_max_ms,
        );
        let timeout = Duration::from_secs(gen_config.timeout_secs);
        let retries = AtomicU32::new(0);
        let language = state.request.language.clone();
        let mut failures = Vec::new();

        for kind in ContentKind::ALL {
            let wanted = state.request.count(kind) as usize;
            let have = store
                .select(&state.item_ids)
                .filter(|i| i.kind == kind)
                .count();
            if have >= wanted {
                continue;
            }
            info!("Generating {} {}(s)", wanted - have, kind);
            for n in have..wanted {
                let request = GenerationRequest {
                    kind,
                    language: language.clone(),
                    avoid_titles: store.recent_titles(kind, &language, RECENT_TITLES),
                    theme: pick_theme(&gen_config.themes, store.items().len() + n),
                };
                let generator = &self.providers.generator;
                let label = format!("generate {kind}");
                let result = with_retry(&label, &policy, timeout, &retries, |_| generator.generate(&request)).await;
                match result {
                    Ok(generated) => {
                        let item = new_item(kind, &language, &state.run_id, generated);
                        info!(item = %item.id, "Generated {} \"{}\"", kind, item.title);
                        let id = item.id.clone();
                        store.push(item);
                        store.save()?;
                        state.add_item(&id);
                        self.persist(state)?;
                    }
                    Err(e) => {
                        warn!("Generation of a {} failed: {}", kind, e);
                        failures.push(format!("{kind}: {e}"));
                    }
                }
            }
        }
        state.add_retries("generation", retries.load(Ordering::Relaxed));

        let requested = state.request.total() as usize;
        let produced = store.select(&state.item_ids).count();
        if requested > 0 && produced == 0 {
            return Ok(StageOutcome::Failed(format!(
                "no items generated: {}",
                failures.join("; ")
            )));
        }
        if failures.is_empty() {
            Ok(StageOutcome::Done(Some(format!("{produced} items"))))
        } else {
            Ok(StageOutcome::Done(Some(format!(
                "{produced} of {requested} items; {}",
                failures.join("; ")
            ))))
        }
    }

    fn variant_path(&self, item_id: &str, voice: &str) -> PathBuf {
        self.config.audio_dir.join(format!("{item_id}_{voice}.wav"))
    }

    /// Chunk, synthesize and assemble one (item, voice) pair. Any failure is
    /// captured in the returned variant rather than propagated.
    async fn render_variant(
        &self,
        item: &ContentItem,
        voice: &str,
        resume: &[ChunkRecord],
        progress: Option<&mpsc::Sender<CheckpointEvent>>,
    ) -> AudioVariant {
        let key = VariantKey::new(&item.id, voice);
        let plan = self.chunker.plan(&item.id, item.kind, &item.annotated_text);
        if plan.chunks.is_empty() {
            return AudioVariant::failed(voice, "no text to synthesize".to_string(), Utc::now());
        }
        let chunk_count = plan.chunks.len();
        let job = VariantJob {
            key: key.clone(),
            kind: item.kind,
            language: item.language.clone(),
            chunks: plan.chunks,
        };
        let buffers = match self.pool.synthesize(&job, resume, progress).await {
            Ok(buffers) => buffers,
            Err(e) => {
                warn!(item = %item.id, voice = voice, "{}", e);
                return AudioVariant::failed(voice, e.to_string(), Utc::now());
            }
        };
        let assembled = match self.assembler.assemble(buffers, &plan.pauses) {
            Ok(a) => a,
            Err(e) => return AudioVariant::failed(voice, format!("assembly failed: {e}"), Utc::now()),
        };
        let path = self.variant_path(&item.id, voice);
        if let Err(e) = audio::write_wav(&path, &assembled.buffer) {
            return AudioVariant::failed(voice, format!("cannot write {}: {e}", path.display()), Utc::now());
        }
        info!(
            item = %item.id,
            voice = voice,
            "Rendered {} ({:.1}s, {} chunks)",
            key,
            assembled.duration_secs,
            chunk_count
        );
        AudioVariant {
            voice: voice.to_string(),
            file: Some(path),
            duration_secs: assembled.duration_secs,
            loudness_dbfs: assembled.loudness_dbfs,
            chunk_count,
            synthesized_at: Utc::now(),
            synthesis_error: None,
            qa: None,
        }
    }

    async fn audio(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let mut store = self.content()?;
        let voices = self.config.voices_for(&state.request.language).to_vec();
        let items: Vec<ContentItem> = store.select(&state.item_ids).cloned().collect();
        if items.is_empty() {
            return Ok(StageOutcome::Skipped("no items to render".to_string()));
        }

        let mut jobs = Vec::new();
        for item in &items {
            for voice in &voices {
                let finished = state
                    .completed_variants
                    .get(&item.id)
                    .is_some_and(|v| v.contains_key(voice));
                if !finished {
                    jobs.push((item.clone(), voice.clone()));
                }
            }
        }
        info!(
            "Rendering {} variants ({} already done)",
            jobs.len(),
            items.len() * voices.len() - jobs.len()
        );

        if !jobs.is_empty()
            && let Some(voice) = voices.first()
            && let Err(e) = self.pool.warm_up(voice, &state.request.language).await
        {
            return Ok(StageOutcome::Failed(format!("synthesis provider unavailable: {e}")));
        }

        let resume = state.chunk_progress.clone();
        let snapshot = state.clone();
        let retries_before = self.pool.retry_count();
        let writer = CheckpointWriter::spawn(
            std::mem::take(state),
            self.checkpoint.clone(),
            self.config.synthesis.flush_every,
        );
        let tx = writer.sender();
        stream::iter(jobs)
            .map(|(item, voice)| {
                let tx = tx.clone();
                let resume = resume
                    .get(&VariantKey::new(&item.id, &voice).to_string())
                    .cloned()
                    .unwrap_or_default();
                async move {
                    let variant = self.render_variant(&item, &voice, &resume, Some(&tx)).await;
                    let event = CheckpointEvent::VariantDone {
                        key: VariantKey::new(&item.id, &voice),
                        variant,
                    };
                    if tx.send(event).await.is_err() {
                        warn!("Checkpoint writer gone; {}/{} not recorded", item.id, voice);
                    }
                }
            })
            .buffer_unordered(self.config.synthesis.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
        let retried = self.pool.retry_count().saturating_sub(retries_before);
        if retried > 0 {
            let event = CheckpointEvent::Retries {
                counter: "synthesis".to_string(),
                count: retried,
            };
            if tx.send(event).await.is_err() {
                warn!("Checkpoint writer gone; {} synthesis retries not recorded", retried);
            }
        }
        drop(tx);

        match writer.finish().await {
            Ok(finished) => *state = finished,
            Err(e) => {
                *state = snapshot;
                return Err(e.into());
            }
        }

        let now = Utc::now();
        let mut rendered = 0;
        let mut failed = 0;
        for (item_id, variants) in &state.completed_variants {
            let Some(item) = store.get_mut(item_id) else {
                continue;
            };
            for variant in variants.values() {
                if variant.synthesis_error.is_some() {
                    failed += 1;
                } else {
                    rendered += 1;
                    self.pool.discard(&VariantKey::new(item_id, &variant.voice)).await;
                }
                if item.audio_variants.get(&variant.voice) != Some(variant) {
                    item.put_variant(variant.clone(), now);
                }
            }
        }
        store.save()?;
        state.completed_variants.clear();

        if rendered == 0 {
            return Ok(StageOutcome::Failed(format!("all {failed} variants failed")));
        }
        Ok(StageOutcome::Done(Some(format!(
            "{rendered} variants rendered, {failed} failed"
        ))))
    }

    fn apply_assessments(
        store: &mut ContentStore,
        item_id: &str,
        assessments: Vec<Assessment>,
        transcripts: &mut BTreeMap<VariantKey, String>,
    ) {
        let Some(item) = store.get_mut(item_id) else {
            return;
        };
        for assessment in assessments {
            if let Some(variant) = item.audio_variants.get_mut(&assessment.voice) {
                variant.qa = Some(assessment.verdict);
            }
            if let Some(transcript) = assessment.transcript {
                transcripts.insert(VariantKey::new(item_id, &assessment.voice), transcript);
            }
        }
        item.touch("audio_variants", Utc::now());
    }

    /// Move a rejected variant's file aside so the replacement can take its name.
    fn retire_variant(&self, store: &mut ContentStore, item_id: &str, voice: &str) {
        let Some(variant) = store
            .get_mut(item_id)
            .and_then(|i| i.audio_variants.get_mut(voice))
        else {
            return;
        };
        let Some(file) = variant.file.clone() else {
            return;
        };
        let retired = file.with_extension(format!("rejected-{}.wav", Utc::now().format("%Y%m%d%H%M%S")));
        match std::fs::rename(&file, &retired) {
            Ok(()) => variant.file = Some(retired),
            Err(e) => warn!("Could not move {} aside: {}", file.display(), e),
        }
    }

    async fn qa(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let mut store = self.content()?;
        let ids = state.item_ids.clone();
        if store.select(&ids).next().is_none() {
            return Ok(StageOutcome::Skipped("no items to score".to_string()));
        }

        let mut transcripts = BTreeMap::new();
        for id in &ids {
            let Some(item) = store.get(id).cloned() else {
                continue;
            };
            // verdicts are never rewritten
            let pending: Vec<String> = item
                .audio_variants
                .values()
                .filter(|v| v.qa.is_none())
                .map(|v| v.voice.clone())
                .collect();
            let assessments = self.qa.score_voices(&item, &pending, Utc::now()).await;
            Self::apply_assessments(&mut store, id, assessments, &mut transcripts);
        }
        store.save()?;

        let qa_config = &self.config.qa;
        if qa_config.regenerate_failed {
            for round in 1..=qa_config.max_regenerations {
                let candidates: Vec<(String, String)> = store
                    .select(&ids)
                    .flat_map(|item| {
                        item.audio_variants
                            .values()
                            .filter(|v| v.verdict() == Some(Verdict::Fail))
                            .filter(|v| {
                                let tries = item
                                    .superseded_variants
                                    .iter()
                                    .filter(|s| s.voice == v.voice && s.verdict() == Some(Verdict::Fail))
                                    .count();
                                tries < qa_config.max_regenerations as usize
                            })
                            .map(|v| (item.id.clone(), v.voice.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                if candidates.is_empty() {
                    break;
                }
                info!("Regenerating {} failed variants (round {})", candidates.len(), round);
                for (id, voice) in candidates {
                    let Some(item) = store.get(&id).cloned() else {
                        continue;
                    };
                    self.retire_variant(&mut store, &id, &voice);
                    let key = VariantKey::new(&id, &voice);
                    let resume = state.chunk_progress.get(&key.to_string()).cloned().unwrap_or_default();
                    let variant = self.render_variant(&item, &voice, &resume, None).await;
                    if variant.synthesis_error.is_none() {
                        state.chunk_progress.remove(&key.to_string());
                        self.pool.discard(&key).await;
                    }
                    let Some(current) = store.get_mut(&id) else {
                        continue;
                    };
                    current.put_variant(variant, Utc::now());
                    let refreshed = current.clone();
                    let assessments = self.qa.score_voices(&refreshed, &[voice.clone()], Utc::now()).await;
                    Self::apply_assessments(&mut store, &id, assessments, &mut transcripts);
                }
                store.save()?;
            }
        }
        state.add_retries("qa", self.qa.retry_count());

        let mut entries = Vec::new();
        for item in store.select(&ids) {
            for variant in item.audio_variants.values() {
                let transcript = transcripts
                    .get(&VariantKey::new(&item.id, &variant.voice))
                    .map(String::as_str);
                entries.extend(QaEntry::new(item, variant, transcript));
            }
        }
        let report = QaReport::new(&state.run_id, entries, Utc::now());
        if self.checkpoint.is_some() {
            report.write(&self.config.content_root)?;
        }
        let s = &report.summary;
        info!(
            "QA: {} PASS, {} WARN, {} FAIL (avg fidelity {:.2})",
            s.passed, s.warned, s.failed, s.avg_fidelity
        );
        Ok(StageOutcome::Done(Some(format!(
            "{} PASS, {} WARN, {} FAIL",
            s.passed, s.warned, s.failed
        ))))
    }

    fn publishable_ids(&self, store: &ContentStore, state: &PipelineState) -> Vec<String> {
        store
            .select(&state.item_ids)
            .filter(|i| i.is_publishable())
            .map(|i| i.id.clone())
            .collect()
    }

    async fn enrich(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let Some(hook) = &self.providers.enricher else {
            return Ok(StageOutcome::Skipped("no enrich hook configured".to_string()));
        };
        let mut store = self.content()?;
        let ids = self.publishable_ids(&store, state);
        if ids.is_empty() {
            return Ok(StageOutcome::Skipped("no publishable items".to_string()));
        }
        let (mut enriched, mut failed) = (0, 0);
        for id in &ids {
            let Some(item) = store.get(id).cloned() else {
                continue;
            };
            if item.music_params.is_some() {
                continue;
            }
            let params = match hook.run(&item).await {
                Ok(out) => serde_json::from_str::<serde_json::Value>(out.trim())
                    .map_err(|e| anyhow::anyhow!("hook output is not JSON: {e}")),
                Err(e) => Err(e),
            };
            match params {
                Ok(params) => {
                    if let Some(item) = store.get_mut(id) {
                        item.music_params = Some(params);
                        item.touch("music_params", Utc::now());
                    }
                    enriched += 1;
                }
                Err(e) => {
                    warn!(item = %id, "Enrichment failed: {:#}", e);
                    failed += 1;
                }
            }
        }
        store.save()?;
        Ok(StageOutcome::Done(Some(format!("{enriched} enriched, {failed} failed"))))
    }

    async fn covers(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let Some(hook) = &self.providers.cover_artist else {
            return Ok(StageOutcome::Skipped("no cover hook configured".to_string()));
        };
        let mut store = self.content()?;
        let ids = self.publishable_ids(&store, state);
        if ids.is_empty() {
            return Ok(StageOutcome::Skipped("no publishable items".to_string()));
        }
        let (mut generated, mut fallback) = (0, 0);
        for id in &ids {
            let Some(item) = store.get(id).cloned() else {
                continue;
            };
            if item.cover.is_some() {
                continue;
            }
            let cover = match hook.run(&item).await {
                Ok(out) => match out.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                    Some(line) => {
                        generated += 1;
                        line.to_string()
                    }
                    None => {
                        warn!(item = %id, "Cover hook printed nothing; using default");
                        fallback += 1;
                        DEFAULT_COVER.to_string()
                    }
                },
                Err(e) => {
                    warn!(item = %id, "Cover generation failed: {:#}", e);
                    fallback += 1;
                    DEFAULT_COVER.to_string()
                }
            };
            if let Some(item) = store.get_mut(id) {
                item.cover = Some(cover);
                item.touch("cover", Utc::now());
            }
        }
        store.save()?;
        Ok(StageOutcome::Done(Some(format!(
            "{generated} covers, {fallback} defaults"
        ))))
    }

    async fn sync(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        let Some(target) = &self.config.sync.target_dir else {
            return Ok(StageOutcome::Skipped("no sync target configured".to_string()));
        };
        let store = self.content()?;
        let ids = self.publishable_ids(&store, state);
        let items: Vec<&ContentItem> = store.select(&ids).collect();
        let counts = match hooks::sync_items(&items, store.path(), target) {
            Ok(counts) => counts,
            Err(e) => return Ok(StageOutcome::Failed(format!("sync failed: {e:#}"))),
        };
        info!(
            "Synced to {}: {} copied, {} unchanged",
            target.display(),
            counts.copied,
            counts.unchanged
        );
        if !self.config.sync.command.is_empty() {
            if let Err(e) = hooks::run_command(&self.config.sync.command, Some(target), SYNC_COMMAND_TIMEOUT).await {
                return Ok(StageOutcome::Failed(format!("sync command failed: {e:#}")));
            }
        }
        Ok(StageOutcome::Done(Some(format!(
            "{} copied, {} unchanged",
            counts.copied, counts.unchanged
        ))))
    }

    async fn publish(&self, state: &mut PipelineState) -> Result<StageOutcome, PipelineError> {
        if self.flags.skip_publish {
            return Ok(StageOutcome::Skipped("publishing disabled for this run".to_string()));
        }
        let store = self.content()?;
        let ids = self.publishable_ids(&store, state);
        if ids.is_empty() {
            return Ok(StageOutcome::Skipped("no publishable items".to_string()));
        }
        let targets = &self.config.publish.targets;
        if targets.is_empty() {
            return Ok(StageOutcome::Skipped("no publish targets configured".to_string()));
        }
        let titles: Vec<&str> = store.select(&ids).map(|i| i.title.as_str()).collect();
        let message = format!(
            "Add {} items for {}: {}",
            ids.len(),
            Utc::now().format("%Y-%m-%d"),
            titles.join(", ")
        );
        let mut errors = Vec::new();
        for target in targets {
            let ok = match self.providers.publisher.publish(target, &message).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Publishing to {} failed: {:#}", target.name, e);
                    errors.push(format!("{}: {e:#}", target.name));
                    false
                }
            };
            state.publish_outcomes.insert(target.name.clone(), ok);
        }
        if errors.len() == targets.len() {
            return Ok(StageOutcome::Failed(format!(
                "all publish targets failed: {}",
                errors.join("; ")
            )));
        }
        Ok(StageOutcome::Done(Some(format!(
            "{} of {} targets published",
            targets.len() - errors.len(),
            targets.len()
        ))))
    }
}

fn pick_theme(themes: &[String], n: usize) -> Option<String> {
    if themes.is_empty() {
        return None;
    }
    Some(themes[n % themes.len()].clone())
}

fn new_item(kind: ContentKind, language: &str, run_id: &str, generated: GeneratedText) -> ContentItem {
    let now = Utc::now();
    let id = format!("{}-{}", kind.name(), &Uuid::new_v4().simple().to_string()[..12]);
    let annotated_text = generated
        .annotated_text
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| generated.text.clone());
    let mut updated_at = BTreeMap::new();
    updated_at.insert("text".to_string(), now);
    ContentItem {
        id,
        kind,
        language: language.to_string(),
        title: generated.title,
        text: generated.text,
        annotated_text,
        target_age: generated.target_age.unwrap_or_default(),
        audio_variants: BTreeMap::new(),
        superseded_variants: Vec::new(),
        music_params: None,
        cover: None,
        metadata: generated.metadata,
        created_at: now,
        updated_at,
        run_id: run_id.to_string(),
    }
}
