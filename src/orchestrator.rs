//! Top-level state machine: PREFLIGHT, the checkpointed stages, POSTFLIGHT
//! and NOTIFY. Owns the checkpoint file and the run lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PipelineError, StateError};
use crate::http;
use crate::model::{ContentStore, RunFlags, RunRequest, Verdict};
use crate::notify::{CostEstimate, Notifier, RunSummary, tail_lines};
use crate::stages::{Providers, StageExecutor, StageOutcome};
use crate::state::{CheckpointStore, PipelineState, RunLock, Stage, StageStatus};

pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(3 * 60 * 60);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_PROBE: &str = ".write-probe";

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    /// Every stage in order with the status it ended this invocation in.
    pub outcomes: Vec<(Stage, StageStatus)>,
    pub summary: RunSummary,
}

impl RunResult {
    /// 0 on success (QA WARN and FAIL included), 1 when a stage failed,
    /// 2 when the run could not proceed at all.
    pub fn exit_code(&self) -> i32 {
        if self.summary.fatal.is_some() {
            2
        } else if self.summary.failed_stage.is_some() {
            1
        } else {
            0
        }
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, status)| *status)
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    providers: Providers,
    notifier: Arc<dyn Notifier>,
    log_file: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: Config, providers: Providers, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config: Arc::new(config),
            providers,
            notifier,
            log_file: None,
        }
    }

    /// Log file whose tail is attached to failure notifications.
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Run the pipeline, or only `step` when given. Never returns early:
    /// exactly one notification goes out whatever happens.
    pub async fn run(&self, request: RunRequest, flags: RunFlags, step: Option<Stage>) -> RunResult {
        let clock = Instant::now();
        let mut summary = RunSummary {
            started_at: Utc::now(),
            dry_run: flags.dry_run,
            ..RunSummary::default()
        };
        let mut outcomes = Vec::new();

        if let Err(e) = self.drive(request, flags, step, &mut summary, &mut outcomes).await {
            error!("Run aborted: {}", e);
            summary.fatal = Some(e.to_string());
        }
        summary.elapsed_secs = clock.elapsed().as_secs_f64();
        if !summary.succeeded()
            && let Some(log) = &self.log_file
        {
            summary.log_tail = tail_lines(log, self.config.notify.log_tail_lines);
        }

        info!("Stage notify");
        let notified = match self.notifier.notify(&summary).await {
            Ok(()) => StageStatus::Done,
            Err(e) => {
                warn!("Notification failed: {:#}", e);
                StageStatus::Failed
            }
        };
        outcomes.push((Stage::Notify, notified));

        for (stage, status) in &outcomes {
            info!("  {:<10} {}", stage.name(), status);
        }
        RunResult {
            run_id: summary.run_id.clone(),
            outcomes,
            summary,
        }
    }

    async fn drive(
        &self,
        request: RunRequest,
        flags: RunFlags,
        step: Option<Stage>,
        summary: &mut RunSummary,
        outcomes: &mut Vec<(Stage, StageStatus)>,
    ) -> Result<(), PipelineError> {
        if let Some(stage) = step
            && !stage.is_checkpointed()
        {
            return Err(PipelineError::Invocation(format!("{stage} cannot be run as a step")));
        }

        info!("Stage preflight");
        self.preflight(flags).await;
        outcomes.push((Stage::Preflight, StageStatus::Done));

        let _lock = if flags.dry_run {
            None
        } else {
            Some(RunLock::acquire(&self.config.content_root, LOCK_STALE_AFTER)?)
        };
        let store = CheckpointStore::new(&self.config.content_root);
        let mut state = self.load_state(&store, request, flags, step)?;
        summary.run_id = state.run_id.clone();

        let stages = plan(&mut state, step)?;
        let persist = (!flags.dry_run).then(|| store.clone());
        if let Some(store) = &persist {
            store.save(&state)?;
        }

        if flags.dry_run {
            self.log_plan(&state, &stages);
        }
        let executor = StageExecutor::new(Arc::clone(&self.config), self.providers.clone(), flags, persist.clone());

        for &stage in &stages {
            state.begin(stage, Utc::now())?;
            let outcome = if flags.dry_run {
                StageOutcome::Skipped("dry run".to_string())
            } else {
                store.save(&state)?;
                info!("Stage {}", stage);
                executor.execute(stage, &mut state).await
            };
            let status = outcome.status();
            let message = outcome.into_message();
            match status {
                StageStatus::Failed => error!("Stage {} failed: {}", stage, message.as_deref().unwrap_or("")),
                _ => info!("Stage {} {}: {}", stage, status, message.as_deref().unwrap_or("-")),
            }
            state.finish(stage, status, message.clone(), Utc::now())?;
            if let Some(store) = &persist {
                store.save(&state)?;
            }
            outcomes.push((stage, status));
            if status == StageStatus::Failed {
                summary.failed_stage = Some((stage, message.unwrap_or_default()));
                break;
            }
        }
        for stage in Stage::CHECKPOINTED {
            if stages.contains(&stage) && !outcomes.iter().any(|(s, _)| *s == stage) {
                warn!("Stage {} not run", stage);
                outcomes.push((stage, state.status(stage)));
            }
        }

        info!("Stage postflight");
        self.postflight(&mut state, summary)?;
        if let Some(store) = &persist {
            store.save(&state)?;
        }
        outcomes.push((Stage::Postflight, StageStatus::Done));
        Ok(())
    }

    /// Warnings only: nothing found here stops the run.
    async fn preflight(&self, flags: RunFlags) {
        let root = &self.config.content_root;
        if !flags.dry_run {
            if let Err(e) = check_writable(root) {
                warn!("Content root {} is not writable: {}", root.display(), e);
            }
            if let Err(e) = fs::create_dir_all(&self.config.audio_dir) {
                warn!("Cannot create {}: {}", self.config.audio_dir.display(), e);
            }
        }

        for (provider, env) in [
            ("text generation", &self.config.generation.api_key_env),
            ("transcription", &self.config.qa.api_key_env),
            ("notification", &self.config.notify.api_key_env),
        ] {
            if http::api_key(env).is_none() {
                warn!("{} is not set; {} calls will be unauthenticated", env, provider);
            }
        }

        if flags.dry_run {
            return;
        }
        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.providers.synthesizer.health()).await {
            Ok(Ok(())) => info!("Synthesis provider is healthy"),
            Ok(Err(e)) => warn!("Synthesis health check failed: {}", e),
            Err(_) => warn!("Synthesis health check timed out; provider may be cold"),
        }
        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.providers.generator.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Text generation provider check failed: {}", e),
            Err(_) => warn!("Text generation provider check timed out"),
        }
    }

    fn load_state(
        &self,
        store: &CheckpointStore,
        request: RunRequest,
        flags: RunFlags,
        step: Option<Stage>,
    ) -> Result<PipelineState, PipelineError> {
        let continuing = flags.resume || step.is_some();
        let fresh = |request: RunRequest| {
            let run_id = format!("{}-{}", Utc::now().format("%Y%m%d"), &Uuid::new_v4().simple().to_string()[..8]);
            info!("Starting run {}", run_id);
            PipelineState::new(run_id, request, Utc::now())
        };

        match store.load() {
            Ok(Some(previous)) if continuing => {
                if step.is_none() && previous.is_complete() {
                    info!("Run {} already completed; starting a new one", previous.run_id);
                    return Ok(fresh(request));
                }
                if previous.request != request && step.is_none() {
                    warn!("Resuming with the original request of run {}", previous.run_id);
                }
                info!("Resuming run {}", previous.run_id);
                Ok(previous)
            }
            Ok(_) => Ok(fresh(request)),
            Err(e @ StateError::Corrupt { .. }) => {
                if continuing {
                    error!("Restore {} from its .bak copy before resuming", store.path().display());
                    return Err(e.into());
                }
                warn!("{}", e);
                if !flags.dry_run {
                    store.quarantine()?;
                }
                Ok(fresh(request))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn log_plan(&self, state: &PipelineState, stages: &[Stage]) {
        let voices = self.config.voices_for(&state.request.language);
        for (kind, count) in &state.request.counts {
            info!("Dry run: would generate {} {}(s) in {}", count, kind, state.request.language);
        }
        info!(
            "Dry run: would render {} variants with voices {}",
            state.request.total() as usize * voices.len(),
            voices.join(", ")
        );
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        info!("Dry run: stages {}", names.join(" -> "));
    }

    fn postflight(&self, state: &mut PipelineState, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let (files, bytes) = audio_usage(&self.config.audio_dir);
        summary.audio_files = files;
        summary.audio_bytes = bytes;
        summary.cost = CostEstimate::from_synthesis(state.elapsed_secs(Stage::Audio), &self.config.cost);

        let store = ContentStore::open(&self.config.content_root)?;
        for item in store.select(&state.item_ids) {
            summary.items += 1;
            summary.titles.push(item.title.clone());
            for variant in item.audio_variants.values() {
                summary.variants += 1;
                match variant.verdict() {
                    Some(Verdict::Pass) => summary.passed += 1,
                    Some(Verdict::Warn) => summary.warned += 1,
                    Some(Verdict::Fail) => {
                        summary.failed += 1;
                        let reason = variant.qa.as_ref().map(|q| q.reason.as_str()).unwrap_or("");
                        summary.failures.push(format!("{} ({}): {}", item.title, variant.voice, reason));
                    }
                    None => {}
                }
            }
        }
        state.last_run_at = Utc::now();
        info!(
            "{} items, {} variants, {} audio files ({:.1} MB), est. cost ${:.2}",
            summary.items,
            summary.variants,
            summary.audio_files,
            summary.audio_bytes as f64 / 1_048_576.0,
            summary.cost.run_cost
        );
        Ok(())
    }
}

/// Stages to run this invocation. A step reopens its stage; a resume picks
/// up every unfinished stage; a fresh state runs them all.
fn plan(state: &mut PipelineState, step: Option<Stage>) -> Result<Vec<Stage>, PipelineError> {
    if let Some(stage) = step {
        state.check_prerequisites(stage)?;
        // a stage left running by a crash can be begun again as is
        if state.status(stage) != StageStatus::Running {
            state.reopen(stage)?;
        }
        return Ok(vec![stage]);
    }
    let Some(first) = state.first_unfinished() else {
        return Ok(Vec::new());
    };
    Ok(Stage::CHECKPOINTED
        .iter()
        .copied()
        .filter(|s| *s >= first && !state.status(*s).is_satisfied())
        .collect())
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(WRITE_PROBE);
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)
}

fn audio_usage(dir: &Path) -> (usize, u64) {
    let Ok(entries) = fs::read_dir(dir) else {
        return (0, 0);
    };
    entries
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "wav"))
        .filter_map(|e| e.metadata().ok())
        .fold((0, 0), |(n, bytes), meta| (n + 1, bytes + meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;
    use crate::testing::{
        MockPublisher, MockSynthesizer, MockTextGenerator, MockTranscriber, RecordingNotifier,
    };
    use tempfile::TempDir;

    fn orchestrator(root: &Path, notifier: RecordingNotifier) -> Orchestrator {
        let mut config = Config::default().rooted_at(root);
        config.content_root = root.to_path_buf();
        config.voices.insert("en".to_string(), vec!["v1".to_string()]);
        config.synthesis.backoff_base_ms = 1;
        config.synthesis.backoff_max_ms = 2;
        let providers = Providers {
            generator: Arc::new(MockTextGenerator::new()),
            synthesizer: Arc::new(MockSynthesizer::new()),
            transcriber: Arc::new(MockTranscriber::faithful(root)),
            judge: None,
            enricher: None,
            cover_artist: None,
            publisher: Arc::new(MockPublisher::default()),
        };
        Orchestrator::new(config, providers, Arc::new(notifier))
    }

    fn one_story() -> RunRequest {
        let mut request = RunRequest::default();
        request.counts.insert(ContentKind::Story, 1);
        request
    }

    #[test]
    fn test_plan_resume_starts_at_first_unfinished() {
        let mut state = PipelineState::new("r", RunRequest::default(), Utc::now());
        for stage in [Stage::Generate, Stage::Audio] {
            state.begin(stage, Utc::now()).unwrap();
            state.finish(stage, StageStatus::Done, None, Utc::now()).unwrap();
        }
        let stages = plan(&mut state, None).unwrap();
        assert_eq!(stages.first(), Some(&Stage::Qa));
        assert_eq!(stages.len(), 5);
    }

    #[test]
    fn test_plan_step_requires_prerequisites() {
        let mut state = PipelineState::new("r", RunRequest::default(), Utc::now());
        assert!(plan(&mut state, Some(Stage::Qa)).is_err());
        assert_eq!(plan(&mut state, Some(Stage::Generate)).unwrap(), vec![Stage::Generate]);
    }

    #[tokio::test]
    async fn test_dry_run_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let notifier = RecordingNotifier::default();
        let result = orchestrator(dir.path(), notifier.clone())
            .run(one_story(), RunFlags { dry_run: true, ..RunFlags::default() }, None)
            .await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.status(Stage::Generate), Some(StageStatus::Skipped));
        assert!(!dir.path().join(crate::state::STATE_FILE).exists());
        assert_eq!(notifier.summaries().len(), 1);
        assert!(notifier.summaries()[0].dry_run);
    }

    #[tokio::test]
    async fn test_held_lock_is_fatal() {
        let dir = TempDir::new().unwrap();
        let _held = RunLock::acquire(dir.path(), LOCK_STALE_AFTER).unwrap();
        let notifier = RecordingNotifier::default();
        let result = orchestrator(dir.path(), notifier.clone())
            .run(one_story(), RunFlags::default(), None)
            .await;
        assert_eq!(result.exit_code(), 2);
        let summaries = notifier.summaries();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].fatal.as_deref().unwrap_or("").contains("another run"));
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let dir = TempDir::new().unwrap();
        let notifier = RecordingNotifier::default();
        let result = orchestrator(dir.path(), notifier.clone())
            .run(one_story(), RunFlags::default(), None)
            .await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.status(Stage::Audio), Some(StageStatus::Done));
        assert_eq!(result.status(Stage::Enrich), Some(StageStatus::Skipped));
        assert_eq!(result.status(Stage::Notify), Some(StageStatus::Done));

        let summary = &notifier.summaries()[0];
        assert_eq!(summary.items, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.audio_files, 1);
        assert!(summary.cost.run_cost > 0.0);

        let state = CheckpointStore::new(dir.path()).load().unwrap().unwrap();
        assert!(state.is_complete());
        assert!(!dir.path().join(crate::state::LOCK_FILE).exists());
    }
}
