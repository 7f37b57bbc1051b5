use std::path::Path;
use std::sync::Arc;

use bedtime_pipeline::config::Config;
use bedtime_pipeline::model::{
    CONTENT_FILE, ContentItem, ContentKind, ContentStore, RunFlags, RunRequest, Verdict,
};
use bedtime_pipeline::orchestrator::{Orchestrator, RunResult};
use bedtime_pipeline::qa::{QaReport, REPORT_FILE};
use bedtime_pipeline::stages::Providers;
use bedtime_pipeline::state::{CheckpointStore, PipelineState, STATE_FILE, Stage, StageStatus};
use bedtime_pipeline::testing::{
    MockPublisher, MockSynthesizer, MockTextGenerator, MockTranscriber, RecordingNotifier,
};
use chrono::Utc;
use tempfile::TempDir;

fn config(root: &Path) -> Config {
    let mut config = Config::default().rooted_at(root);
    config.content_root = root.join("content");
    config.synthesis.backoff_base_ms = 1;
    config.synthesis.backoff_max_ms = 2;
    config.generation.backoff_base_ms = 1;
    config.generation.backoff_max_ms = 2;
    config.qa.backoff_base_ms = 1;
    config.qa.backoff_max_ms = 2;
    config
}

struct Harness {
    generator: Arc<MockTextGenerator>,
    synthesizer: Arc<MockSynthesizer>,
    notifier: RecordingNotifier,
    orchestrator: Orchestrator,
}

fn harness(root: &Path, synthesizer: MockSynthesizer) -> Harness {
    let config = config(root);
    let generator = Arc::new(MockTextGenerator::new());
    let synthesizer = Arc::new(synthesizer);
    let notifier = RecordingNotifier::default();
    let providers = Providers {
        generator: generator.clone(),
        synthesizer: synthesizer.clone(),
        transcriber: Arc::new(MockTranscriber::faithful(&config.content_root)),
        judge: None,
        enricher: None,
        cover_artist: None,
        publisher: Arc::new(MockPublisher::default()),
    };
    let orchestrator = Orchestrator::new(config, providers, Arc::new(notifier.clone()));
    Harness {
        generator,
        synthesizer,
        notifier,
        orchestrator,
    }
}

fn request(stories: u32, poems: u32) -> RunRequest {
    let mut request = RunRequest::default();
    request.counts.insert(ContentKind::Story, stories);
    request.counts.insert(ContentKind::Poem, poems);
    request
}

fn resume() -> RunFlags {
    RunFlags {
        resume: true,
        ..RunFlags::default()
    }
}

fn content_root(root: &Path) -> std::path::PathBuf {
    root.join("content")
}

fn items(root: &Path) -> Vec<ContentItem> {
    ContentStore::open(&content_root(root))
        .unwrap()
        .items()
        .to_vec()
}

fn checkpoint(root: &Path) -> PipelineState {
    CheckpointStore::new(&content_root(root))
        .load()
        .unwrap()
        .unwrap()
}

fn assert_notified_once(h: &Harness) -> bedtime_pipeline::notify::RunSummary {
    let summaries = h.notifier.summaries();
    assert_eq!(summaries.len(), 1);
    summaries[0].clone()
}

#[tokio::test]
async fn test_one_failed_voice_is_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        dir.path(),
        MockSynthesizer::new().with_failure(|req| req.voice == "female_2" && req.text.contains("fox")),
    );

    let result: RunResult = h.orchestrator.run(request(1, 1), RunFlags::default(), None).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.status(Stage::Qa), Some(StageStatus::Done));

    let report: QaReport = serde_json::from_str(
        &std::fs::read_to_string(content_root(dir.path()).join(REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(report.summary.total, 14);
    assert_eq!(report.summary.passed + report.summary.warned, 13);
    assert_eq!(report.summary.failed, 1);
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed[0].voice, "female_2");
    assert!(failed[0].reason.starts_with("synthesis failed"));

    let story = items(dir.path())
        .into_iter()
        .find(|i| i.kind == ContentKind::Story)
        .unwrap();
    assert_eq!(story.audio_variants.len(), 7);
    assert_eq!(story.audio_variants["female_2"].verdict(), Some(Verdict::Fail));
    assert!(story.is_publishable());

    let summary = assert_notified_once(&h);
    assert!(summary.succeeded());
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].contains("(female_2)"));
    assert_eq!(summary.items, 2);
}

fn wav_files_under(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                wav_files_under(&path)
            } else {
                usize::from(path.extension().is_some_and(|x| x == "wav"))
            }
        })
        .sum()
}

#[tokio::test]
async fn test_clean_run_leaves_no_chunk_audio_behind() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 0), RunFlags::default(), None).await;
    assert_eq!(result.exit_code(), 0);

    let scratch = config(dir.path()).scratch_dir;
    assert_eq!(wav_files_under(&scratch), 0);
    let state = checkpoint(dir.path());
    assert!(state.chunk_progress.is_empty());
    assert!(state.is_complete());
}

#[tokio::test]
async fn test_resume_retries_audio_without_regenerating() {
    let dir = TempDir::new().unwrap();

    let first = harness(dir.path(), MockSynthesizer::new().unavailable());
    let result = first.orchestrator.run(request(1, 0), RunFlags::default(), None).await;
    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.status(Stage::Audio), Some(StageStatus::Failed));
    assert_eq!(result.status(Stage::Qa), Some(StageStatus::Pending));
    let summary = assert_notified_once(&first);
    assert_eq!(summary.failed_stage.as_ref().map(|(s, _)| *s), Some(Stage::Audio));

    let before = checkpoint(dir.path());
    assert_eq!(before.status(Stage::Generate), StageStatus::Done);
    assert_eq!(before.status(Stage::Audio), StageStatus::Failed);
    let generate_record = before.record(Stage::Generate).cloned().unwrap();

    let second = harness(dir.path(), MockSynthesizer::new());
    let result = second.orchestrator.run(request(1, 0), resume(), None).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.status(Stage::Generate), None);
    assert_eq!(result.status(Stage::Audio), Some(StageStatus::Done));
    assert_eq!(second.generator.calls(), 0);
    assert!(second.synthesizer.calls() > 0);

    let after = checkpoint(dir.path());
    assert_eq!(after.run_id, before.run_id);
    assert_eq!(after.record(Stage::Generate), Some(&generate_record));
    assert_eq!(after.record(Stage::Audio).map(|r| r.attempts), Some(2));
    assert!(after.is_complete());
    assert_eq!(items(dir.path()).len(), 1);
}

#[tokio::test]
async fn test_resume_after_crash_mid_generate_adopts_written_items() {
    let uninterrupted = TempDir::new().unwrap();
    let h = harness(uninterrupted.path(), MockSynthesizer::new());
    assert_eq!(h.orchestrator.run(request(1, 1), RunFlags::default(), None).await.exit_code(), 0);
    let expected = items(uninterrupted.path());

    // The story reached content.json but the process died before the
    // checkpoint recorded it.
    let crashed = TempDir::new().unwrap();
    let root = content_root(crashed.path());
    let mut state = PipelineState::new("run-crashed", request(1, 1), Utc::now());
    state.begin(Stage::Generate, Utc::now()).unwrap();
    CheckpointStore::new(&root).save(&state).unwrap();
    let mut store = ContentStore::open(&root).unwrap();
    let mut orphan = expected
        .iter()
        .find(|i| i.kind == ContentKind::Story)
        .cloned()
        .unwrap();
    orphan.id = "story-orphan".to_string();
    orphan.run_id = "run-crashed".to_string();
    orphan.audio_variants.clear();
    store.push(orphan);
    store.save().unwrap();

    let h = harness(crashed.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 1), resume(), None).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.run_id, "run-crashed");
    // only the poem was still missing
    assert_eq!(h.generator.calls(), 1);

    let produced = items(crashed.path());
    assert_eq!(produced.len(), expected.len());
    let kinds = |items: &[ContentItem]| {
        let mut kinds: Vec<ContentKind> = items.iter().map(|i| i.kind).collect();
        kinds.sort();
        kinds
    };
    assert_eq!(kinds(&produced), kinds(&expected));
    assert!(produced.iter().all(|i| i.audio_variants.len() == 7));
    assert_eq!(checkpoint(crashed.path()).item_ids.len(), 2);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_fatal_on_resume() {
    let dir = TempDir::new().unwrap();
    let root = content_root(dir.path());
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join(STATE_FILE), "{ not json").unwrap();

    let h = harness(dir.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 0), resume(), None).await;
    assert_eq!(result.exit_code(), 2);
    assert_eq!(h.generator.calls(), 0);
    let summary = assert_notified_once(&h);
    assert!(summary.fatal.as_deref().unwrap_or("").contains("corrupt"));
    // left in place for the operator to restore
    assert!(root.join(STATE_FILE).exists());
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_set_aside_on_fresh_run() {
    let dir = TempDir::new().unwrap();
    let root = content_root(dir.path());
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join(STATE_FILE), "{ not json").unwrap();

    let h = harness(dir.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 0), RunFlags::default(), None).await;
    assert_eq!(result.exit_code(), 0);
    let quarantined = std::fs::read_dir(&root)
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
    assert!(quarantined);
    assert!(checkpoint(dir.path()).is_complete());
}

#[tokio::test]
async fn test_step_reruns_one_stage() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), MockSynthesizer::new());
    assert_eq!(h.orchestrator.run(request(1, 0), RunFlags::default(), None).await.exit_code(), 0);
    let before = checkpoint(dir.path());

    let h = harness(dir.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 0), RunFlags::default(), Some(Stage::Qa)).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.status(Stage::Qa), Some(StageStatus::Done));
    assert_eq!(result.status(Stage::Audio), None);
    assert_eq!(h.generator.calls(), 0);
    assert_eq!(h.synthesizer.calls(), 0);

    let after = checkpoint(dir.path());
    assert_eq!(after.run_id, before.run_id);
    assert_eq!(after.record(Stage::Audio), before.record(Stage::Audio));
    assert_eq!(after.record(Stage::Qa).map(|r| r.attempts), Some(2));
    assert_eq!(items(dir.path()).len(), 1);
    assert!(content_root(dir.path()).join(CONTENT_FILE).exists());
}

#[tokio::test]
async fn test_step_without_prerequisites_is_fatal() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), MockSynthesizer::new());
    let result = h.orchestrator.run(request(1, 0), RunFlags::default(), Some(Stage::Audio)).await;
    assert_eq!(result.exit_code(), 2);
    assert_eq!(h.synthesizer.calls(), 0);
    assert_notified_once(&h);
}
