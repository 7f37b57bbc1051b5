use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StateError;
use crate::model::{AudioVariant, RunRequest};

pub const STATE_FILE: &str = "pipeline_state.json";
pub const LOCK_FILE: &str = "pipeline.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preflight,
    Generate,
    Audio,
    Qa,
    Enrich,
    Covers,
    Sync,
    Publish,
    Postflight,
    Notify,
}

impl Stage {
    /// Stages with a persisted status, in execution order.
    pub const CHECKPOINTED: [Stage; 7] = [
        Stage::Generate,
        Stage::Audio,
        Stage::Qa,
        Stage::Enrich,
        Stage::Covers,
        Stage::Sync,
        Stage::Publish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Generate => "generate",
            Stage::Audio => "audio",
            Stage::Qa => "qa",
            Stage::Enrich => "enrich",
            Stage::Covers => "covers",
            Stage::Sync => "sync",
            Stage::Publish => "publish",
            Stage::Postflight => "postflight",
            Stage::Notify => "notify",
        }
    }

    pub fn is_checkpointed(&self) -> bool {
        Self::CHECKPOINTED.contains(self)
    }

    /// Every checkpointed stage that runs before this one.
    pub fn prerequisites(&self) -> &'static [Stage] {
        match Self::CHECKPOINTED.iter().position(|s| s == self) {
            Some(idx) => &Self::CHECKPOINTED[..idx],
            None => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Done or explicitly skipped: downstream stages may proceed.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StageStatus::Done | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageRecord {
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Cumulative across attempts, feeds cost estimation.
    pub elapsed_secs: f64,
    pub attempts: u32,
    pub error: Option<String>,
    pub note: Option<String>,
}

/// A synthesized chunk already on disk, reusable on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub digest: String,
    pub file: PathBuf,
}

/// Durable checkpoint for one content root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub last_run_at: DateTime<Utc>,
    pub request: RunRequest,
    pub stages: BTreeMap<Stage, StageRecord>,
    pub item_ids: Vec<String>,
    pub retry_counters: BTreeMap<String, u32>,
    /// Keyed by `item/voice`.
    #[serde(default)]
    pub chunk_progress: BTreeMap<String, Vec<ChunkRecord>>,
    /// Variants finished by an AUDIO stage that has not completed yet.
    #[serde(default)]
    pub completed_variants: BTreeMap<String, BTreeMap<String, AudioVariant>>,
    #[serde(default)]
    pub publish_outcomes: BTreeMap<String, bool>,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, request: RunRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: now,
            last_run_at: now,
            request,
            stages: Stage::CHECKPOINTED
                .iter()
                .map(|s| (*s, StageRecord::default()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stages
            .get(&stage)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    /// First checkpointed stage that is neither done nor skipped.
    pub fn first_unfinished(&self) -> Option<Stage> {
        Stage::CHECKPOINTED
            .iter()
            .copied()
            .find(|s| !self.status(*s).is_satisfied())
    }

    pub fn is_complete(&self) -> bool {
        self.first_unfinished().is_none()
    }

    pub fn check_prerequisites(&self, stage: Stage) -> Result<(), StateError> {
        match stage
            .prerequisites()
            .iter()
            .find(|p| !self.status(**p).is_satisfied())
        {
            Some(missing) => Err(StateError::PrerequisiteNotMet {
                stage,
                missing: *missing,
            }),
            None => Ok(()),
        }
    }

    /// Move a finished stage back to pending so it can be run again.
    pub fn reopen(&mut self, stage: Stage) -> Result<(), StateError> {
        let record = self.stages.entry(stage).or_default();
        match record.status {
            StageStatus::Done | StageStatus::Skipped | StageStatus::Failed => {
                record.status = StageStatus::Pending;
                Ok(())
            }
            StageStatus::Pending => Ok(()),
            from => Err(StateError::InvalidTransition {
                stage,
                from,
                to: StageStatus::Pending,
            }),
        }
    }

    /// pending → running and failed → running. A stage left `running` by a
    /// crashed process may also be restarted.
    pub fn begin(&mut self, stage: Stage, now: DateTime<Utc>) -> Result<(), StateError> {
        self.check_prerequisites(stage)?;
        let record = self.stages.entry(stage).or_default();
        match record.status {
            StageStatus::Pending | StageStatus::Failed | StageStatus::Running => {
                record.status = StageStatus::Running;
                record.started_at = Some(now);
                record.finished_at = None;
                record.attempts += 1;
                record.error = None;
                record.note = None;
                self.last_run_at = now;
                Ok(())
            }
            from => Err(StateError::InvalidTransition {
                stage,
                from,
                to: StageStatus::Running,
            }),
        }
    }

    pub fn finish(
        &mut self,
        stage: Stage,
        outcome: StageStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        if !matches!(
            outcome,
            StageStatus::Done | StageStatus::Failed | StageStatus::Skipped
        ) {
            return Err(StateError::InvalidTransition {
                stage,
                from: self.status(stage),
                to: outcome,
            });
        }
        if outcome.is_satisfied() {
            self.check_prerequisites(stage)?;
        }
        let record = self.stages.entry(stage).or_default();
        if record.status != StageStatus::Running {
            return Err(StateError::InvalidTransition {
                stage,
                from: record.status,
                to: outcome,
            });
        }
        record.status = outcome;
        record.finished_at = Some(now);
        if let Some(started) = record.started_at {
            let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
            record.elapsed_secs += elapsed;
        }
        match outcome {
            StageStatus::Failed => record.error = message,
            _ => record.note = message,
        }
        self.last_run_at = now;
        Ok(())
    }

    pub fn add_item(&mut self, id: &str) {
        if !self.item_ids.iter().any(|i| i == id) {
            self.item_ids.push(id.to_string());
        }
    }

    pub fn add_retries(&mut self, counter: &str, count: u32) {
        if count > 0 {
            *self.retry_counters.entry(counter.to_string()).or_insert(0) += count;
        }
    }

    pub fn elapsed_secs(&self, stage: Stage) -> f64 {
        self.record(stage).map(|r| r.elapsed_secs).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(content_root: &Path) -> Self {
        Self {
            path: content_root.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no checkpoint exists yet; `Corrupt` when it cannot be parsed.
    pub fn load(&self) -> Result<Option<PipelineState>, StateError> {
        read_json(&self.path)
    }

    pub fn save(&self, state: &PipelineState) -> Result<(), StateError> {
        write_json_atomic(&self.path, state)
    }

    /// Move an unreadable checkpoint aside so a fresh run can start.
    pub fn quarantine(&self) -> Result<PathBuf, StateError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let target = self.path.with_extension(format!("json.corrupt-{stamp}"));
        fs::rename(&self.path, &target).map_err(|e| StateError::io(&self.path, e))?;
        warn!("Moved unreadable checkpoint to {}", target.display());
        Ok(target)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Serialize to `<file>.tmp`, fsync, keep the previous file as `<file>.bak`,
/// then rename over the original.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = sibling(path, "tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| StateError::io(&tmp, e))?;
        file.write_all(&data).map_err(|e| StateError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StateError::io(&tmp, e))?;
    }
    if path.exists() {
        let bak = sibling(path, "bak");
        if let Err(e) = fs::copy(path, &bak) {
            warn!("Could not refresh backup {}: {}", bak.display(), e);
        }
    }
    fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Advisory lock held for the lifetime of one orchestrator process.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, stale_after: Duration) -> Result<Self, StateError> {
        fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        let path = dir.join(LOCK_FILE);
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Self::is_stale(&path, stale_after) {
                    warn!("Removing stale run lock {}", path.display());
                    fs::remove_file(&path).map_err(|e| StateError::io(&path, e))?;
                    Self::create(&path).map_err(|e| StateError::io(&path, e))
                } else {
                    let pid = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.lines().next().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    Err(StateError::Locked { path, pid })
                }
            }
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        writeln!(file, "{}", Utc::now().to_rfc3339())?;
        info!("Acquired run lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > stale_after)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove run lock {}: {}", self.path.display(), e);
        }
    }
}
