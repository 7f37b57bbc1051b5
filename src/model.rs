use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::state::{read_json, write_json_atomic};

pub const CONTENT_FILE: &str = "content.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Story,
    Poem,
    Lullaby,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [ContentKind::Story, ContentKind::Poem, ContentKind::Lullaby];

    pub fn name(&self) -> &'static str {
        match self {
            ContentKind::Story => "story",
            ContentKind::Poem => "poem",
            ContentKind::Lullaby => "lullaby",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a run was asked to produce. Persisted with the checkpoint so a
/// resumed run keeps the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub counts: BTreeMap<ContentKind, u32>,
    pub language: String,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
            language: "en".to_string(),
        }
    }
}

impl RunRequest {
    pub fn count(&self, kind: ContentKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunFlags {
    pub dry_run: bool,
    pub resume: bool,
    pub skip_publish: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u8,
    pub max: u8,
}

impl Default for AgeRange {
    fn default() -> Self {
        Self { min: 2, max: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    /// FAIL beats WARN beats PASS.
    pub fn worst(self, other: Verdict) -> Verdict {
        self.max(other)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "PASS",
            Verdict::Warn => "WARN",
            Verdict::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub verdict: Verdict,
    pub reason: String,
    pub fidelity: f64,
    pub duration_deviation: Option<f64>,
    pub quality_overall: Option<u8>,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioVariant {
    pub voice: String,
    pub file: Option<PathBuf>,
    pub duration_secs: f64,
    pub loudness_dbfs: Option<f32>,
    pub chunk_count: usize,
    pub synthesized_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaVerdict>,
}

impl AudioVariant {
    pub fn failed(voice: &str, error: String, now: DateTime<Utc>) -> Self {
        Self {
            voice: voice.to_string(),
            file: None,
            duration_secs: 0.0,
            loudness_dbfs: None,
            chunk_count: 0,
            synthesized_at: now,
            synthesis_error: Some(error),
            qa: None,
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.qa.as_ref().map(|q| q.verdict)
    }

    pub fn is_usable(&self) -> bool {
        self.file.is_some() && matches!(self.verdict(), Some(Verdict::Pass | Verdict::Warn))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantKey {
    pub item_id: String,
    pub voice: String,
}

impl VariantKey {
    pub fn new(item_id: &str, voice: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            voice: voice.to_string(),
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.voice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub kind: ContentKind,
    pub language: String,
    pub title: String,
    pub text: String,
    pub annotated_text: String,
    #[serde(default)]
    pub target_age: AgeRange,
    #[serde(default)]
    pub audio_variants: BTreeMap<String, AudioVariant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded_variants: Vec<AudioVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Field name → last write.
    #[serde(default)]
    pub updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Run that produced the item, used to reconcile after a crash.
    #[serde(default)]
    pub run_id: String,
}

impl ContentItem {
    pub fn touch(&mut self, field: &str, now: DateTime<Utc>) {
        self.updated_at.insert(field.to_string(), now);
    }

    /// Replace the variant for `variant.voice`, keeping any previous one in history.
    pub fn put_variant(&mut self, variant: AudioVariant, now: DateTime<Utc>) {
        if let Some(previous) = self.audio_variants.insert(variant.voice.clone(), variant) {
            self.superseded_variants.push(previous);
        }
        self.touch("audio_variants", now);
    }

    pub fn is_publishable(&self) -> bool {
        self.audio_variants.values().any(AudioVariant::is_usable)
    }

    pub fn usable_variants(&self) -> impl Iterator<Item = &AudioVariant> {
        self.audio_variants.values().filter(|v| v.is_usable())
    }
}

/// `content.json`: the array of every item ever produced under a content root.
pub struct ContentStore {
    path: PathBuf,
    items: Vec<ContentItem>,
}

impl ContentStore {
    pub fn open(content_root: &Path) -> Result<Self, StateError> {
        let path = content_root.join(CONTENT_FILE);
        let items = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), StateError> {
        write_json_atomic(&self.path, &self.items)
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&ContentItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ContentItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    /// Items listed in `ids`, in that order. Unknown ids are ignored.
    pub fn select<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = &'a ContentItem> + 'a {
        ids.iter().filter_map(|id| self.get(id))
    }

    pub fn push(&mut self, item: ContentItem) {
        self.items.push(item);
    }

    pub fn produced_by(&self, run_id: &str) -> impl Iterator<Item = &ContentItem> {
        let run_id = run_id.to_string();
        self.items.iter().filter(move |i| i.run_id == run_id)
    }

    /// Titles of the newest items of one kind and language, newest first.
    pub fn recent_titles(&self, kind: ContentKind, language: &str, limit: usize) -> Vec<String> {
        let mut matching: Vec<&ContentItem> = self
            .items
            .iter()
            .filter(|i| i.kind == kind && i.language == language)
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
            .into_iter()
            .take(limit)
            .map(|i| i.title.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn item(id: &str, kind: ContentKind) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            kind,
            language: "en".to_string(),
            title: format!("Title {id}"),
            text: "Once upon a time.".to_string(),
            annotated_text: "[CALM] Once upon a time.".to_string(),
            target_age: AgeRange::default(),
            audio_variants: BTreeMap::new(),
            superseded_variants: Vec::new(),
            music_params: None,
            cover: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: BTreeMap::new(),
            run_id: "run-1".to_string(),
        }
    }

    fn scored(voice: &str, verdict: Verdict) -> AudioVariant {
        AudioVariant {
            voice: voice.to_string(),
            file: Some(PathBuf::from(format!("{voice}.wav"))),
            duration_secs: 10.0,
            loudness_dbfs: Some(-16.0),
            chunk_count: 1,
            synthesized_at: Utc::now(),
            synthesis_error: None,
            qa: Some(QaVerdict {
                verdict,
                reason: String::new(),
                fidelity: 0.9,
                duration_deviation: None,
                quality_overall: None,
                scored_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn test_worst_verdict() {
        assert_eq!(Verdict::Pass.worst(Verdict::Warn), Verdict::Warn);
        assert_eq!(Verdict::Fail.worst(Verdict::Pass), Verdict::Fail);
        assert_eq!(Verdict::Warn.worst(Verdict::Warn), Verdict::Warn);
    }

    #[test]
    fn test_put_variant_keeps_history() {
        let mut it = item("a", ContentKind::Story);
        it.put_variant(scored("v1", Verdict::Fail), Utc::now());
        assert!(!it.is_publishable());
        it.put_variant(scored("v1", Verdict::Warn), Utc::now());
        assert_eq!(it.superseded_variants.len(), 1);
        assert!(it.is_publishable());
        assert!(it.updated_at.contains_key("audio_variants"));
    }

    #[test]
    fn test_store_round_trip_and_recent_titles() {
        let dir = TempDir::new().unwrap();
        let mut store = ContentStore::open(dir.path()).unwrap();
        assert!(store.items().is_empty());

        let mut old = item("old", ContentKind::Poem);
        old.created_at = Utc::now() - chrono::Duration::days(1);
        store.push(old);
        store.push(item("new", ContentKind::Poem));
        store.push(item("story", ContentKind::Story));
        store.save().unwrap();

        let store = ContentStore::open(dir.path()).unwrap();
        assert_eq!(store.items().len(), 3);
        assert_eq!(
            store.recent_titles(ContentKind::Poem, "en", 5),
            vec!["Title new", "Title old"]
        );
        let ids = vec!["story".to_string(), "missing".to_string()];
        assert_eq!(store.select(&ids).count(), 1);
    }

    #[test]
    fn test_verdict_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Verdict::Warn).unwrap(), "\"WARN\"");
        assert_eq!(serde_json::to_string(&ContentKind::Lullaby).unwrap(), "\"lullaby\"");
    }
}
