use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::QaConfig;
use crate::error::{ProviderError, StateError};
use crate::fidelity;
use crate::model::{AudioVariant, ContentItem, QaVerdict, Verdict};
use crate::retry::{RetryPolicy, with_retry};
use crate::state::write_json_atomic;
use crate::stt::{QualityJudge, QualityScores, Transcriber};

pub const REPORT_FILE: &str = "qa_report.json";
const SNIPPET_CHARS: usize = 300;

/// Map a combined fidelity score onto a verdict. Scores at or above the pass
/// threshold pass, scores below the fail threshold fail, the band between
/// warns.
pub fn verdict_for_fidelity(score: f64, config: &QaConfig) -> Verdict {
    if score >= config.fidelity_pass {
        Verdict::Pass
    } else if score < config.fidelity_fail {
        Verdict::Fail
    } else {
        Verdict::Warn
    }
}

/// Relative deviation of each rendered variant's duration from the median of
/// its siblings. Empty when fewer than two variants have audio.
pub fn duration_deviations(variants: &BTreeMap<String, AudioVariant>) -> BTreeMap<String, f64> {
    let rendered: Vec<(&String, f64)> = variants
        .iter()
        .filter(|(_, v)| v.file.is_some() && v.duration_secs > 0.0)
        .map(|(voice, v)| (voice, v.duration_secs))
        .collect();
    if rendered.len() < 2 {
        return BTreeMap::new();
    }
    let mut durations: Vec<f64> = rendered.iter().map(|(_, d)| *d).collect();
    durations.sort_by(f64::total_cmp);
    let mid = durations.len() / 2;
    let median = if durations.len() % 2 == 0 {
        (durations[mid - 1] + durations[mid]) / 2.0
    } else {
        durations[mid]
    };
    rendered
        .into_iter()
        .map(|(voice, d)| (voice.clone(), (d - median).abs() / median))
        .collect()
}

/// Judge scores below the floor warn; a very low completeness or overall
/// score fails.
pub fn judge_verdict(scores: &QualityScores, config: &QaConfig) -> (Verdict, Option<String>) {
    if scores.completeness < config.quality_fail_below || scores.overall < config.quality_fail_below {
        return (
            Verdict::Fail,
            Some(format!(
                "judge completeness {} / overall {}",
                scores.completeness, scores.overall
            )),
        );
    }
    let low: Vec<String> = scores
        .dimensions()
        .iter()
        .filter(|(_, v)| *v < config.quality_floor)
        .map(|(name, v)| format!("{name} {v}"))
        .collect();
    if low.is_empty() {
        (Verdict::Pass, None)
    } else {
        (Verdict::Warn, Some(format!("judge low: {}", low.join(", "))))
    }
}

/// Verdict plus the transcript it was derived from.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub voice: String,
    pub verdict: QaVerdict,
    pub transcript: Option<String>,
}

pub struct QaEngine {
    transcriber: Arc<dyn Transcriber>,
    judge: Option<Arc<dyn QualityJudge>>,
    config: QaConfig,
    policy: RetryPolicy,
    timeout: Duration,
    retries: AtomicU32,
}

impl QaEngine {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        judge: Option<Arc<dyn QualityJudge>>,
        config: QaConfig,
    ) -> Self {
        Self {
            transcriber,
            judge,
            policy: RetryPolicy::new(config.max_attempts, config.backoff_base_ms, config.backoff_max_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            config,
            retries: AtomicU32::new(0),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Score the listed voices of `item`. Duration deviation is measured
    /// against all of the item's variants, not just the listed ones.
    pub async fn score_voices(
        &self,
        item: &ContentItem,
        voices: &[String],
        now: DateTime<Utc>,
    ) -> Vec<Assessment> {
        let deviations = duration_deviations(&item.audio_variants);
        let mut out = Vec::with_capacity(voices.len());
        for voice in voices {
            let Some(variant) = item.audio_variants.get(voice) else {
                continue;
            };
            let assessment = self
                .score_variant(item, variant, deviations.get(voice).copied(), now)
                .await;
            info!(
                item = %item.id,
                voice = %voice,
                "QA {}: {} ({})",
                item.id,
                assessment.verdict.verdict,
                assessment.verdict.reason
            );
            out.push(assessment);
        }
        out
    }

    pub async fn score_variant(
        &self,
        item: &ContentItem,
        variant: &AudioVariant,
        deviation: Option<f64>,
        now: DateTime<Utc>,
    ) -> Assessment {
        let fail = |reason: String| Assessment {
            voice: variant.voice.clone(),
            verdict: QaVerdict {
                verdict: Verdict::Fail,
                reason,
                fidelity: 0.0,
                duration_deviation: deviation,
                quality_overall: None,
                scored_at: now,
            },
            transcript: None,
        };

        let file = match (&variant.file, &variant.synthesis_error) {
            (Some(file), None) => file,
            (_, Some(err)) => return fail(format!("synthesis failed: {err}")),
            (None, None) => return fail("synthesis failed: no audio".to_string()),
        };

        let transcript = match self.transcribe(file, &item.language, &item.id).await {
            Ok(t) => t,
            Err(e) => return fail(format!("transcription failed: {e}")),
        };

        let score = fidelity::score(&item.text, &transcript);
        debug!(
            item = %item.id,
            voice = %variant.voice,
            coverage = score.coverage,
            order = score.order,
            "Fidelity {:.3}",
            score.combined
        );
        let mut verdict = verdict_for_fidelity(score.combined, &self.config);
        let mut reasons = vec![format!("fidelity {:.2}", score.combined)];

        if let Some(dev) = deviation
            && dev > self.config.duration_outlier_pct
        {
            verdict = verdict.worst(Verdict::Warn);
            reasons.push(format!("duration {:.0}% from median", dev * 100.0));
        }

        let mut quality_overall = None;
        if self.config.quality_scoring
            && let Some(judge) = &self.judge
        {
            match self.judge(judge.as_ref(), file, item).await {
                Ok(scores) => {
                    quality_overall = Some(scores.overall);
                    let (judged, reason) = judge_verdict(&scores, &self.config);
                    verdict = verdict.worst(judged);
                    reasons.extend(reason);
                }
                Err(e) => warn!(item = %item.id, voice = %variant.voice, "Quality judge failed: {}", e),
            }
        }

        Assessment {
            voice: variant.voice.clone(),
            verdict: QaVerdict {
                verdict,
                reason: reasons.join("; "),
                fidelity: score.combined,
                duration_deviation: deviation,
                quality_overall,
                scored_at: now,
            },
            transcript: Some(transcript),
        }
    }

    async fn judge(
        &self,
        judge: &dyn QualityJudge,
        file: &Path,
        item: &ContentItem,
    ) -> Result<QualityScores, ProviderError> {
        let label = format!("judge {}", item.id);
        with_retry(&label, &self.policy, self.timeout, &self.retries, |_| {
            judge.judge(file, &item.text, &item.language)
        })
        .await
    }

    async fn transcribe(&self, file: &Path, language: &str, item_id: &str) -> Result<String, ProviderError> {
        let label = format!("transcribe {item_id}");
        let transcriber = &self.transcriber;
        with_retry(&label, &self.policy, self.timeout, &self.retries, |_| {
            transcriber.transcribe(file, language)
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaSummary {
    pub total: usize,
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    pub avg_fidelity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaEntry {
    pub item_id: String,
    pub title: String,
    pub voice: String,
    pub verdict: Verdict,
    pub fidelity: f64,
    pub duration_secs: f64,
    pub deviation: Option<f64>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub summary: QaSummary,
    pub entries: Vec<QaEntry>,
}

impl QaEntry {
    /// Entry for a scored variant. Only non-passing entries keep a transcript
    /// excerpt.
    pub fn new(item: &ContentItem, variant: &AudioVariant, transcript: Option<&str>) -> Option<Self> {
        let qa = variant.qa.as_ref()?;
        let transcript_snippet = match qa.verdict {
            Verdict::Pass => None,
            _ => transcript.map(|t| t.chars().take(SNIPPET_CHARS).collect()),
        };
        Some(Self {
            item_id: item.id.clone(),
            title: item.title.clone(),
            voice: variant.voice.clone(),
            verdict: qa.verdict,
            fidelity: qa.fidelity,
            duration_secs: variant.duration_secs,
            deviation: qa.duration_deviation,
            reason: qa.reason.clone(),
            transcript_snippet,
        })
    }
}

impl QaReport {
    pub fn new(run_id: &str, entries: Vec<QaEntry>, now: DateTime<Utc>) -> Self {
        let count = |v: Verdict| entries.iter().filter(|e| e.verdict == v).count();
        let avg_fidelity = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|e| e.fidelity).sum::<f64>() / entries.len() as f64
        };
        Self {
            generated_at: now,
            run_id: run_id.to_string(),
            summary: QaSummary {
                total: entries.len(),
                passed: count(Verdict::Pass),
                warned: count(Verdict::Warn),
                failed: count(Verdict::Fail),
                avg_fidelity,
            },
            entries,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &QaEntry> {
        self.entries.iter().filter(|e| e.verdict == Verdict::Fail)
    }

    pub fn write(&self, content_root: &Path) -> Result<(), StateError> {
        write_json_atomic(&content_root.join(REPORT_FILE), self)
    }
}
