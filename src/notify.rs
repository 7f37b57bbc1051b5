use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::{CostConfig, NotifyConfig};
use crate::http;
use crate::state::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CostEstimate {
    pub synthesis_secs: f64,
    pub run_cost: f64,
    pub monthly_projection: f64,
}

impl CostEstimate {
    /// Synthesis time is billed per second; fixed infrastructure is spread
    /// over a 30-day month.
    pub fn from_synthesis(synthesis_secs: f64, config: &CostConfig) -> Self {
        let run_cost = synthesis_secs * config.synthesis_per_second + config.fixed_monthly / 30.0;
        Self {
            synthesis_secs,
            run_cost,
            monthly_projection: run_cost * 30.0,
        }
    }
}

/// Everything the single end-of-run notification reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub items: usize,
    pub titles: Vec<String>,
    pub variants: usize,
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    /// `title (voice): reason` for every FAIL variant.
    pub failures: Vec<String>,
    pub failed_stage: Option<(Stage, String)>,
    /// Set when the run aborted before or between stages.
    pub fatal: Option<String>,
    pub elapsed_secs: f64,
    pub cost: CostEstimate,
    pub audio_files: usize,
    pub audio_bytes: u64,
    pub log_tail: Vec<String>,
}

impl RunSummary {
    /// A run that stopped before any stage could start.
    pub fn aborted(error: String, dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            dry_run,
            fatal: Some(error),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none() && self.fatal.is_none()
    }

    pub fn subject(&self) -> String {
        let tag = if self.succeeded() { "[OK]" } else { "[FAIL]" };
        let dry = if self.dry_run { " (dry run)" } else { "" };
        format!(
            "{tag} Daily content {}: {} items{dry}",
            self.started_at.format("%Y-%m-%d"),
            self.items
        )
    }

    pub fn body(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {}", self.run_id);
        let _ = writeln!(out, "Items: {}", self.items);
        for title in &self.titles {
            let _ = writeln!(out, "  - {title}");
        }
        let _ = writeln!(
            out,
            "QA: {} variants, {} PASS, {} WARN, {} FAIL",
            self.variants, self.passed, self.warned, self.failed
        );
        for failure in &self.failures {
            let _ = writeln!(out, "  FAIL {failure}");
        }
        let _ = writeln!(out, "Elapsed: {:.0}s", self.elapsed_secs);
        let _ = writeln!(
            out,
            "Cost: ${:.2} this run, ${:.2}/month projected",
            self.cost.run_cost, self.cost.monthly_projection
        );
        let _ = writeln!(
            out,
            "Audio on disk: {} files, {:.1} MB",
            self.audio_files,
            self.audio_bytes as f64 / 1_048_576.0
        );
        if let Some((stage, error)) = &self.failed_stage {
            let _ = writeln!(out, "Failed stage: {stage}: {error}");
        }
        if let Some(fatal) = &self.fatal {
            let _ = writeln!(out, "Fatal: {fatal}");
        }
        if !self.succeeded() && !self.log_tail.is_empty() {
            let _ = writeln!(out, "\nLast log lines:");
            for line in &self.log_tail {
                let _ = writeln!(out, "{line}");
            }
        }
        out
    }
}

/// Last `n` lines of a log file; empty when it cannot be read.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Writes the notification to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        info!("{}\n{}", summary.subject(), summary.body());
        Ok(())
    }
}

/// Email through an HTTP email API.
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
    to: Vec<String>,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn new(config: &NotifyConfig, api_key: String) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout).context("notification client")?,
            endpoint: config.endpoint.clone(),
            api_key,
            from: config.from.clone(),
            to: config.to.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let body = json!({
            "from": self.from,
            "to": self.to,
            "subject": summary.subject(),
            "text": summary.body(),
        });
        let request = http::bearer(self.client.post(&self.endpoint).json(&body), Some(&self.api_key));
        http::send(request, self.timeout)
            .await
            .context("sending notification")?;
        info!("Notification sent to {}", self.to.join(", "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cost_estimate() {
        let cost = CostEstimate::from_synthesis(1000.0, &CostConfig::default());
        let expected = 1000.0 * 0.000221 + 16.13 / 30.0;
        assert!((cost.run_cost - expected).abs() < 1e-9);
        assert!((cost.monthly_projection - expected * 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_subject_and_failure_body() {
        let mut summary = RunSummary {
            run_id: "r1".into(),
            items: 2,
            failed: 1,
            failures: vec!["Moon Boat (female_2): synthesis failed".into()],
            log_tail: vec!["ERROR boom".into()],
            ..RunSummary::default()
        };
        assert!(summary.subject().starts_with("[OK]"));
        assert!(summary.body().contains("FAIL Moon Boat (female_2)"));
        assert!(!summary.body().contains("ERROR boom"));

        summary.failed_stage = Some((Stage::Audio, "provider down".into()));
        assert!(summary.subject().starts_with("[FAIL]"));
        let body = summary.body();
        assert!(body.contains("Failed stage: audio: provider down"));
        assert!(body.contains("ERROR boom"));
    }

    #[test]
    fn test_aborted_summary_reports_failure() {
        let summary = RunSummary::aborted("no voices configured".into(), false);
        assert!(!summary.succeeded());
        assert!(summary.subject().starts_with("[FAIL]"));
        assert!(summary.body().contains("Fatal: no voices configured"));
    }

    #[test]
    fn test_tail_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..30 {
            writeln!(file, "line {i}").unwrap();
        }
        let tail = tail_lines(file.path(), 20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "line 10");
        assert_eq!(tail[19], "line 29");
        assert!(tail_lines(Path::new("/nonexistent/log"), 5).is_empty());
    }
}
