//! External collaborators reached through subprocesses: enrichment and cover
//! hooks, the sync step, and git publishing.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{HookConfig, PublishTarget};
use crate::model::{CONTENT_FILE, ContentItem};

/// Run `argv` and return its stdout. Non-zero exit, spawn failure and
/// timeout are errors.
pub async fn run_command(argv: &[String], cwd: Option<&Path>, timeout: Duration) -> anyhow::Result<String> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    debug!("Running {} {:?}", program, args);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("failed to wait for {program}"))?,
        Err(_) => bail!("{program} timed out after {timeout:?}"),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} returned {}: {}",
            output.status,
            stderr.trim().chars().take(300).collect::<String>()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Per-item external step (music parameters, cover art). Returns the hook's stdout.
#[async_trait]
pub trait ItemHook: Send + Sync {
    async fn run(&self, item: &ContentItem) -> anyhow::Result<String>;
}

/// Hook backed by a configured command line; `{id}`, `{kind}` and
/// `{language}` in arguments are substituted per item.
pub struct CommandHook {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandHook {
    /// `None` when no command is configured.
    pub fn from_config(config: &HookConfig) -> Option<Self> {
        if config.command.is_empty() {
            return None;
        }
        Some(Self {
            argv: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    fn argv_for(&self, item: &ContentItem) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| {
                a.replace("{id}", &item.id)
                    .replace("{kind}", item.kind.name())
                    .replace("{language}", &item.language)
            })
            .collect()
    }
}

#[async_trait]
impl ItemHook for CommandHook {
    async fn run(&self, item: &ContentItem) -> anyhow::Result<String> {
        run_command(&self.argv_for(item), None, self.timeout).await
    }
}

/// Commits and pushes published files to one target.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, target: &PublishTarget, message: &str) -> anyhow::Result<()>;
}

pub struct GitPublisher {
    timeout: Duration,
}

impl GitPublisher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> anyhow::Result<String> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_command(&argv, Some(repo), self.timeout).await
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, target: &PublishTarget, message: &str) -> anyhow::Result<()> {
        let repo = &target.repo_dir;
        if target.paths.is_empty() {
            self.git(repo, &["add", "-A"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend(target.paths.iter().map(String::as_str));
            self.git(repo, &args).await?;
        }
        // exit status 0 means nothing is staged
        if self.git(repo, &["diff", "--cached", "--quiet"]).await.is_ok() {
            info!("Nothing to publish for {}", target.name);
            return Ok(());
        }
        self.git(repo, &["commit", "-m", message]).await?;
        self.git(repo, &["push", &target.remote, &target.branch]).await?;
        info!("Published to {} ({}/{})", target.name, target.remote, target.branch);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub copied: usize,
    pub unchanged: usize,
}

fn is_newer(src: &Path, dst: &Path) -> std::io::Result<bool> {
    let Ok(dst_meta) = fs::metadata(dst) else {
        return Ok(true);
    };
    let src_meta = fs::metadata(src)?;
    Ok(src_meta.modified()? > dst_meta.modified()? || src_meta.len() != dst_meta.len())
}

/// Copy the usable audio of `items` into `target_dir/audio` when newer than
/// the copy already there, then snapshot `content.json` next to it.
pub fn sync_items(items: &[&ContentItem], content_file: &Path, target_dir: &Path) -> anyhow::Result<SyncCounts> {
    let audio_dir = target_dir.join("audio");
    fs::create_dir_all(&audio_dir).with_context(|| format!("cannot create {}", audio_dir.display()))?;

    let mut counts = SyncCounts::default();
    for item in items {
        for variant in item.usable_variants() {
            let Some(src) = &variant.file else {
                continue;
            };
            let Some(name) = src.file_name() else {
                continue;
            };
            let dst: PathBuf = audio_dir.join(name);
            if is_newer(src, &dst).with_context(|| format!("cannot stat {}", src.display()))? {
                fs::copy(src, &dst).with_context(|| format!("cannot copy {}", src.display()))?;
                counts.copied += 1;
            } else {
                counts.unchanged += 1;
            }
        }
    }

    if content_file.exists() {
        fs::copy(content_file, target_dir.join(CONTENT_FILE))
            .with_context(|| format!("cannot snapshot {}", content_file.display()))?;
    } else {
        warn!("No {} to snapshot", content_file.display());
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::item;
    use crate::model::{AudioVariant, ContentKind, QaVerdict, Verdict};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = run_command(&sh("echo hello"), None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_reports_failure_and_timeout() {
        let err = run_command(&sh("echo oops >&2; exit 3"), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));

        let err = run_command(&sh("sleep 5"), None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        assert!(run_command(&[], None, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_command_hook_substitutes_item_fields() {
        let hook = CommandHook::from_config(&HookConfig {
            command: sh("echo {id}-{kind}"),
            timeout_secs: 5,
        })
        .unwrap();
        let out = hook.run(&item("abc", ContentKind::Poem)).await.unwrap();
        assert_eq!(out.trim(), "abc-poem");
        assert!(CommandHook::from_config(&HookConfig::default()).is_none());
    }

    #[test]
    fn test_sync_copies_only_usable_and_newer() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let content = src.path().join(CONTENT_FILE);
        fs::write(&content, "[]").unwrap();

        let now = Utc::now();
        let mut it = item("s", ContentKind::Story);
        for (voice, verdict) in [("good", Verdict::Pass), ("bad", Verdict::Fail)] {
            let file = src.path().join(format!("s_{voice}.wav"));
            fs::write(&file, voice).unwrap();
            let mut v = AudioVariant::failed(voice, String::new(), now);
            v.synthesis_error = None;
            v.file = Some(file);
            v.qa = Some(QaVerdict {
                verdict,
                reason: String::new(),
                fidelity: 0.9,
                duration_deviation: None,
                quality_overall: None,
                scored_at: now,
            });
            it.put_variant(v, now);
        }

        let counts = sync_items(&[&it], &content, dst.path()).unwrap();
        assert_eq!(counts, SyncCounts { copied: 1, unchanged: 0 });
        assert!(dst.path().join("audio/s_good.wav").exists());
        assert!(!dst.path().join("audio/s_bad.wav").exists());
        assert!(dst.path().join(CONTENT_FILE).exists());

        let again = sync_items(&[&it], &content, dst.path()).unwrap();
        assert_eq!(again, SyncCounts { copied: 0, unchanged: 1 });
    }
}
