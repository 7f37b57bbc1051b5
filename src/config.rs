use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration, read from `pipeline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub content_root: PathBuf,
    pub audio_dir: PathBuf,
    pub log_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub chunking: ChunkingConfig,
    pub assembly: AssemblyConfig,
    pub voices: BTreeMap<String, Vec<String>>,
    pub qa: QaConfig,
    pub enrich: HookConfig,
    pub covers: HookConfig,
    pub sync: SyncConfig,
    pub publish: PublishConfig,
    pub notify: NotifyConfig,
    pub cost: CostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    pub endpoint: String,
    pub health_endpoint: String,
    pub timeout_secs: u64,
    pub warmup_timeout_secs: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Chunk completions between two checkpoint flushes.
    pub flush_every: usize,
    pub exaggeration_range: (f32, f32),
    pub cfg_weight_range: (f32, f32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub min_chars: usize,
    pub padding: char,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssemblyConfig {
    pub paragraph_pause_ms: u32,
    pub crossfade_ms: u32,
    pub target_dbfs: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub fade_in_max_fraction: f32,
    pub fade_out_max_fraction: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QaConfig {
    pub fidelity_pass: f64,
    pub fidelity_fail: f64,
    pub duration_outlier_pct: f64,
    pub quality_scoring: bool,
    pub quality_floor: u8,
    pub quality_fail_below: u8,
    pub regenerate_failed: bool,
    pub max_regenerations: u32,
    pub transcription_endpoint: String,
    pub transcription_model: String,
    pub judge_endpoint: String,
    pub judge_model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

/// External command run once per item. `{id}` in any argument is replaced
/// with the item id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HookConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub target_dir: Option<PathBuf>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PublishConfig {
    pub targets: Vec<PublishTarget>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishTarget {
    pub name: String,
    pub repo_dir: PathBuf,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub from: String,
    pub to: Vec<String>,
    pub log_tail_lines: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostConfig {
    pub synthesis_per_second: f64,
    pub fixed_monthly: f64,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let mut voices = BTreeMap::new();
        voices.insert(
            "en".to_string(),
            [
                "female_1", "female_2", "female_3", "male_1", "male_2", "male_3", "asmr",
            ]
            .iter()
            .map(|v| v.to_string())
            .collect(),
        );
        voices.insert(
            "hi".to_string(),
            ["hi_female_1", "hi_female_2", "hi_male_1"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
        );
        Self {
            content_root: PathBuf::from("seed_output"),
            audio_dir: PathBuf::from("audio/pre-gen"),
            log_dir: PathBuf::from("logs"),
            scratch_dir: PathBuf::from(".synth-scratch"),
            generation: GenerationConfig::default(),
            synthesis: SynthesisConfig::default(),
            chunking: ChunkingConfig::default(),
            assembly: AssemblyConfig::default(),
            voices,
            qa: QaConfig::default(),
            enrich: HookConfig::default(),
            covers: HookConfig::default(),
            sync: SyncConfig::default(),
            publish: PublishConfig::default(),
            notify: NotifyConfig::default(),
            cost: CostConfig::default(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.mistral.ai/v1/chat/completions".to_string(),
            model: "mistral-large-latest".to_string(),
            api_key_env: "MISTRAL_API_KEY".to_string(),
            timeout_secs: 120,
            max_attempts: 4,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            themes: [
                "animals", "ocean", "space", "forest", "friendship", "seasons", "dreams",
                "music",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/tts".to_string(),
            health_endpoint: "http://localhost:8000/health".to_string(),
            timeout_secs: 180,
            warmup_timeout_secs: 300,
            concurrency: 3,
            max_attempts: 4,
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            flush_every: 4,
            exaggeration_range: (0.0, 1.0),
            cfg_weight_range: (0.1, 1.0),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 600,
            min_chars: 12,
            padding: '.',
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            paragraph_pause_ms: 1000,
            crossfade_ms: 40,
            target_dbfs: -16.0,
            fade_in_ms: 500,
            fade_out_ms: 1500,
            fade_in_max_fraction: 0.25,
            fade_out_max_fraction: 1.0 / 3.0,
        }
    }
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            fidelity_pass: 0.70,
            fidelity_fail: 0.49,
            duration_outlier_pct: 0.15,
            quality_scoring: false,
            quality_floor: 5,
            quality_fail_below: 4,
            regenerate_failed: true,
            max_regenerations: 1,
            transcription_endpoint: "https://api.mistral.ai/v1/audio/transcriptions".to_string(),
            transcription_model: "voxtral-mini-latest".to_string(),
            judge_endpoint: "https://api.mistral.ai/v1/chat/completions".to_string(),
            judge_model: "voxtral-small-latest".to_string(),
            api_key_env: "MISTRAL_API_KEY".to_string(),
            timeout_secs: 120,
            max_attempts: 8,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.resend.com/emails".to_string(),
            api_key_env: "RESEND_API_KEY".to_string(),
            from: "pipeline@localhost".to_string(),
            to: Vec::new(),
            log_tail_lines: 20,
            timeout_secs: 30,
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            synthesis_per_second: 0.000221,
            fixed_monthly: 16.13,
        }
    }
}

impl SynthesisConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing fields use defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Like [`Config::load`] but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PIPELINE_CONTENT_ROOT → content_root
    /// - PIPELINE_SYNTH_CONCURRENCY → synthesis.concurrency
    /// - PIPELINE_SYNTH_ENDPOINT → synthesis.endpoint
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var("PIPELINE_CONTENT_ROOT")
            && !root.is_empty()
        {
            self.content_root = PathBuf::from(root);
        }

        if let Ok(value) = std::env::var("PIPELINE_SYNTH_CONCURRENCY")
            && let Ok(n) = value.parse::<usize>()
        {
            self.synthesis.concurrency = n;
        }

        if let Ok(endpoint) = std::env::var("PIPELINE_SYNTH_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.synthesis.endpoint = endpoint;
        }

        self
    }

    /// Rebase relative paths onto `root` so a run can be pointed at any
    /// working directory.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        for path in [
            &mut self.content_root,
            &mut self.audio_dir,
            &mut self.log_dir,
            &mut self.scratch_dir,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
        self
    }

    pub fn voices_for(&self, language: &str) -> &[String] {
        self.voices.get(language).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn validate(&self, language: &str) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: String| ConfigError::Invalid {
            field: field.to_string(),
            message,
        };
        if self.chunking.min_chars >= self.chunking.max_chars {
            return Err(invalid(
                "chunking.min_chars",
                format!(
                    "must be below max_chars ({} >= {})",
                    self.chunking.min_chars, self.chunking.max_chars
                ),
            ));
        }
        let qa = &self.qa;
        if !(qa.fidelity_fail > 0.0 && qa.fidelity_fail <= qa.fidelity_pass && qa.fidelity_pass <= 1.0)
        {
            return Err(invalid(
                "qa.fidelity_pass",
                format!(
                    "need 0 < fidelity_fail ({}) <= fidelity_pass ({}) <= 1",
                    qa.fidelity_fail, qa.fidelity_pass
                ),
            ));
        }
        if qa.duration_outlier_pct <= 0.0 {
            return Err(invalid(
                "qa.duration_outlier_pct",
                "must be positive".to_string(),
            ));
        }
        if self.synthesis.concurrency == 0 {
            return Err(invalid("synthesis.concurrency", "must be at least 1".to_string()));
        }
        if self.synthesis.max_attempts == 0 || self.generation.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1".to_string()));
        }
        if self.synthesis.flush_every == 0 {
            return Err(invalid("synthesis.flush_every", "must be at least 1".to_string()));
        }
        if self.voices_for(language).is_empty() {
            return Err(invalid(
                "voices",
                format!("no voices configured for language '{language}'"),
            ));
        }
        Ok(())
    }
}
