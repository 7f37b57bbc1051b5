use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bedtime_pipeline::args::{Args, Command, RunArgs};
use bedtime_pipeline::config::{Config, HookConfig};
use bedtime_pipeline::hooks::{CommandHook, GitPublisher, ItemHook};
use bedtime_pipeline::http;
use bedtime_pipeline::llm::HttpTextGenerator;
use bedtime_pipeline::notify::{HttpNotifier, LogNotifier, Notifier, RunSummary};
use bedtime_pipeline::orchestrator::Orchestrator;
use bedtime_pipeline::stages::Providers;
use bedtime_pipeline::state::CheckpointStore;
use bedtime_pipeline::stt::{HttpJudge, HttpTranscriber, QualityJudge};
use bedtime_pipeline::tts::HttpSynthesizer;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

async fn dispatch(args: Args) -> anyhow::Result<i32> {
    let mut config = Config::load_or_default(&args.config)?.with_env_overrides();
    if let Some(root) = &args.content_root {
        config.content_root = root.clone();
    }
    match args.command {
        Command::Status => status(&config),
        Command::Run(run_args) => Ok(run(config, run_args).await),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stdout plus a per-run log file; returns the file's path.
fn init_logging(config: &Config) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("cannot create {}", config.log_dir.display()))?;
    let path = config
        .log_dir
        .join(format!("pipeline_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    let file = File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(path)
}

fn init_console_logging() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: Config, run_args: RunArgs) -> i32 {
    let (log_file, logging_error) = match init_logging(&config) {
        Ok(path) => (Some(path), None),
        Err(e) => {
            init_console_logging();
            (None, Some(e))
        }
    };
    let notifier = build_notifier(&config, run_args.dry_run);
    if let Some(e) = logging_error {
        return abort(notifier.as_ref(), e.context("cannot open the run log"), run_args.dry_run).await;
    }
    if let Some(path) = &log_file {
        info!("Starting bedtime content pipeline (log: {})", path.display());
    }
    launch(config, &run_args, notifier, log_file, build_providers).await
}

/// Validate, wire providers and run. Anything that stops the run before the
/// orchestrator starts is still reported through `notifier`.
async fn launch<F>(
    config: Config,
    run_args: &RunArgs,
    notifier: Arc<dyn Notifier>,
    log_file: Option<PathBuf>,
    build: F,
) -> i32
where
    F: FnOnce(&Config) -> anyhow::Result<Providers>,
{
    let request = run_args.request();
    let flags = run_args.flags();
    let prepared = config
        .validate(&request.language)
        .map_err(anyhow::Error::from)
        .and_then(|()| build(&config));
    let providers = match prepared {
        Ok(providers) => providers,
        Err(e) => return abort(notifier.as_ref(), e, flags.dry_run).await,
    };

    let mut orchestrator = Orchestrator::new(config, providers, notifier);
    if let Some(path) = log_file {
        orchestrator = orchestrator.with_log_file(path);
    }
    let result = orchestrator.run(request, flags, run_args.step()).await;

    let code = result.exit_code();
    info!("Run {} finished with exit code {}", result.run_id, code);
    code
}

async fn abort(notifier: &dyn Notifier, error: anyhow::Error, dry_run: bool) -> i32 {
    error!("Run aborted: {:#}", error);
    let summary = RunSummary::aborted(format!("{error:#}"), dry_run);
    if let Err(e) = notifier.notify(&summary).await {
        error!("Notification failed: {:#}", e);
    }
    2
}

fn build_providers(config: &Config) -> anyhow::Result<Providers> {
    let generation_key = http::api_key(&config.generation.api_key_env);
    let qa_key = http::api_key(&config.qa.api_key_env);

    let judge: Option<Arc<dyn QualityJudge>> = if config.qa.quality_scoring {
        Some(Arc::new(HttpJudge::new(&config.qa, qa_key.clone())?))
    } else {
        None
    };
    let hook = |c: &HookConfig| CommandHook::from_config(c).map(|h| Arc::new(h) as Arc<dyn ItemHook>);

    Ok(Providers {
        generator: Arc::new(HttpTextGenerator::new(&config.generation, generation_key)?),
        synthesizer: Arc::new(HttpSynthesizer::new(&config.synthesis, None)?),
        transcriber: Arc::new(HttpTranscriber::new(&config.qa, qa_key)?),
        judge,
        enricher: hook(&config.enrich),
        cover_artist: hook(&config.covers),
        publisher: Arc::new(GitPublisher::new(Duration::from_secs(config.publish.timeout_secs))),
    })
}

/// The configured email notifier, or the log when it is not set up.
fn build_notifier(config: &Config, dry_run: bool) -> Arc<dyn Notifier> {
    if dry_run {
        return Arc::new(LogNotifier);
    }
    match http::api_key(&config.notify.api_key_env) {
        Some(_) if config.notify.to.is_empty() => {
            warn!("No notification recipients configured; summary goes to the log");
            Arc::new(LogNotifier)
        }
        Some(key) => match HttpNotifier::new(&config.notify, key) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!("Email notifier unavailable ({:#}); summary goes to the log", e);
                Arc::new(LogNotifier)
            }
        },
        None => {
            warn!("{} not set; summary goes to the log", config.notify.api_key_env);
            Arc::new(LogNotifier)
        }
    }
}

fn status(config: &Config) -> anyhow::Result<i32> {
    let store = CheckpointStore::new(&config.content_root);
    match store.load()? {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(0)
        }
        None => {
            println!("No checkpoint at {}", store.path().display());
            Ok(0)
        }
    }
}
