use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::model::{ContentKind, RunFlags, RunRequest};
use crate::state::Stage;

#[derive(Parser, Debug)]
#[clap(name = "bedtime-pipeline", about = "Daily narrated bedtime content pipeline")]
pub struct Args {
    #[clap(long, global = true, default_value = "pipeline.toml")]
    pub config: PathBuf,

    /// Overrides `content_root` from the config file.
    #[clap(long, global = true)]
    pub content_root: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline, or a single stage with --step.
    Run(RunArgs),
    /// Print the current checkpoint.
    Status,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[clap(long)]
    pub dry_run: bool,

    #[clap(long)]
    pub resume: bool,

    #[clap(long)]
    pub skip_publish: bool,

    #[clap(long, default_value_t = 1)]
    pub count_stories: u32,

    #[clap(long, default_value_t = 1)]
    pub count_poems: u32,

    #[clap(long, default_value_t = 0)]
    pub count_lullabies: u32,

    #[clap(long, default_value = "en")]
    pub lang: String,

    #[clap(long, value_enum)]
    pub step: Option<StepArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StepArg {
    Generate,
    Audio,
    Qa,
    Enrich,
    Covers,
    Sync,
    Publish,
}

impl From<StepArg> for Stage {
    fn from(step: StepArg) -> Self {
        match step {
            StepArg::Generate => Stage::Generate,
            StepArg::Audio => Stage::Audio,
            StepArg::Qa => Stage::Qa,
            StepArg::Enrich => Stage::Enrich,
            StepArg::Covers => Stage::Covers,
            StepArg::Sync => Stage::Sync,
            StepArg::Publish => Stage::Publish,
        }
    }
}

impl RunArgs {
    pub fn request(&self) -> RunRequest {
        let mut request = RunRequest {
            language: self.lang.clone(),
            ..RunRequest::default()
        };
        for (kind, count) in [
            (ContentKind::Story, self.count_stories),
            (ContentKind::Poem, self.count_poems),
            (ContentKind::Lullaby, self.count_lullabies),
        ] {
            if count > 0 {
                request.counts.insert(kind, count);
            }
        }
        request
    }

    pub fn flags(&self) -> RunFlags {
        RunFlags {
            dry_run: self.dry_run,
            resume: self.resume,
            skip_publish: self.skip_publish,
        }
    }

    pub fn step(&self) -> Option<Stage> {
        self.step.map(Stage::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let args = Args::parse_from(["bedtime-pipeline", "run"]);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        let request = run.request();
        assert_eq!(request.count(ContentKind::Story), 1);
        assert_eq!(request.count(ContentKind::Poem), 1);
        assert_eq!(request.count(ContentKind::Lullaby), 0);
        assert_eq!(request.language, "en");
        assert_eq!(run.flags(), RunFlags::default());
        assert_eq!(run.step(), None);
    }

    #[test]
    fn test_step_and_flags() {
        let args = Args::parse_from([
            "bedtime-pipeline",
            "run",
            "--step",
            "qa",
            "--resume",
            "--skip-publish",
            "--lang",
            "hi",
            "--content-root",
            "/tmp/x",
        ]);
        assert_eq!(args.content_root, Some(PathBuf::from("/tmp/x")));
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.step(), Some(Stage::Qa));
        assert!(run.flags().resume && run.flags().skip_publish);
        assert_eq!(run.request().language, "hi");
    }

    #[test]
    fn test_unknown_step_rejected() {
        assert!(Args::try_parse_from(["bedtime-pipeline", "run", "--step", "notify"]).is_err());
    }
}
