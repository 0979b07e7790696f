use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Args;
use synthloop::flags::read_flags;
use synthloop::metadata::DEFAULT_METADATA_FILE;
use synthloop::toolbox::compose_pr_title;
use synthloop::{
    ChangePusher, LoggingChangePusher, LoopOutcome, Metadata, Preconfig, ProcessSynthesizer,
    SquashingChangePusher, Synthesizer, Toolbox, ToolboxSettings, VersionControl,
    synthesize_loop,
};
use synthloop_git::GitWorkspace;
use synthloop_github::{GitHub, GitHubChangePusher};
use tracing::info;

use crate::Status;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Checkout of the repository to regenerate
    #[arg(long, env = "REPO_DIR", default_value = ".")]
    repo_dir: PathBuf,

    /// GitHub repository, as `owner/repo`
    #[arg(long, env = "REPOSITORY")]
    repository: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "GITHUB_USER")]
    github_user: Option<String>,

    #[arg(long, env = "GITHUB_EMAIL")]
    github_email: Option<String>,

    /// Directory of the generator config within a monorepo
    #[arg(long, env = "SYNTH_PATH", default_value = "")]
    synth_path: String,

    /// Generator config script, relative to the synth path
    #[arg(long, env = "SYNTH_FILE_NAME", default_value = "synth.py")]
    synth_file_name: PathBuf,

    /// Directory holding synth.metadata, relative to the synth path
    #[arg(long, env = "METADATA_PATH")]
    metadata_path: Option<PathBuf>,

    /// Root directory for generator logs [default: ./logs]
    #[arg(long)]
    base_log_dir: Option<PathBuf>,

    /// Appended to the `autosynth` branch name
    #[arg(long, env = "BRANCH_SUFFIX")]
    branch_suffix: Option<String>,

    /// Title for the pull request in simple mode
    #[arg(long, default_value = "")]
    pr_title: String,

    /// Branch pull requests are opened against
    #[arg(long, default_value = "master")]
    base_branch: String,

    /// Generator command, split on whitespace
    #[arg(long, env = "SYNTHLOOP_GENERATOR", default_value = "python3 -m synthtool")]
    generator: String,

    /// Log instead of pushing branches and opening pull requests
    #[arg(long)]
    no_push: bool,

    /// Passed to the generator after `--`
    #[arg(last = true)]
    extra_args: Vec<String>,
}

impl RunArgs {
    fn branch(&self) -> String {
        match self.branch_suffix.as_deref() {
            Some(suffix) if !suffix.is_empty() => format!("autosynth-{}", suffix),
            _ => "autosynth".to_string(),
        }
    }

    fn simple_pr_title(&self) -> String {
        if !self.pr_title.is_empty() {
            return self.pr_title.clone();
        }
        compose_pr_title(0, 0, &self.synth_path, None, "")
    }

    /// Logs go under `<base>/<last component of synth path or repository>`.
    fn log_dir(&self, repo_root: &Path) -> Result<PathBuf> {
        let base = match &self.base_log_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join("logs"),
        };
        let name = [self.synth_path.as_str(), self.repository.as_deref().unwrap_or("")]
            .into_iter()
            .find(|s| !s.is_empty())
            .and_then(|s| Path::new(s).file_name().map(|n| n.to_os_string()))
            .or_else(|| repo_root.file_name().map(|n| n.to_os_string()))
            .unwrap_or_default();
        Ok(base.join(name))
    }
}

pub fn run(args: RunArgs) -> Result<Status> {
    let ws = GitWorkspace::open(&args.repo_dir)?;
    let repo_root = ws.workdir()?.to_path_buf();
    if let (Some(user), Some(email)) = (&args.github_user, &args.github_email) {
        ws.configure_identity(user, email)?;
    }

    let branch = args.branch();
    ws.setup_branch(&branch)?;

    let work_dir = repo_root.join(&args.synth_path);
    let metadata_rel = args
        .metadata_path
        .clone()
        .unwrap_or_default()
        .join(DEFAULT_METADATA_FILE);
    let flags = read_flags(&work_dir.join(&args.synth_file_name))
        .with_context(|| format!("Failed to read {:?}", args.synth_file_name))?
        .with_overrides(|name| std::env::var(name).ok());
    let metadata = Metadata::load(&work_dir.join(&metadata_rel))?;

    let pusher = change_pusher(&args, &ws)?;
    let log_dir = args.log_dir(&repo_root)?;
    info!(log_dir = %log_dir.display(), "logs will be written here");

    let temp_dir = tempfile::tempdir()?;
    let command: Vec<String> = args.generator.split_whitespace().map(str::to_string).collect();
    if command.is_empty() {
        return Err(anyhow!("Generator command is empty"));
    }
    let synthesizer = ProcessSynthesizer::new(
        command,
        &metadata_rel,
        &args.synth_file_name,
        &work_dir,
        temp_dir.path().join("preconfig.json"),
    )
    .with_extra_args(args.extra_args.clone());

    // The metadata path as seen from the repository root.
    let settings = ToolboxSettings::new(Path::new(&args.synth_path).join(&metadata_rel), &args.synth_path)?;

    let metadata = match metadata {
        Some(metadata) if flags.wants_loop() => metadata,
        _ => {
            let title = args.simple_pr_title();
            let mut log_path = log_dir;
            for arg in &args.extra_args {
                log_path.push(arg);
            }
            return run_simple(&ws, &*pusher, &synthesizer, &settings, &branch, &title, &log_path);
        }
    };

    if !flags.multiple_prs && pusher.pr_exists(&branch)? {
        info!(branch = %branch, "pull request already exists");
        return Ok(Status::Success);
    }

    let mut source_versions =
        vec![synthloop_git::enumerate_versions_for_working_repo(&work_dir.join(&metadata_rel))?];
    source_versions.extend(synthloop_git::enumerate_versions(
        &metadata,
        &temp_dir.path().join("sources"),
    )?);
    info!(
        sources = source_versions.len(),
        versions = source_versions.iter().map(Vec::len).sum::<usize>(),
        "enumerated source versions"
    );

    let mut toolbox = Toolbox::new(&ws, source_versions, branch, settings, log_dir);
    let outcome = if flags.multiple_commits {
        synthesize_loop(&mut toolbox, flags.multiple_prs, &pusher, &synthesizer)?
    } else {
        let squashing = SquashingChangePusher::new(pusher, &ws);
        synthesize_loop(&mut toolbox, flags.multiple_prs, &squashing, &synthesizer)?
    };

    match outcome {
        LoopOutcome::Skipped => {
            info!("no changes");
            Ok(Status::Skipped)
        }
        LoopOutcome::Committed(count) => {
            info!(commits = count, "done");
            Ok(Status::Success)
        }
    }
}

/// Run the generator once and commit everything it changed.
fn run_simple(
    ws: &GitWorkspace,
    pusher: &dyn ChangePusher,
    synthesizer: &dyn Synthesizer,
    settings: &ToolboxSettings,
    branch: &str,
    pr_title: &str,
    log_dir: &Path,
) -> Result<Status> {
    if pusher.pr_exists(branch)? {
        info!(branch, "pull request already exists");
        return Ok(Status::Success);
    }

    let synth_log = synthesizer.synthesize(&log_dir.join("sponge_log.log"), &Preconfig::new())?;
    if !ws.has_uncommitted_changes(&settings.ignored)? {
        info!("no changes");
        return Ok(Status::Skipped);
    }
    ws.commit_all(pr_title)?;
    pusher.push_changes(1, branch, pr_title, &synth_log)?;
    Ok(Status::Success)
}

fn change_pusher<'a>(args: &RunArgs, ws: &'a GitWorkspace) -> Result<Box<dyn ChangePusher + 'a>> {
    if args.no_push {
        return Ok(Box::new(LoggingChangePusher));
    }
    let repository = args
        .repository
        .clone()
        .ok_or_else(|| anyhow!("--repository (or REPOSITORY) is required unless --no-push is set"))?;
    let token = args
        .github_token
        .clone()
        .ok_or_else(|| anyhow!("--github-token (or GITHUB_TOKEN) is required unless --no-push is set"))?;
    let pusher = GitHubChangePusher::new(GitHub::new(token)?, repository, ws, move |branch| {
        ws.push_branch(branch)
    })
    .with_base(&args.base_branch)
    .with_synth_path(&args.synth_path);
    Ok(Box::new(pusher))
}
