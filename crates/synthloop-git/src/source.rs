//! Source versions backed by commits in git repositories.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, Utc};
use git2::build::CheckoutBuilder;
use git2::{Oid, Repository, Sort};
use synthloop::metadata::Metadata;
use synthloop::{Error, Preconfig, SourceVersion};
use tracing::{debug, info};

const PRECLONED_REPOS: &str = "preclonedRepos";

/// Name of the source standing for the repository being regenerated.
pub const SELF_SOURCE: &str = "self";

/// One commit of a source repository.
///
/// Timestamp and comment are read when the version is created, so they stay
/// valid while other versions move the clone's HEAD around.
#[derive(Debug, Clone)]
pub struct GitSourceVersion {
    repo_path: PathBuf,
    sha: String,
    remote: String,
    source_description: String,
    source_name: String,
    timestamp: DateTime<Utc>,
    comment: String,
}

impl GitSourceVersion {
    pub fn load(
        repo: &Repository,
        sha: &str,
        remote: &str,
        source_description: &str,
        source_name: &str,
    ) -> Result<Self> {
        let repo_path = repo
            .workdir()
            .ok_or_else(|| anyhow!("Source repository has no working tree"))?
            .to_path_buf();
        let oid = Oid::from_str(sha).with_context(|| format!("Invalid sha '{}'", sha))?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Commit {} not found in {}", sha, remote))?;

        let timestamp = DateTime::from_timestamp(commit.time().seconds(), 0)
            .ok_or_else(|| anyhow!("Commit {} has an out of range timestamp", sha))?;

        let subject = strip_pr_number(commit.summary().unwrap_or(""));
        let author = commit.author();
        let body = format!(
            "{}\n\nSource-Author: {} <{}>\nSource-Date: {}",
            commit.body().unwrap_or("").trim(),
            author.name().unwrap_or(""),
            author.email().unwrap_or(""),
            git_date(&author.when()),
        );
        let git_log = format!("{}\n\n{}", subject, body.trim());

        Ok(GitSourceVersion {
            repo_path,
            sha: sha.to_string(),
            remote: remote.to_string(),
            source_description: source_description.to_string(),
            source_name: source_name.to_string(),
            timestamp,
            comment: compose_comment(remote, sha, git_log.trim()),
        })
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn checkout_sha(&self) -> Result<()> {
        let repo = Repository::open(&self.repo_path)?;
        let oid = Oid::from_str(&self.sha)?;
        let commit = repo.find_commit(oid)?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(oid)?;
        Ok(())
    }
}

impl SourceVersion for GitSourceVersion {
    fn apply(&self, preconfig: &mut Preconfig) -> synthloop::Result<()> {
        let precloned = preconfig
            .entry(PRECLONED_REPOS)
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if !precloned.is_object() {
            *precloned = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = precloned.as_object_mut() {
            map.insert(
                self.remote.clone(),
                serde_json::Value::String(self.repo_path.to_string_lossy().into_owned()),
            );
        }

        // The working repository is already at the right commit, and the loop
        // owns its HEAD.
        if self.source_name == SELF_SOURCE {
            return Ok(());
        }
        self.checkout_sha().map_err(|e| Error::Apply {
            source_name: self.source_name.clone(),
            reason: format!("{:#}", e),
        })?;
        debug!(source = %self.source_name, sha = %self.sha, "checked out source version");
        Ok(())
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn comment(&self) -> String {
        self.comment.clone()
    }

    fn source_name(&self) -> String {
        self.source_name.clone()
    }

    fn source_description(&self) -> String {
        self.source_description.clone()
    }
}

// ============================================================================
// Comments
// ============================================================================

/// Remove a trailing `(#123)` from a commit subject.
///
/// The number refers to a pull request in the source repository, and GitHub
/// would link it to an unrelated issue in the regenerated repository.
pub fn strip_pr_number(subject: &str) -> &str {
    let Some(rest) = subject.strip_suffix(')') else {
        return subject;
    };
    let Some(open) = rest.rfind("(#") else {
        return subject;
    };
    let digits = &rest[open + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return subject;
    }
    rest[..open].trim_end()
}

/// `(owner, repo)` of an `https://github.com/...` remote.
///
/// ```
/// use synthloop_git::github_owner_repo;
///
/// assert_eq!(
///     github_owner_repo("https://github.com/googleapis/googleapis.git"),
///     Some(("googleapis", "googleapis"))
/// );
/// assert_eq!(github_owner_repo("/tmp/local/repo"), None);
/// ```
pub fn github_owner_repo(remote: &str) -> Option<(&str, &str)> {
    let rest = remote.strip_prefix("https://github.com/")?;
    let (owner, rest) = rest.split_once('/')?;
    let end = rest.find(['/', '.']).unwrap_or(rest.len());
    let repo = &rest[..end];
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

/// Describe the commit `sha` of `remote`, appending source trailers to its
/// log text.
pub fn compose_comment(remote: &str, sha: &str, git_log: &str) -> String {
    match github_owner_repo(remote) {
        Some((owner, repo)) => format!(
            "{}\nSource-Repo: {}/{}\nSource-Sha: {}\nSource-Link: https://github.com/{}/{}/commit/{}",
            git_log, owner, repo, sha, owner, repo, sha
        ),
        None => format!("{}\nSource-Repo: {}\nSource-Sha: {}", git_log, remote, sha),
    }
}

/// Date in git's default log format, e.g. `Thu Mar 5 10:00:00 2020 -0800`.
fn git_date(time: &git2::Time) -> String {
    let Some(utc) = DateTime::from_timestamp(time.seconds(), 0) else {
        return time.seconds().to_string();
    };
    const FORMAT: &str = "%a %b %-d %H:%M:%S %Y %z";
    match FixedOffset::east_opt(time.offset_minutes() * 60) {
        Some(offset) => utc.with_timezone(&offset).format(FORMAT).to_string(),
        None => utc.format(FORMAT).to_string(),
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Clone `remote` into `dest`.
pub fn clone_source(remote: &str, dest: &Path) -> Result<Repository> {
    info!(remote, dest = %dest.display(), "cloning source");
    Repository::clone(remote, dest).with_context(|| format!("Failed to clone {}", remote))
}

/// Shas from `tail_sha` (inclusive) to HEAD, oldest first.
pub fn commit_shas_since(repo: &Repository, tail_sha: &str) -> Result<Vec<String>> {
    let tail = Oid::from_str(tail_sha).with_context(|| format!("Invalid sha '{}'", tail_sha))?;
    let mut walker = repo.revwalk()?;
    walker.push_head()?;
    walker.hide(tail)?;
    walker.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

    let mut shas = vec![tail.to_string()];
    for oid in walker {
        shas.push(oid?.to_string());
    }
    Ok(shas)
}

/// Every version after the recorded sha of each distinct git source in
/// `metadata`, one list per source. Sources are cloned under `clone_dir`.
pub fn enumerate_versions(
    metadata: &Metadata,
    clone_dir: &Path,
) -> Result<Vec<Vec<Rc<dyn SourceVersion>>>> {
    let mut versions = Vec::new();
    for source in metadata.git_sources() {
        // The regenerated repository itself; see enumerate_versions_for_working_repo.
        if source.name == "." {
            continue;
        }
        let repo = clone_source(&source.remote, &clone_dir.join(&source.name))?;
        let description = format!("Git repo {}", source.remote);
        let mut source_versions: Vec<Rc<dyn SourceVersion>> = Vec::new();
        for sha in commit_shas_since(&repo, &source.sha)? {
            let version =
                GitSourceVersion::load(&repo, &sha, &source.remote, &description, &source.name)?;
            source_versions.push(Rc::new(version));
        }
        debug!(source = %source.name, count = source_versions.len(), "enumerated versions");
        if !source_versions.is_empty() {
            versions.push(source_versions);
        }
    }
    Ok(versions)
}

/// A single `self` version for the repository containing `metadata_path`,
/// timestamped at the epoch so it is always applied first.
pub fn enumerate_versions_for_working_repo(metadata_path: &Path) -> Result<Vec<Rc<dyn SourceVersion>>> {
    let start = metadata_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let repo = Repository::discover(start)
        .with_context(|| format!("No repository contains {:?}", metadata_path))?;
    let head = repo.head()?.peel_to_commit()?;
    let remote = origin_url(&repo)?;
    let description = format!("This git repo ({})", remote);
    let mut version = GitSourceVersion::load(
        &repo,
        &head.id().to_string(),
        &remote,
        &description,
        SELF_SOURCE,
    )?;
    version.timestamp = DateTime::UNIX_EPOCH;
    Ok(vec![Rc::new(version)])
}

/// URL of `origin`, falling back to a `file://` URI of the working tree.
pub fn origin_url(repo: &Repository) -> Result<String> {
    if let Ok(remote) = repo.find_remote("origin")
        && let Some(url) = remote.url()
    {
        return Ok(url.to_string());
    }
    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("Repository has no working tree"))?;
    Ok(format!("file://{}", workdir.display()))
}
