//! git2-backed [`VersionControl`] for synthloop, plus source versions that
//! come from the history of git repositories.

mod source;

pub use source::{
    GitSourceVersion, SELF_SOURCE, clone_source, commit_shas_since, compose_comment,
    enumerate_versions, enumerate_versions_for_working_repo, github_owner_repo, origin_url,
    strip_pr_number,
};

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use git2::build::CheckoutBuilder;
use git2::{
    ApplyLocation, BranchType, Commit, Delta, Diff, DiffOptions, ErrorCode, IndexAddOption,
    Repository, ResetType, Signature, Status, StatusOptions,
};
use synthloop::vcs::{FileChange, VcsResult};
use synthloop::{IgnoreRules, Patch, VcsError, VersionControl};
use tracing::debug;

// ============================================================================
// Workspace
// ============================================================================

/// A non-bare repository whose working tree the attribution loop owns.
pub struct GitWorkspace {
    repo: Repository,
}

impl GitWorkspace {
    pub fn new(repo: Repository) -> Self {
        GitWorkspace { repo }
    }

    /// Open the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path)
            .with_context(|| format!("Failed to open repository at {:?}", path))?;
        if repo.is_bare() {
            return Err(anyhow!("Repository at {:?} has no working tree", path));
        }
        Ok(GitWorkspace { repo })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> Result<&Path> {
        self.repo
            .workdir()
            .ok_or_else(|| anyhow!("Repository has no working tree"))
    }

    /// Set the identity used for commits in this repository.
    pub fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        let mut config = self.repo.config()?;
        config.set_str("user.name", name)?;
        config.set_str("user.email", email)?;
        Ok(())
    }

    /// Create (or move) `branch` to HEAD and check it out.
    pub fn setup_branch(&self, branch: &str) -> Result<()> {
        self.branch_at_head(branch)?;
        self.checkout_branch(branch)
    }

    /// Force-push `branch` to `origin`.
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        let output = Command::new("git")
            .current_dir(self.workdir()?)
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(["push", "--force", "origin", branch])
            .output()
            .context("Failed to run git push")?;
        if !output.status.success() {
            return Err(anyhow!(
                "git push failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("synthloop", "synthloop@localhost")?),
        }
    }

    fn resolve_commit(&self, rev: &str) -> VcsResult<Commit<'_>> {
        let object = self
            .repo
            .revparse_single(rev)
            .map_err(|_| VcsError::RefNotFound(rev.to_string()))?;
        object
            .peel_to_commit()
            .map_err(|_| VcsError::RefNotFound(rev.to_string()))
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn branch_at_head(&self, name: &str) -> Result<()> {
        // libgit2 refuses to force-move the checked-out branch, which is
        // already at HEAD anyway.
        if let Ok(head) = self.repo.head()
            && head.is_branch()
            && head.shorthand() == Some(name)
        {
            return Ok(());
        }
        let head = self
            .head_commit()?
            .ok_or_else(|| anyhow!("Cannot create branch '{}' without a commit", name))?;
        self.repo.branch(name, &head, true)?;
        Ok(())
    }

    fn checkout_branch(&self, name: &str) -> Result<()> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", name))?;
        let refname = branch
            .get()
            .name()
            .ok_or_else(|| anyhow!("Branch '{}' has a non UTF-8 name", name))?
            .to_string();
        let target = branch.get().peel_to_commit()?;
        self.repo
            .checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
        self.repo.set_head(&refname)?;
        Ok(())
    }

    fn stage_and_commit(&self, message: &str) -> Result<bool> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.head_commit()?;
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(false);
        }
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %oid, "committed");
        Ok(true)
    }

    fn tree_diff(&self, from: &str, to: &str, opts: Option<&mut DiffOptions>) -> VcsResult<Diff<'_>> {
        let a = self.resolve_commit(from)?.tree().map_err(anyhow::Error::from)?;
        let b = self.resolve_commit(to)?.tree().map_err(anyhow::Error::from)?;
        Ok(self
            .repo
            .diff_tree_to_tree(Some(&a), Some(&b), opts)
            .map_err(anyhow::Error::from)?)
    }
}

fn delta_change(status: Delta) -> FileChange {
    match status {
        Delta::Added | Delta::Untracked | Delta::Copied => FileChange::Added,
        Delta::Deleted => FileChange::Deleted,
        _ => FileChange::Modified,
    }
}

fn status_change(status: Status) -> FileChange {
    if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
        FileChange::Added
    } else if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
        FileChange::Deleted
    } else {
        FileChange::Modified
    }
}

// ============================================================================
// VersionControl
// ============================================================================

impl VersionControl for GitWorkspace {
    fn create_or_reset_branch(&self, name: &str) -> VcsResult<()> {
        Ok(self.branch_at_head(name)?)
    }

    fn checkout(&self, name: &str) -> VcsResult<()> {
        Ok(self.checkout_branch(name)?)
    }

    fn commit_all(&self, message: &str) -> VcsResult<bool> {
        Ok(self.stage_and_commit(message)?)
    }

    fn has_uncommitted_changes(&self, ignored: &IgnoreRules) -> VcsResult<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .map_err(anyhow::Error::from)?;
        for entry in statuses.iter() {
            let status = entry.status();
            if status.is_ignored() {
                continue;
            }
            let Some(path) = entry.path() else {
                return Ok(true);
            };
            if ignored.counts(Path::new(path), status_change(status)) {
                debug!(path, ?status, "uncommitted change");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn diff_contains_real_changes(
        &self,
        branch_a: &str,
        branch_b: &str,
        ignored: &IgnoreRules,
    ) -> VcsResult<bool> {
        let diff = self.tree_diff(branch_a, branch_b, None)?;
        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                return Ok(true);
            };
            if ignored.counts(path, delta_change(delta.status())) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn compute_patch(&self, from: &str, to: &str) -> VcsResult<Patch> {
        let mut opts = DiffOptions::new();
        opts.show_binary(true);
        let diff = self.tree_diff(from, to, Some(&mut opts))?;
        let mut buf = Vec::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            if let origin @ ('+' | '-' | ' ') = line.origin() {
                buf.push(origin as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })
        .map_err(anyhow::Error::from)?;
        Ok(Patch(buf))
    }

    fn apply_patch(&self, patch: &Patch) -> VcsResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let diff = Diff::from_buffer(patch.as_bytes()).map_err(anyhow::Error::from)?;
        self.repo
            .apply(&diff, ApplyLocation::Both, None)
            .map_err(|e| VcsError::PatchFailed(e.message().to_string()))
    }

    fn hard_reset(&self) -> VcsResult<()> {
        let head = self
            .head_commit()?
            .ok_or_else(|| anyhow!("Cannot reset without a commit"))?;
        self.repo
            .reset(head.as_object(), ResetType::Hard, None)
            .map_err(anyhow::Error::from)?;
        // Reset only rewrites tracked paths; the checkout clears the rest.
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force().remove_untracked(true)))
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn fast_forward(&self, target: &str) -> VcsResult<()> {
        let target_commit = self.resolve_commit(target)?;
        let head = self.repo.head().map_err(anyhow::Error::from)?;
        let head_commit = head.peel_to_commit().map_err(anyhow::Error::from)?;
        let current = head.shorthand().unwrap_or("HEAD").to_string();
        if head_commit.id() == target_commit.id() {
            return Ok(());
        }
        let descends = self
            .repo
            .graph_descendant_of(target_commit.id(), head_commit.id())
            .map_err(anyhow::Error::from)?;
        if !descends {
            return Err(VcsError::NotFastForward {
                current,
                target: target.to_string(),
            });
        }
        let mut head = head;
        head.set_target(target_commit.id(), &format!("fast-forward to {}", target))
            .map_err(anyhow::Error::from)?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn read_file(&self, branch: &str, path: &Path) -> VcsResult<Option<Vec<u8>>> {
        let tree = self
            .resolve_commit(branch)?
            .tree()
            .map_err(anyhow::Error::from)?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(anyhow::Error::from(e).into()),
        };
        let blob = entry
            .to_object(&self.repo)
            .and_then(|o| o.peel_to_blob())
            .map_err(anyhow::Error::from)?;
        Ok(Some(blob.content().to_vec()))
    }

    fn last_commit_subject(&self) -> VcsResult<String> {
        let head = self
            .head_commit()?
            .ok_or_else(|| anyhow!("No commits yet"))?;
        Ok(head.summary().unwrap_or("").trim().to_string())
    }

    fn recent_commit_messages(&self, count: usize) -> VcsResult<Vec<String>> {
        let mut walker = self.repo.revwalk().map_err(anyhow::Error::from)?;
        walker.push_head().map_err(anyhow::Error::from)?;
        walker.simplify_first_parent().map_err(anyhow::Error::from)?;
        let mut messages = Vec::with_capacity(count);
        for oid in walker.take(count) {
            let oid = oid.map_err(anyhow::Error::from)?;
            let commit = self.repo.find_commit(oid).map_err(anyhow::Error::from)?;
            messages.push(commit.message().unwrap_or("").to_string());
        }
        Ok(messages)
    }

    fn squash_recent(&self, count: usize, message: &str) -> VcsResult<()> {
        let head = self
            .head_commit()?
            .ok_or_else(|| anyhow!("No commits to squash"))?;
        let mut base = head.clone();
        for _ in 0..count {
            base = base
                .parent(0)
                .with_context(|| format!("Branch has fewer than {} commits to squash", count))?;
        }
        let tree = head.tree().map_err(anyhow::Error::from)?;
        let sig = self.signature()?;
        let oid = self
            .repo
            .commit(None, &sig, &sig, message, &tree, &[&base])
            .map_err(anyhow::Error::from)?;
        let mut head_ref = self.repo.head().map_err(anyhow::Error::from)?;
        head_ref
            .set_target(oid, "squash")
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_temp_repo() -> (tempfile::TempDir, GitWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        let ws = GitWorkspace::new(repo);
        fs::write(dir.path().join("README.md"), "Well done.").unwrap();
        assert!(ws.commit_all("Added Readme").unwrap());
        ws.setup_branch("test").unwrap();
        (dir, ws)
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn metadata_rules() -> IgnoreRules {
        IgnoreRules::for_metadata(Path::new("synth.metadata")).unwrap()
    }

    #[test]
    fn test_commit_all_nothing_to_commit() {
        let (_dir, ws) = init_temp_repo();
        assert!(!ws.commit_all("empty").unwrap());
    }

    #[test]
    fn test_setup_branch_while_checked_out() {
        let (dir, ws) = init_temp_repo();
        write(&dir, "a.txt", "a");
        ws.commit_all("a").unwrap();
        ws.setup_branch("test").unwrap();
        assert_eq!(ws.last_commit_subject().unwrap(), "a");
        assert_eq!(ws.repo().head().unwrap().shorthand(), Some("test"));
    }

    #[test]
    fn test_commit_all_stages_deletions() {
        let (dir, ws) = init_temp_repo();
        fs::remove_file(dir.path().join("README.md")).unwrap();
        assert!(ws.commit_all("remove readme").unwrap());
        assert!(ws.read_file("HEAD", Path::new("README.md")).unwrap().is_none());
    }

    #[test]
    fn test_branches_differ_and_ignore_metadata_modifications() {
        let (dir, ws) = init_temp_repo();
        write(&dir, "synth.metadata", "{}");
        ws.commit_all("add metadata").unwrap();
        ws.setup_branch("test").unwrap();

        ws.create_or_reset_branch("test-1").unwrap();
        ws.checkout("test-1").unwrap();
        write(&dir, "synth.metadata", r#"{"updateTime": "now"}"#);
        ws.commit_all("metadata churn").unwrap();
        assert!(!ws.diff_contains_real_changes("test", "test-1", &metadata_rules()).unwrap());
        assert!(
            ws.diff_contains_real_changes("test", "test-1", &IgnoreRules::default())
                .unwrap()
        );

        write(&dir, "a.txt", "a");
        ws.commit_all("a").unwrap();
        assert!(ws.diff_contains_real_changes("test", "test-1", &metadata_rules()).unwrap());
    }

    #[test]
    fn test_added_metadata_is_a_real_change() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("test-0").unwrap();
        ws.checkout("test-0").unwrap();
        write(&dir, "synth.metadata", "{}");
        ws.commit_all("new metadata").unwrap();
        assert!(ws.diff_contains_real_changes("test", "test-0", &metadata_rules()).unwrap());
    }

    #[test]
    fn test_uncommitted_changes_honor_rules() {
        let (dir, ws) = init_temp_repo();
        write(&dir, "synth.metadata", "{}");
        ws.commit_all("add metadata").unwrap();
        assert!(!ws.has_uncommitted_changes(&metadata_rules()).unwrap());
        write(&dir, "synth.metadata", "{\"x\": 1}");
        assert!(!ws.has_uncommitted_changes(&metadata_rules()).unwrap());
        write(&dir, "new/file.txt", "x");
        assert!(ws.has_uncommitted_changes(&metadata_rules()).unwrap());
    }

    #[test]
    fn test_patch_round_trip_between_branches() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("test-1").unwrap();
        ws.checkout("test-1").unwrap();
        write(&dir, "a.txt", "a\n");
        write(&dir, "nested/b.txt", "b\n");
        fs::remove_file(dir.path().join("README.md")).unwrap();
        ws.commit_all("generate").unwrap();
        ws.checkout("test").unwrap();
        assert!(dir.path().join("README.md").exists());
        assert!(!dir.path().join("a.txt").exists());

        let patch = ws.compute_patch("HEAD", "test-1").unwrap();
        assert!(!patch.is_empty());
        ws.apply_patch(&patch).unwrap();
        ws.commit_all("merged").unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a\n");
        assert!(!dir.path().join("README.md").exists());
        assert!(
            !ws.diff_contains_real_changes("test", "test-1", &IgnoreRules::default())
                .unwrap()
        );
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let (_dir, ws) = init_temp_repo();
        let patch = ws.compute_patch("HEAD", "test").unwrap();
        assert!(patch.is_empty());
        ws.apply_patch(&patch).unwrap();
    }

    #[test]
    fn test_conflicting_patch_fails() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("test-1").unwrap();
        ws.checkout("test-1").unwrap();
        write(&dir, "README.md", "Generated.");
        ws.commit_all("generate").unwrap();
        ws.checkout("test").unwrap();
        let patch = ws.compute_patch("HEAD", "test-1").unwrap();

        write(&dir, "README.md", "Edited by hand.");
        ws.commit_all("hand edit").unwrap();
        let err = ws.apply_patch(&patch).unwrap_err();
        assert!(matches!(err, VcsError::PatchFailed(_)));
    }

    #[test]
    fn test_hard_reset_removes_untracked_files() {
        let (dir, ws) = init_temp_repo();
        write(&dir, "README.md", "scribbled");
        write(&dir, "stray.txt", "stray");
        write(&dir, "gen/stray.rs", "fn main() {}");
        ws.hard_reset().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "Well done."
        );
        assert!(!dir.path().join("stray.txt").exists());
        assert!(!dir.path().join("gen/stray.rs").exists());
        assert!(!ws.has_uncommitted_changes(&IgnoreRules::default()).unwrap());
    }

    #[test]
    fn test_fast_forward() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("ahead").unwrap();
        ws.checkout("ahead").unwrap();
        write(&dir, "a.txt", "a");
        ws.commit_all("a").unwrap();
        ws.checkout("test").unwrap();
        ws.create_or_reset_branch("test-0").unwrap();
        ws.checkout("test-0").unwrap();

        ws.fast_forward("ahead").unwrap();
        assert!(dir.path().join("a.txt").exists());
        assert_eq!(ws.last_commit_subject().unwrap(), "a");
    }

    #[test]
    fn test_fast_forward_rejects_divergence() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("other").unwrap();
        write(&dir, "b.txt", "b");
        ws.commit_all("b on test").unwrap();
        let err = ws.fast_forward("other").unwrap_err();
        assert!(matches!(err, VcsError::NotFastForward { .. }));
    }

    #[test]
    fn test_read_file_from_branch() {
        let (dir, ws) = init_temp_repo();
        ws.create_or_reset_branch("test-1").unwrap();
        ws.checkout("test-1").unwrap();
        write(&dir, "synth.metadata", r#"{"generatedFiles": ["a"]}"#);
        ws.commit_all("meta").unwrap();
        ws.checkout("test").unwrap();
        let bytes = ws
            .read_file("test-1", Path::new("synth.metadata"))
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("generatedFiles"));
        assert!(ws.read_file("test", Path::new("synth.metadata")).unwrap().is_none());
    }

    #[test]
    fn test_unknown_ref() {
        let (_dir, ws) = init_temp_repo();
        let err = ws.compute_patch("HEAD", "no-such-branch").unwrap_err();
        assert!(matches!(err, VcsError::RefNotFound(_)));
    }

    #[test]
    fn test_squash_recent() {
        let (dir, ws) = init_temp_repo();
        for (name, content) in [("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")] {
            write(&dir, name, content);
            ws.commit_all(&format!("wrote {}\n\nbody of {}", name, name)).unwrap();
        }
        let messages = ws.recent_commit_messages(2).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("wrote c.txt"));
        assert!(messages[1].starts_with("wrote b.txt"));

        ws.squash_recent(2, "squashed").unwrap();
        assert_eq!(ws.last_commit_subject().unwrap(), "squashed");
        let messages = ws.recent_commit_messages(3).unwrap();
        assert!(messages[1].starts_with("wrote a.txt"));
        assert!(dir.path().join("c.txt").exists());
        assert!(
            ws.read_file("HEAD", Path::new("b.txt")).unwrap().is_some(),
            "squashed tree keeps every change"
        );
    }
}
