//! The version-control capability the attribution loop runs against.

use std::path::Path;

use glob::Pattern;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    /// A patch computed between two branches did not apply cleanly.
    #[error("patch did not apply: {0}")]
    PatchFailed(String),

    #[error("cannot fast-forward {current} to {target}")]
    NotFastForward { current: String, target: String },

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type VcsResult<T> = Result<T, VcsError>;

/// A binary-safe patch between two trees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch(pub Vec<u8>);

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// File patterns whose modifications never count as a real change.
///
/// A matching file that is *added* still counts, so a brand-new metadata file
/// is picked up while churn in an existing one is not.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, glob::PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IgnoreRules { patterns })
    }

    /// Rules for the generator's metadata file at `metadata_path`, plus the
    /// same file name in any directory.
    pub fn for_metadata(metadata_path: &Path) -> Result<Self, glob::PatternError> {
        let mut patterns = vec![Pattern::escape(&metadata_path.to_string_lossy())];
        if let Some(name) = metadata_path.file_name() {
            patterns.push(format!("**/{}", Pattern::escape(&name.to_string_lossy())));
        }
        Self::new(&patterns)
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches_path(path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Kind of change a file underwent between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Modified,
    Deleted,
}

impl IgnoreRules {
    /// Whether a change to `path` is a real change under these rules.
    pub fn counts(&self, path: &Path, change: FileChange) -> bool {
        change == FileChange::Added || !self.matches(path)
    }
}

/// Branch, commit, diff and patch operations over one working tree.
///
/// Ref arguments accept anything the backend can resolve to a commit
/// (`"HEAD"`, branch names, hashes). Implementations must leave the working
/// tree alone except where an operation says otherwise.
pub trait VersionControl {
    /// Create `name` at the current HEAD, moving it if it already exists.
    fn create_or_reset_branch(&self, name: &str) -> VcsResult<()>;

    /// Check out an existing branch, discarding local modifications.
    fn checkout(&self, name: &str) -> VcsResult<()>;

    /// Stage every change in the working tree and commit it. Returns `false`
    /// when there was nothing to commit.
    fn commit_all(&self, message: &str) -> VcsResult<bool>;

    /// Whether the uncommitted working tree differs from HEAD, honoring `ignored`.
    fn has_uncommitted_changes(&self, ignored: &IgnoreRules) -> VcsResult<bool>;

    /// Whether the trees of `branch_a` and `branch_b` differ, honoring `ignored`.
    fn diff_contains_real_changes(
        &self,
        branch_a: &str,
        branch_b: &str,
        ignored: &IgnoreRules,
    ) -> VcsResult<bool>;

    /// Patch that turns the tree of `from` into the tree of `to`.
    fn compute_patch(&self, from: &str, to: &str) -> VcsResult<Patch>;

    /// Apply a patch to the working tree without committing.
    fn apply_patch(&self, patch: &Patch) -> VcsResult<()>;

    /// Reset the working tree to HEAD and remove untracked files.
    fn hard_reset(&self) -> VcsResult<()>;

    /// Advance the current branch to `target`, which must descend from it.
    fn fast_forward(&self, target: &str) -> VcsResult<()>;

    /// Contents of `path` in the tree of `branch`, or `None` if absent.
    fn read_file(&self, branch: &str, path: &Path) -> VcsResult<Option<Vec<u8>>>;

    /// First line of the HEAD commit message.
    fn last_commit_subject(&self) -> VcsResult<String>;

    /// Full messages of the last `count` commits, newest first.
    fn recent_commit_messages(&self, count: usize) -> VcsResult<Vec<String>>;

    /// Replace the last `count` commits with one commit holding their combined
    /// tree.
    fn squash_recent(&self, count: usize, message: &str) -> VcsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_rules_match_root_and_nested() {
        let rules = IgnoreRules::for_metadata(Path::new("synth.metadata")).unwrap();
        assert!(rules.matches(Path::new("synth.metadata")));
        assert!(rules.matches(Path::new("packages/vision/synth.metadata")));
        assert!(!rules.matches(Path::new("src/index.ts")));
        assert!(!rules.matches(Path::new("synth.metadata.bak")));
    }

    #[test]
    fn test_added_metadata_still_counts() {
        let rules = IgnoreRules::for_metadata(Path::new("synth.metadata")).unwrap();
        let path = Path::new("synth.metadata");
        assert!(rules.counts(path, FileChange::Added));
        assert!(!rules.counts(path, FileChange::Modified));
        assert!(!rules.counts(path, FileChange::Deleted));
    }

    #[test]
    fn test_other_files_always_count() {
        let rules = IgnoreRules::for_metadata(Path::new("synth.metadata")).unwrap();
        let path = Path::new("README.md");
        assert!(rules.counts(path, FileChange::Modified));
        assert!(rules.counts(path, FileChange::Deleted));
    }

    #[test]
    fn test_empty_rules_ignore_nothing() {
        let rules = IgnoreRules::default();
        assert!(rules.is_empty());
        assert!(rules.counts(Path::new("synth.metadata"), FileChange::Modified));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(IgnoreRules::new(&["a[b"]).is_err());
    }

    #[test]
    fn test_escapes_metadata_path() {
        let rules = IgnoreRules::for_metadata(Path::new("gen[1]/synth.metadata")).unwrap();
        assert!(rules.matches(Path::new("gen[1]/synth.metadata")));
    }
}
