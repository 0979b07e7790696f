//! State shared by the attribution loop: the flattened history, the per-index
//! generation cache, and the destination branch it merges into.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::flatten::{ApplyTable, FlatVersion, flatten_and_sort_source_versions, generate_apply_table};
use crate::metadata::Metadata;
use crate::pusher::{ChangePusher, Context};
use crate::synthesizer::Synthesizer;
use crate::vcs::{IgnoreRules, VersionControl};
use crate::version::{Preconfig, SourceVersion};
use crate::Result;

/// Result of generating code for one version in its own branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The generated tree differs from the baseline.
    Changed,
    /// The generator ran but produced nothing new.
    Unchanged,
    /// The generator failed. Whatever it left behind is committed to the
    /// version's branch, which is then never merged.
    Failed,
}

impl Outcome {
    pub fn has_changes(self) -> bool {
        self == Outcome::Changed
    }
}

/// Settings that do not change between a toolbox and its forks.
#[derive(Debug, Clone)]
pub struct ToolboxSettings {
    /// Metadata file path, relative to the repository root.
    pub metadata_path: PathBuf,
    /// Directory containing the generator config in a monorepo, or empty.
    pub synth_path: String,
    pub ignored: IgnoreRules,
}

impl ToolboxSettings {
    pub fn new(metadata_path: impl Into<PathBuf>, synth_path: impl Into<String>) -> Result<Self> {
        let metadata_path = metadata_path.into();
        let ignored = IgnoreRules::for_metadata(&metadata_path)?;
        Ok(ToolboxSettings {
            metadata_path,
            synth_path: synth_path.into(),
            ignored,
        })
    }
}

/// Version zero (every source at its oldest version) is identical across
/// forks, so it is generated once and reused.
#[derive(Debug, Default)]
struct VersionZero {
    branch_name: Option<String>,
    has_changes: bool,
}

pub struct Toolbox<'a> {
    vcs: &'a dyn VersionControl,
    settings: Rc<ToolboxSettings>,
    /// Destination branch.
    pub branch: String,
    version_groups: Vec<Vec<Rc<dyn SourceVersion>>>,
    pub versions: Vec<FlatVersion>,
    apply_table: ApplyTable,
    /// Commits merged into `branch`, including any inherited baseline.
    pub commit_count: usize,
    /// Set only for forks.
    pub source_name: Option<String>,
    version_zero: Rc<RefCell<VersionZero>>,
    log_dir: PathBuf,
}

impl<'a> Toolbox<'a> {
    pub fn new(
        vcs: &'a dyn VersionControl,
        source_versions: Vec<Vec<Rc<dyn SourceVersion>>>,
        branch: impl Into<String>,
        settings: ToolboxSettings,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_shared(
            vcs,
            source_versions,
            branch.into(),
            Rc::new(settings),
            log_dir.into(),
            Rc::default(),
        )
    }

    fn with_shared(
        vcs: &'a dyn VersionControl,
        source_versions: Vec<Vec<Rc<dyn SourceVersion>>>,
        branch: String,
        settings: Rc<ToolboxSettings>,
        log_dir: PathBuf,
        version_zero: Rc<RefCell<VersionZero>>,
    ) -> Self {
        let version_groups: Vec<Vec<Rc<dyn SourceVersion>>> = source_versions
            .into_iter()
            .filter(|group| !group.is_empty())
            .collect();
        let versions = flatten_and_sort_source_versions(&version_groups);
        let apply_table = generate_apply_table(&versions);
        Toolbox {
            vcs,
            settings,
            branch,
            version_groups,
            versions,
            apply_table,
            commit_count: 0,
            source_name: None,
            version_zero,
            log_dir,
        }
    }

    pub fn vcs(&self) -> &'a dyn VersionControl {
        self.vcs
    }

    pub fn settings(&self) -> &ToolboxSettings {
        &self.settings
    }

    pub fn youngest(&self) -> Option<usize> {
        self.versions.len().checked_sub(1)
    }

    /// Apply one version from each group: the composite snapshot consistent
    /// with global time `index`.
    pub fn apply_version(&self, index: usize) -> Result<Preconfig> {
        let mut preconfig = Preconfig::new();
        for &i in self.apply_table[index].values() {
            self.versions[i].version.apply(&mut preconfig)?;
        }
        Ok(preconfig)
    }

    /// Name of the branch that holds the code generated for `index`.
    pub fn sub_branch(&self, index: usize) -> String {
        format!("{}-{}", self.branch, index)
    }

    fn checkout_new_branch(&self, index: usize) -> Result<()> {
        let name = self.sub_branch(index);
        self.vcs.create_or_reset_branch(&name)?;
        self.vcs.checkout(&name)?;
        Ok(())
    }

    /// Compare two branches, ignoring churn in the metadata file.
    pub fn git_branches_differ(&self, branch_a: &str, branch_b: &str) -> Result<bool> {
        Ok(self
            .vcs
            .diff_contains_real_changes(branch_a, branch_b, &self.settings.ignored)?)
    }

    /// Merge the branch for `index` into the current branch as a patch and
    /// commit it. Returns `false` when there was nothing left to merge.
    pub fn patch_merge_version(&mut self, index: usize, comment: Option<&str>) -> Result<bool> {
        let sub_branch = self.sub_branch(index);
        if !self.git_branches_differ("HEAD", &sub_branch)? {
            debug!(index, branch = %sub_branch, "nothing left to merge");
            return Ok(false);
        }
        let patch = self.vcs.compute_patch("HEAD", &sub_branch)?;
        self.vcs.apply_patch(&patch)?;
        let message = match comment {
            Some(comment) => comment.to_string(),
            None => self.versions[index].version.comment(),
        };
        self.vcs.commit_all(&message)?;
        self.commit_count += 1;
        self.versions[index].merged = true;
        info!(index, branch = %self.branch, commit_count = self.commit_count, "merged version");
        Ok(true)
    }

    /// One toolbox per source. In each, that source keeps its full history
    /// and every other source is pinned to its oldest version.
    pub fn fork(&self) -> Result<Vec<Toolbox<'a>>> {
        let mut forks = Vec::with_capacity(self.version_groups.len());
        for (i, group) in self.version_groups.iter().enumerate() {
            let new_groups: Vec<Vec<Rc<dyn SourceVersion>>> = self
                .version_groups
                .iter()
                .enumerate()
                .map(|(j, g)| if i == j { g.clone() } else { g[..1].to_vec() })
                .collect();
            let source_name = group[0].source_name();
            let fork_branch = format!("{}-{}", self.branch, source_name);
            let mut fork = Toolbox::with_shared(
                self.vcs,
                new_groups,
                fork_branch,
                Rc::clone(&self.settings),
                self.log_dir.join(&source_name),
                Rc::clone(&self.version_zero),
            );
            fork.source_name = Some(source_name);
            fork.commit_count = self.commit_count;
            self.vcs.create_or_reset_branch(&fork.branch)?;
            forks.push(fork);
        }
        Ok(forks)
    }

    /// Generate code for version `index` in its own branch and report whether
    /// it differs from the destination branch.
    ///
    /// The result is cached: asking again never re-runs the generator. The
    /// current branch is checked out again before returning, on every path.
    /// A generator failure at the youngest version is returned as an error.
    /// At any other version it counts as "no change" and the version is
    /// flagged so its branch is never merged.
    pub fn synthesize_version_in_new_branch(
        &mut self,
        synthesizer: &dyn Synthesizer,
        index: usize,
    ) -> Result<bool> {
        if let Some(cached) = self.versions[index].branch_has_changes {
            return Ok(cached);
        }

        let preconfig = self.apply_version(index)?;
        self.checkout_new_branch(index)?;
        let result = self.generate_in_branch(synthesizer, index, &preconfig);
        let cleanup = self
            .vcs
            .hard_reset()
            .and_then(|()| self.vcs.checkout(&self.branch));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(index, branch = %self.sub_branch(index), error = %e, "generation failed");
                return Err(e);
            }
        };
        cleanup?;

        let has_changes = outcome.has_changes();
        self.versions[index].branch_has_changes = Some(has_changes);
        self.versions[index].generation_failed = outcome == Outcome::Failed;
        if index == 0 {
            let mut zero = self.version_zero.borrow_mut();
            if zero.branch_name.is_none() {
                zero.branch_name = Some(self.sub_branch(0));
                zero.has_changes = has_changes;
            }
        }
        Ok(has_changes)
    }

    fn generate_in_branch(
        &self,
        synthesizer: &dyn Synthesizer,
        index: usize,
        preconfig: &Preconfig,
    ) -> Result<Outcome> {
        if index == 0 {
            let zero = self.version_zero.borrow();
            if let Some(name) = &zero.branch_name {
                debug!(branch = %name, "reusing version zero");
                self.vcs.fast_forward(name)?;
                return Ok(if zero.has_changes {
                    Outcome::Changed
                } else {
                    Outcome::Unchanged
                });
            }
        }

        let log_path = self.log_dir.join(index.to_string()).join("sponge_log.log");
        let completed = if Some(index) == self.youngest() {
            // Nothing younger to fall back to: a broken tip is fatal.
            synthesizer.synthesize(&log_path, preconfig)?;
            true
        } else {
            synthesizer
                .synthesize_and_catch_failure(&log_path, preconfig)?
                .is_some()
        };

        // Partial output is committed too. A failed version is never merged.
        self.vcs
            .commit_all(&self.versions[index].version.comment())?;

        if !completed {
            warn!(index, "generator failed for historical version; treating as no change");
            return Ok(Outcome::Failed);
        }
        if self.git_branches_differ(&self.branch, &self.sub_branch(index))? {
            Ok(Outcome::Changed)
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    /// Commits that could be traced to a source version.
    pub fn count_commits_with_context(&self) -> usize {
        match self.versions.first() {
            Some(first) if first.merged => self.commit_count.saturating_sub(1),
            _ => self.commit_count,
        }
    }

    /// Compose a title, push the branch and label the pull request.
    pub fn push_changes(&self, change_pusher: &dyn ChangePusher) -> Result<()> {
        if self.commit_count < 1 {
            return Ok(());
        }
        let with_context = self.count_commits_with_context();
        let subject = if self.commit_count == 1 && with_context == 1 {
            self.vcs.last_commit_subject()?
        } else {
            String::new()
        };
        let pr_title = compose_pr_title(
            self.commit_count,
            with_context,
            &self.settings.synth_path,
            self.source_name.as_deref(),
            &subject,
        );
        let pr = change_pusher.push_changes(self.commit_count, &self.branch, &pr_title, "")?;
        // The label makes it easy to collect statistics about commits with context.
        let context = Context::classify(self.commit_count, with_context);
        pr.add_labels(&[context.to_string()])?;
        Ok(())
    }

    /// Whether the metadata file on `branch` lists generated files.
    pub fn metadata_contains_generated_files(&self, branch: &str) -> Result<bool> {
        let Some(bytes) = self.vcs.read_file(branch, &self.settings.metadata_path)? else {
            return Ok(false);
        };
        Ok(Metadata::parse(&bytes)?.is_some_and(|m| m.contains_generated_files()))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Title for a pull request holding `commit_count` commits.
///
/// A single commit with context lends its own subject (`last_subject`);
/// anything else gets a generic title naming the source, if any.
pub fn compose_pr_title(
    commit_count: usize,
    commits_with_context: usize,
    synth_path: &str,
    source_name: Option<&str>,
    last_subject: &str,
) -> String {
    if commit_count == 1 && commits_with_context == 1 {
        return if synth_path.is_empty() {
            last_subject.to_string()
        } else {
            format!("[{}] {}", synth_path, last_subject)
        };
    }
    let synth_path_space = if synth_path.is_empty() {
        String::new()
    } else {
        format!("{} ", synth_path)
    };
    match source_name {
        Some(source) if !source.is_empty() => format!(
            "[CHANGE ME] Re-generated {}to pick up changes from {}.",
            synth_path_space, source
        ),
        _ => format!(
            "[CHANGE ME] Re-generated {}to pick up changes in the API or client library generator.",
            synth_path_space
        ),
    }
}
