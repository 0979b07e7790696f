//! The attribution loop: find which source versions changed the generated
//! code and replay each change as its own commit, oldest first.

use tracing::{debug, error, info, warn};

use crate::pusher::{ChangePusher, Context};
use crate::synthesizer::Synthesizer;
use crate::toolbox::Toolbox;
use crate::{Error, Result};

/// Message for the catch-all commit holding changes that no tracked source
/// version explains.
pub const CHANGES_WITHOUT_CONTEXT: &str = "changes without context

synthloop cannot find the source of changes triggered by earlier changes in this
repository, or by version upgrades to tools such as linters.";

pub const START_TRACKING_OBSOLETE_FILES: &str = "chore: start tracking obsolete files";

/// What a loop run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Nothing to commit; callers should not open a pull request.
    Skipped,
    Committed(usize),
}

impl LoopOutcome {
    fn from_count(count: usize) -> Self {
        if count == 0 {
            LoopOutcome::Skipped
        } else {
            LoopOutcome::Committed(count)
        }
    }

    pub fn commit_count(&self) -> usize {
        match self {
            LoopOutcome::Skipped => 0,
            LoopOutcome::Committed(n) => *n,
        }
    }
}

/// Loop through all source versions and create a commit for every version
/// that changed the generated code.
///
/// With `multiple_prs`, the history is partitioned per source and each source
/// gets its own branch and pull request. If that fails partway, a single pull
/// request is attempted so some progress is made, and the original error is
/// still returned.
pub fn synthesize_loop(
    toolbox: &mut Toolbox<'_>,
    multiple_prs: bool,
    change_pusher: &dyn ChangePusher,
    synthesizer: &dyn Synthesizer,
) -> Result<LoopOutcome> {
    let Some(youngest) = toolbox.youngest() else {
        return Ok(LoopOutcome::Skipped);
    };

    // Synthesize with the most recent version of every source.
    if !toolbox.synthesize_version_in_new_branch(synthesizer, youngest)? {
        return start_tracking_obsolete_files(toolbox, youngest, change_pusher);
    }

    if multiple_prs {
        return match synthesize_loop_multiple_prs(toolbox, change_pusher, synthesizer) {
            Ok(count) => Ok(LoopOutcome::from_count(count)),
            Err(e) => {
                error!(error = %e, branch = %toolbox.branch, "multiple-PR loop failed; falling back to a single pull request");
                let fallback = toolbox
                    .vcs()
                    .checkout(&toolbox.branch)
                    .map_err(Error::from)
                    .and_then(|()| synthesize_loop_single_pr(toolbox, change_pusher, synthesizer));
                if let Err(fallback) = fallback {
                    warn!(error = %fallback, "single pull request fallback also failed");
                }
                Err(e)
            }
        };
    }

    synthesize_loop_single_pr(toolbox, change_pusher, synthesizer).map(LoopOutcome::from_count)
}

/// The youngest version changed nothing. If the repository owner just turned
/// on obsolete-file tracking, the generator's metadata is the only change;
/// commit it once so tracking can begin.
fn start_tracking_obsolete_files(
    toolbox: &mut Toolbox<'_>,
    youngest: usize,
    change_pusher: &dyn ChangePusher,
) -> Result<LoopOutcome> {
    let sub_branch = toolbox.sub_branch(youngest);
    if toolbox.metadata_contains_generated_files(&toolbox.branch)?
        || !toolbox.metadata_contains_generated_files(&sub_branch)?
        || change_pusher.pr_exists(&toolbox.branch)?
    {
        info!(branch = %toolbox.branch, "no changes");
        return Ok(LoopOutcome::Skipped);
    }

    let vcs = toolbox.vcs();
    vcs.checkout(&toolbox.branch)?;
    let patch = vcs.compute_patch("HEAD", &sub_branch)?;
    vcs.apply_patch(&patch)?;
    vcs.commit_all(START_TRACKING_OBSOLETE_FILES)?;
    toolbox.commit_count += 1;
    info!(branch = %toolbox.branch, "committed metadata to start tracking obsolete files");

    let pr = change_pusher.push_changes(1, &toolbox.branch, START_TRACKING_OBSOLETE_FILES, "")?;
    pr.add_labels(&[Context::Full.to_string()])?;
    Ok(LoopOutcome::Committed(1))
}

/// One pull request per source. Every fork is attempted even if an earlier
/// one fails; the first failure is returned afterwards.
fn synthesize_loop_multiple_prs(
    toolbox: &mut Toolbox<'_>,
    change_pusher: &dyn ChangePusher,
    synthesizer: &dyn Synthesizer,
) -> Result<usize> {
    let mut commit_count = 0;
    let mut first_error: Option<Error> = None;
    for mut fork in toolbox.fork()? {
        let result = (|| -> Result<usize> {
            if change_pusher.pr_exists(&fork.branch)? {
                info!(branch = %fork.branch, "pull request already exists");
                return Ok(0);
            }
            fork.vcs().checkout(&fork.branch)?;
            synthesize_inner_loop(&mut fork, synthesizer)?;
            let is_self = fork.source_name.as_deref() == Some("self");
            if is_self || fork.count_commits_with_context() > 0 {
                fork.push_changes(change_pusher)?;
            }
            Ok(fork.commit_count)
        })();
        match result {
            Ok(count) => commit_count += count,
            Err(e) => {
                error!(branch = %fork.branch, error = %e, "fork failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(commit_count),
    }
}

/// One pull request for all sources. Skipped when a pull request already
/// exists for the branch.
pub fn synthesize_loop_single_pr(
    toolbox: &mut Toolbox<'_>,
    change_pusher: &dyn ChangePusher,
    synthesizer: &dyn Synthesizer,
) -> Result<usize> {
    if change_pusher.pr_exists(&toolbox.branch)? {
        info!(branch = %toolbox.branch, "pull request already exists");
        return Ok(0);
    }
    synthesize_inner_loop(toolbox, synthesizer)?;
    toolbox.push_changes(change_pusher)?;
    Ok(toolbox.commit_count)
}

/// Bootstrap with the youngest and oldest versions, then binary search.
pub fn synthesize_inner_loop(toolbox: &mut Toolbox<'_>, synthesizer: &dyn Synthesizer) -> Result<()> {
    let Some(youngest) = toolbox.youngest() else {
        return Ok(());
    };
    if !toolbox.synthesize_version_in_new_branch(synthesizer, youngest)? {
        return Ok(());
    }

    // Changes already present in the oldest version cannot be attributed to
    // any tracked source; commit them first under a catch-all message.
    if youngest == 0 || toolbox.synthesize_version_in_new_branch(synthesizer, 0)? {
        toolbox.patch_merge_version(0, Some(CHANGES_WITHOUT_CONTEXT))?;
    }

    synthesize_range(toolbox, synthesizer)
}

/// Binary search the flattened history for the versions that changed the
/// generated code, patch-merging each one as it is found.
///
/// `version_ranges` is a stack kept sorted so the oldest range is popped
/// first, which makes merges land in ascending version order. A range whose
/// ends generate the same code is discarded without generating anything in
/// between. A version whose generation failed is never merged; the next
/// successful version's patch carries its changes.
pub fn synthesize_range(toolbox: &mut Toolbox<'_>, synthesizer: &dyn Synthesizer) -> Result<()> {
    let Some(youngest) = toolbox.youngest() else {
        return Ok(());
    };
    let mut version_ranges: Vec<(usize, usize)> = vec![(0, youngest)];
    while let Some((old, young)) = version_ranges.pop() {
        if young <= old {
            continue;
        }
        if young == old + 1 {
            if toolbox.versions[young].generation_failed {
                debug!(index = young, "generator failed for this version; nothing to merge");
                continue;
            }
            // Found a version that triggered a change.
            toolbox.patch_merge_version(young, None)?;
            continue;
        }
        if !toolbox.git_branches_differ(&toolbox.sub_branch(old), &toolbox.sub_branch(young))? {
            continue;
        }
        let middle = old + (young - old) / 2;
        toolbox.synthesize_version_in_new_branch(synthesizer, middle)?;
        version_ranges.push((middle, young));
        version_ranges.push((old, middle));
    }
    Ok(())
}
