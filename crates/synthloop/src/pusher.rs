//! Publishing a regenerated branch as a pull request.

use std::fmt;

use tracing::info;

use crate::vcs::VersionControl;

/// How many of a pull request's commits could be traced to a source version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Full,
    Partial,
    None,
}

impl Context {
    pub fn classify(commit_count: usize, commits_with_context: usize) -> Context {
        if commits_with_context == 0 {
            Context::None
        } else if commits_with_context == commit_count {
            Context::Full
        } else {
            Context::Partial
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Context::Full => "context: full",
            Context::Partial => "context: partial",
            Context::None => "context: none",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An existing pull request.
pub trait PullRequest {
    fn add_labels(&self, labels: &[String]) -> anyhow::Result<()>;
}

/// Pushes a local branch and opens (or refreshes) its pull request.
pub trait ChangePusher {
    /// Push `branch`, whose last `commit_count` commits are new, and open or
    /// update its pull request.
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        synth_log: &str,
    ) -> anyhow::Result<Box<dyn PullRequest>>;

    /// Whether an open pull request already exists for `branch`.
    fn pr_exists(&self, branch: &str) -> anyhow::Result<bool>;
}

impl<P: ChangePusher + ?Sized> ChangePusher for Box<P> {
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        synth_log: &str,
    ) -> anyhow::Result<Box<dyn PullRequest>> {
        (**self).push_changes(commit_count, branch, pr_title, synth_log)
    }

    fn pr_exists(&self, branch: &str) -> anyhow::Result<bool> {
        (**self).pr_exists(branch)
    }
}

/// Wraps another pusher and squashes all new commits into one before pushing.
pub struct SquashingChangePusher<'a, P> {
    inner: P,
    vcs: &'a dyn VersionControl,
}

impl<'a, P: ChangePusher> SquashingChangePusher<'a, P> {
    pub fn new(inner: P, vcs: &'a dyn VersionControl) -> Self {
        SquashingChangePusher { inner, vcs }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

/// Message for a commit that squashes `messages` (newest first).
pub fn compose_squash_message(messages: &[String]) -> String {
    let mut text = String::from("changes triggered by multiple versions\n\n");
    for message in messages {
        let mut lines = message.trim_end().splitn(2, '\n');
        let subject = lines.next().unwrap_or_default();
        let body = lines.next().unwrap_or_default().trim_start_matches('\n');
        text.push_str("* ");
        text.push_str(subject);
        text.push('\n');
        if !body.is_empty() {
            text.push_str(body);
            text.push('\n');
        }
        text.push('\n');
    }
    text.trim_end().to_string()
}

impl<P: ChangePusher> ChangePusher for SquashingChangePusher<'_, P> {
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        synth_log: &str,
    ) -> anyhow::Result<Box<dyn PullRequest>> {
        if commit_count < 2 {
            return self
                .inner
                .push_changes(commit_count, branch, pr_title, synth_log);
        }
        self.vcs.checkout(branch)?;
        let messages = self.vcs.recent_commit_messages(commit_count)?;
        let message = compose_squash_message(&messages);
        self.vcs.squash_recent(commit_count, &message)?;
        info!(branch, commit_count, "squashed commits");
        self.inner.push_changes(1, branch, pr_title, synth_log)
    }

    fn pr_exists(&self, branch: &str) -> anyhow::Result<bool> {
        self.inner.pr_exists(branch)
    }
}

/// A pusher that publishes nothing and only logs. Used for local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingChangePusher;

struct LoggedPullRequest {
    branch: String,
}

impl PullRequest for LoggedPullRequest {
    fn add_labels(&self, labels: &[String]) -> anyhow::Result<()> {
        info!(branch = %self.branch, ?labels, "would label pull request");
        Ok(())
    }
}

impl ChangePusher for LoggingChangePusher {
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        _synth_log: &str,
    ) -> anyhow::Result<Box<dyn PullRequest>> {
        info!(branch, commit_count, title = pr_title, "would open pull request");
        Ok(Box::new(LoggedPullRequest {
            branch: branch.to_string(),
        }))
    }

    fn pr_exists(&self, _branch: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_classification() {
        assert_eq!(Context::classify(3, 0), Context::None);
        assert_eq!(Context::classify(3, 3), Context::Full);
        assert_eq!(Context::classify(3, 2), Context::Partial);
        assert_eq!(Context::classify(1, 1).to_string(), "context: full");
    }

    #[test]
    fn test_squash_message() {
        let messages = vec![
            "Wrote c to c.txt.\n\nSource-Sha: 123\n".to_string(),
            "Wrote b to b.txt.".to_string(),
        ];
        assert_eq!(
            compose_squash_message(&messages),
            "changes triggered by multiple versions\n\n\
             * Wrote c to c.txt.\nSource-Sha: 123\n\n\
             * Wrote b to b.txt."
        );
    }

    #[test]
    fn test_logging_pusher_never_finds_prs() {
        let pusher = LoggingChangePusher;
        assert!(!pusher.pr_exists("autosynth").unwrap());
        let pr = pusher.push_changes(2, "autosynth", "title", "").unwrap();
        pr.add_labels(&[Context::Full.to_string()]).unwrap();
    }
}
