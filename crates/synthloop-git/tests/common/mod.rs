#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use git2::Repository;
use synthloop::synthesizer::SynthError;
use synthloop::{
    ChangePusher, Preconfig, PullRequest, SourceVersion, Synthesizer, Toolbox, ToolboxSettings,
};
use synthloop_git::GitWorkspace;
use tempfile::TempDir;

pub const BRANCH: &str = "test";

/// What the generator does for one version of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `content` to `path`.
    Write(&'static str, &'static str),
    NoChange,
    /// The generator fails at this version.
    Failed,
}

pub use Action::{Failed as F, NoChange as N};

pub fn w(path: &'static str, content: &'static str) -> Action {
    Action::Write(path, content)
}

impl Action {
    fn comment(&self) -> String {
        match self {
            Action::Write(path, content) => format!("Wrote {} to {}.", content, path),
            Action::NoChange => "no change".to_string(),
            Action::Failed => "failed".to_string(),
        }
    }
}

pub struct MockVersion {
    source: String,
    index: usize,
    action: Action,
    timestamp: DateTime<Utc>,
}

impl SourceVersion for MockVersion {
    fn apply(&self, preconfig: &mut Preconfig) -> synthloop::Result<()> {
        preconfig.insert(self.source.clone(), serde_json::json!(self.index));
        Ok(())
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn comment(&self) -> String {
        self.action.comment()
    }

    fn source_name(&self) -> String {
        self.source.clone()
    }

    fn source_description(&self) -> String {
        format!("mock {}", self.source)
    }
}

pub fn source_name(group: usize) -> String {
    format!("source{}", group + 1)
}

/// Versions for `histories`, named `source1`, `source2`, ... Timestamps run
/// through all of the first source's versions before the second's.
pub fn mock_versions(histories: &[Vec<Action>]) -> Vec<Vec<Rc<dyn SourceVersion>>> {
    let mut clock = 0;
    histories
        .iter()
        .enumerate()
        .map(|(group, history)| {
            history
                .iter()
                .enumerate()
                .map(|(index, action)| {
                    clock += 1;
                    Rc::new(MockVersion {
                        source: source_name(group),
                        index,
                        action: action.clone(),
                        timestamp: DateTime::from_timestamp(clock, 0).unwrap(),
                    }) as Rc<dyn SourceVersion>
                })
                .collect()
        })
        .collect()
}

/// Replays each source's history up to the applied version. Deterministic:
/// the output depends only on the preconfig.
pub struct MockSynthesizer {
    workdir: PathBuf,
    histories: Vec<Vec<Action>>,
    pub calls: RefCell<Vec<Vec<usize>>>,
}

impl MockSynthesizer {
    pub fn new(workdir: &Path, histories: &[Vec<Action>]) -> Self {
        MockSynthesizer {
            workdir: workdir.to_path_buf(),
            histories: histories.to_vec(),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// How many times the generator ran with exactly this snapshot.
    pub fn times_generated(&self, snapshot: &[usize]) -> usize {
        self.calls.borrow().iter().filter(|c| c.as_slice() == snapshot).count()
    }
}

impl Synthesizer for MockSynthesizer {
    fn synthesize(&self, _log_path: &Path, preconfig: &Preconfig) -> Result<String, SynthError> {
        let mut snapshot = Vec::new();
        let mut failed = false;
        for (group, history) in self.histories.iter().enumerate() {
            let index = preconfig
                .get(&source_name(group))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            snapshot.push(index);
            for action in &history[..=index] {
                if let Action::Write(path, content) = action {
                    let path = self.workdir.join(path);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, content)?;
                }
            }
            failed |= history[index] == Action::Failed;
        }
        self.calls.borrow_mut().push(snapshot);
        if failed {
            // A crashing generator leaves half-written output behind.
            fs::write(self.workdir.join("partial.txt"), "oops")?;
            return Err(SynthError::GeneratorFailed {
                code: Some(1),
                log: "mock failure".to_string(),
            });
        }
        Ok(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PrExists(String),
    Push {
        commit_count: usize,
        branch: String,
        title: String,
    },
    Labels(Vec<String>),
}

/// Records every call. `pr_exists` fails for `broken_branch`.
#[derive(Default)]
pub struct RecordingPusher {
    pub events: Rc<RefCell<Vec<Event>>>,
    pub existing: Vec<String>,
    pub broken_branch: Option<String>,
}

impl RecordingPusher {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn pushes(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Push { .. }))
            .collect()
    }
}

struct RecordedPullRequest {
    events: Rc<RefCell<Vec<Event>>>,
}

impl PullRequest for RecordedPullRequest {
    fn add_labels(&self, labels: &[String]) -> anyhow::Result<()> {
        self.events.borrow_mut().push(Event::Labels(labels.to_vec()));
        Ok(())
    }
}

impl ChangePusher for RecordingPusher {
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        _synth_log: &str,
    ) -> anyhow::Result<Box<dyn PullRequest>> {
        self.events.borrow_mut().push(Event::Push {
            commit_count,
            branch: branch.to_string(),
            title: pr_title.to_string(),
        });
        Ok(Box::new(RecordedPullRequest {
            events: Rc::clone(&self.events),
        }))
    }

    fn pr_exists(&self, branch: &str) -> anyhow::Result<bool> {
        self.events
            .borrow_mut()
            .push(Event::PrExists(branch.to_string()));
        if self.broken_branch.as_deref() == Some(branch) {
            anyhow::bail!("GitHub is down");
        }
        Ok(self.existing.iter().any(|b| b == branch))
    }
}

/// A repository with one commit (`README.md`) on branch [`BRANCH`], plus a
/// separate log directory.
pub struct Fixture {
    pub dir: TempDir,
    pub logs: TempDir,
    pub ws: GitWorkspace,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_files(&[])
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let ws = GitWorkspace::new(repo);
        ws.configure_identity("Test User", "test@example.com").unwrap();
        fs::write(dir.path().join("README.md"), "Well done.").unwrap();
        for (path, content) in files {
            fs::write(dir.path().join(path), content).unwrap();
        }
        synthloop::VersionControl::commit_all(&ws, "Added Readme").unwrap();
        ws.setup_branch(BRANCH).unwrap();
        Fixture {
            dir,
            logs: tempfile::tempdir().unwrap(),
            ws,
        }
    }

    pub fn toolbox(&self, histories: &[Vec<Action>]) -> Toolbox<'_> {
        Toolbox::new(
            &self.ws,
            mock_versions(histories),
            BRANCH,
            ToolboxSettings::new("synth.metadata", "").unwrap(),
            self.logs.path(),
        )
    }

    pub fn synthesizer(&self, histories: &[Vec<Action>]) -> MockSynthesizer {
        MockSynthesizer::new(self.dir.path(), histories)
    }

    /// Commit subjects on `branch`, oldest first, excluding the initial commit.
    pub fn subjects(&self, branch: &str) -> Vec<String> {
        let repo = self.ws.repo();
        let mut walker = repo.revwalk().unwrap();
        let oid = repo.revparse_single(branch).unwrap().id();
        walker.push(oid).unwrap();
        walker
            .set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
            .unwrap();
        walker
            .skip(1)
            .map(|oid| {
                let commit = repo.find_commit(oid.unwrap()).unwrap();
                commit.summary().unwrap_or("").to_string()
            })
            .collect()
    }

    pub fn read(&self, branch: &str, path: &str) -> Option<String> {
        synthloop::VersionControl::read_file(&self.ws, branch, Path::new(path))
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }
}
