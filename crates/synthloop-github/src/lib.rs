//! Publish synthloop branches as GitHub pull requests.
//!
//! [`GitHubChangePusher`] pushes a branch, then opens a pull request for it or
//! refreshes the body of the one already open. The body links back to the
//! source commits through the `Source-Link:` trailers written by git source
//! versions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use synthloop::{ChangePusher, PullRequest, VersionControl};
use tracing::{debug, info, warn};

pub const GITHUB_API: &str = "https://api.github.com";

/// Text in a pull request body that lets a reader request regeneration.
pub const REGENERATE_CHECKBOX_TEXT: &str =
    "- [x] To automatically regenerate this PR, check this box.";

const LOG_LENGTH_LIMIT: usize = 40000;
const TITLE_LENGTH_LIMIT: usize = 250;

// ============================================================================
// REST client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Serialize)]
struct NewPullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
    maintainer_can_modify: bool,
}

/// A thin client for the few GitHub REST endpoints synthloop needs.
pub struct GitHub {
    client: Client,
    token: String,
    api_url: String,
}

impl GitHub {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("synthloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(GitHub {
            client,
            token: token.into(),
            api_url: GITHUB_API.to_string(),
        })
    }

    /// Point the client at another API root, e.g. GitHub Enterprise.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/vnd.github.v3+json")
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().context("GitHub request failed")?;
        parse_response(response)
    }

    /// Open pull requests whose head is `owner:branch`.
    pub fn list_pull_requests(&self, repository: &str, head: &str) -> Result<Vec<PullRequestInfo>> {
        let request = self
            .request(Method::GET, &format!("/repos/{}/pulls", repository))
            .query(&[("state", "open"), ("head", head)]);
        self.send(request)
    }

    pub fn create_pull_request(
        &self,
        repository: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo> {
        let request = self
            .request(Method::POST, &format!("/repos/{}/pulls", repository))
            .json(&NewPullRequest {
                title,
                body,
                head: branch,
                base,
                maintainer_can_modify: true,
            });
        self.send(request)
    }

    pub fn update_pull_request_body(
        &self,
        repository: &str,
        number: u64,
        body: &str,
    ) -> Result<PullRequestInfo> {
        let request = self
            .request(Method::PATCH, &format!("/repos/{}/pulls/{}", repository, number))
            .json(&serde_json::json!({ "body": body }));
        self.send(request)
    }

    pub fn add_labels(&self, repository: &str, number: u64, labels: &[String]) -> Result<()> {
        let request = self
            .request(
                Method::POST,
                &format!("/repos/{}/issues/{}/labels", repository, number),
            )
            .json(&serde_json::json!({ "labels": labels }));
        let _: Vec<Label> = self.send(request)?;
        Ok(())
    }

    /// Every label defined in the repository.
    pub fn get_labels(&self, repository: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for page in 1u32.. {
            let page = page.to_string();
            let request = self
                .request(Method::GET, &format!("/repos/{}/labels", repository))
                .query(&[("per_page", "100"), ("page", page.as_str())]);
            let labels: Vec<Label> = self.send(request)?;
            if labels.is_empty() {
                break;
            }
            names.extend(labels.into_iter().map(|l| l.name));
        }
        Ok(names)
    }

    /// The `api: *` label matching a monorepo's synth path, if any.
    pub fn get_api_label(&self, repository: &str, synth_path: &str) -> Result<Option<String>> {
        if synth_path.is_empty() {
            return Ok(None);
        }
        Ok(match_api_label(&self.get_labels(repository)?, synth_path))
    }
}

fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let url = response.url().clone();
    let text = response.text().context("Failed to read GitHub response")?;
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(text);
        return Err(anyhow!("GitHub returned {} for {}: {}", status, url, message));
    }
    serde_json::from_str(&text).with_context(|| format!("Unexpected response from {}", url))
}

/// Pick the first label mentioning `api` that contains `synth_path`, ignoring
/// case and underscores in the path.
pub fn match_api_label(labels: &[String], synth_path: &str) -> Option<String> {
    let needle = synth_path.replace('_', "").to_lowercase();
    labels
        .iter()
        .filter(|label| label.contains("api"))
        .find(|label| label.contains(&needle))
        .cloned()
}

// ============================================================================
// Pull request body
// ============================================================================

/// Body for a regeneration pull request.
pub fn build_pr_body(synth_log: &str, trailers: &str) -> String {
    let mut log_text = String::new();
    if !synth_log.is_empty() {
        let log = truncate_log(synth_log);
        log_text = format!(
            "\n<details><summary>Log from Synthtool</summary>\n\n```\n{}\n```\n</details>",
            log
        );
    }
    let body = format!(
        "This PR was generated using Autosynth. :rainbow:\n\n{}\n\n{} (May take up to 24 hours.)\n\n{}\n",
        log_text,
        REGENERATE_CHECKBOX_TEXT.replace("[x]", "[ ]"),
        trailers
    );
    body.trim().to_string()
}

fn truncate_log(log: &str) -> String {
    let count = log.chars().count();
    if count <= LOG_LENGTH_LIMIT {
        return log.to_string();
    }
    let tail: String = log.chars().skip(count - LOG_LENGTH_LIMIT).collect();
    format!("[LOG TRUNCATED]\n{}", tail)
}

/// The `Source-Link:` and `PiperOrigin-RevId:` lines in commit message text.
pub fn parse_trailers(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let line = line.trim_start();
            line.starts_with("Source-Link:") || line.starts_with("PiperOrigin-RevId:")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_title(title: &str) -> String {
    title.chars().take(TITLE_LENGTH_LIMIT).collect()
}

// ============================================================================
// Change pusher
// ============================================================================

struct GitHubPullRequest {
    gh: Rc<GitHub>,
    repository: String,
    number: u64,
}

impl PullRequest for GitHubPullRequest {
    fn add_labels(&self, labels: &[String]) -> Result<()> {
        self.gh.add_labels(&self.repository, self.number, labels)
    }
}

/// Pushes branches to `origin` and opens pull requests against `base`.
pub struct GitHubChangePusher<'a> {
    gh: Rc<GitHub>,
    /// `owner/repo`.
    repository: String,
    base: String,
    synth_path: String,
    vcs: &'a dyn VersionControl,
    push_branch: Box<dyn Fn(&str) -> Result<()> + 'a>,
    existing: RefCell<HashMap<String, PullRequestInfo>>,
}

impl<'a> GitHubChangePusher<'a> {
    pub fn new(
        gh: GitHub,
        repository: impl Into<String>,
        vcs: &'a dyn VersionControl,
        push_branch: impl Fn(&str) -> Result<()> + 'a,
    ) -> Self {
        GitHubChangePusher {
            gh: Rc::new(gh),
            repository: repository.into(),
            base: "master".to_string(),
            synth_path: String::new(),
            vcs,
            push_branch: Box::new(push_branch),
            existing: RefCell::default(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Monorepo synth path; new pull requests get the matching `api:` label.
    pub fn with_synth_path(mut self, synth_path: impl Into<String>) -> Self {
        self.synth_path = synth_path.into();
        self
    }

    fn collect_trailers(&self, commit_count: usize) -> Result<String> {
        let messages = self.vcs.recent_commit_messages(commit_count)?;
        let bodies: Vec<&str> = messages
            .iter()
            .map(|m| m.split_once('\n').map(|(_, body)| body).unwrap_or(""))
            .collect();
        Ok(parse_trailers(&bodies.join("\n")))
    }

    fn owner(&self) -> &str {
        self.repository
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(&self.repository)
    }
}

impl ChangePusher for GitHubChangePusher<'_> {
    fn push_changes(
        &self,
        commit_count: usize,
        branch: &str,
        pr_title: &str,
        synth_log: &str,
    ) -> Result<Box<dyn PullRequest>> {
        (self.push_branch)(branch)?;
        let trailers = self.collect_trailers(commit_count)?;
        let body = build_pr_body(synth_log, &trailers);

        let existing = self.existing.borrow().get(branch).cloned();
        let pr = match existing {
            Some(pr) => {
                info!(url = %pr.html_url, "updating pull request");
                self.gh
                    .update_pull_request_body(&self.repository, pr.number, &body)?
            }
            None => {
                let pr = self.gh.create_pull_request(
                    &self.repository,
                    branch,
                    &self.base,
                    &truncate_title(pr_title),
                    &body,
                )?;
                info!(url = %pr.html_url, "opened pull request");
                match self.gh.get_api_label(&self.repository, &self.synth_path) {
                    Ok(Some(label)) => self.gh.add_labels(&self.repository, pr.number, &[label])?,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "could not look up api label"),
                }
                pr
            }
        };
        Ok(Box::new(GitHubPullRequest {
            gh: Rc::clone(&self.gh),
            repository: self.repository.clone(),
            number: pr.number,
        }))
    }

    fn pr_exists(&self, branch: &str) -> Result<bool> {
        let head = format!("{}:{}", self.owner(), branch);
        let prs = self.gh.list_pull_requests(&self.repository, &head)?;
        let Some(pr) = prs.into_iter().next() else {
            debug!(branch, "no open pull request");
            return Ok(false);
        };
        info!(url = %pr.html_url, "pull request already exists");
        let regenerate = requests_regeneration(&pr);
        self.existing.borrow_mut().insert(branch.to_string(), pr);
        if regenerate {
            info!(branch, "regeneration requested");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Whether someone ticked the regenerate checkbox in the pull request body.
pub fn requests_regeneration(pr: &PullRequestInfo) -> bool {
    pr.body
        .as_deref()
        .is_some_and(|body| body.contains(REGENERATE_CHECKBOX_TEXT))
}
