//! GitHub Actions implementation of [`CiSystem`].
//!
//! A dispatch is a `workflow_dispatch` event carrying the request id. GitHub
//! does not return the run it creates, so the run is then located by listing
//! recent dispatch runs of the workflow and matching on the request id in the
//! run title. The workflow must put the `request_id` input in its `run-name`;
//! runs without it are never claimed, so concurrent dispatches cannot pick up
//! each other's runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::models::ArtifactId;
use octocrab::params::actions::ArchiveFormat;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{Artifact, CiSystem, DispatchRequest, RunHandle, RunState, RunStatus};
use crate::error::{ChannelError, ConfigurationError, DispatchError};

/// Default branch the workflow is dispatched on.
pub const DEFAULT_BRANCH: &str = "main";

/// Default workflow file name.
pub const DEFAULT_WORKFLOW: &str = "test-execution.yml";

/// Split an `owner/repo` reference.
pub fn parse_repository(repository: &str) -> Result<(String, String), ConfigurationError> {
    let invalid = || ConfigurationError::InvalidRepository(repository.to_string());
    let (owner, repo) = repository.trim().split_once('/').ok_or_else(invalid)?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(invalid());
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Minimal view of a workflow run as returned by the REST API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowRunRecord {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRunRecord>,
}

#[derive(Debug, Deserialize)]
struct ArtifactRecord {
    id: u64,
    name: String,
    #[serde(default)]
    expired: bool,
}

#[derive(Debug, Deserialize)]
struct ArtifactPage {
    #[serde(default)]
    artifacts: Vec<ArtifactRecord>,
}

#[derive(Debug, Serialize)]
struct RunQuery<'a> {
    event: &'a str,
    branch: &'a str,
    per_page: u8,
}

/// Pick the run a dispatch created: the one whose title or name mentions the
/// request id. The newest wins if a re-run produced several.
pub fn select_run<'a>(
    runs: &'a [WorkflowRunRecord],
    request_id: &str,
) -> Option<&'a WorkflowRunRecord> {
    let mentions = |text: &Option<String>| {
        text.as_deref()
            .map(|t| t.contains(request_id))
            .unwrap_or(false)
    };
    runs.iter()
        .filter(|run| mentions(&run.display_title) || mentions(&run.name))
        .max_by_key(|run| run.created_at)
}

/// GitHub Actions client.
pub struct GitHubActions {
    client: Octocrab,
    owner: String,
    repo: String,
    branch: String,
    workflow: String,
    lookup_attempts: u32,
    lookup_interval: Duration,
}

impl GitHubActions {
    /// Create a client for `owner/repo` authenticated with a personal token.
    pub fn new(repository: &str, token: &str) -> Result<Self, ConfigurationError> {
        let (owner, repo) = parse_repository(repository)?;
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .map_err(|e| ConfigurationError::Client(e.to_string()))?;

        Ok(Self {
            client,
            owner,
            repo,
            branch: DEFAULT_BRANCH.to_string(),
            workflow: DEFAULT_WORKFLOW.to_string(),
            lookup_attempts: 10,
            lookup_interval: Duration::from_secs(2),
        })
    }

    /// Sets the branch runs are dispatched on.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Sets the workflow file name.
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    /// Sets how hard to look for the run after dispatching.
    pub fn with_run_lookup(mut self, attempts: u32, interval: Duration) -> Self {
        self.lookup_attempts = attempts.max(1);
        self.lookup_interval = interval;
        self
    }

    fn run_url(&self, run: &RunHandle) -> String {
        format!(
            "/repos/{}/{}/actions/runs/{}",
            self.owner, self.repo, run.run_id
        )
    }

    async fn recent_dispatch_runs(&self) -> Result<Vec<WorkflowRunRecord>, octocrab::Error> {
        let route = format!(
            "/repos/{}/{}/actions/workflows/{}/runs",
            self.owner, self.repo, self.workflow
        );
        let query = RunQuery {
            event: "workflow_dispatch",
            branch: &self.branch,
            per_page: 20,
        };
        let page: WorkflowRunPage = self.client.get(route, Some(&query)).await?;
        Ok(page.workflow_runs)
    }
}

#[async_trait]
impl CiSystem for GitHubActions {
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn dispatch_workflow(&self, request: &DispatchRequest) -> Result<RunHandle, DispatchError> {
        let inputs = serde_json::json!({
            "request_id": request.request_id.as_str(),
            "subject_id": request.subject_id.as_str(),
            "test_case_ids": request.test_case_ids.join(","),
            "callback_url": request.callback_url.clone().unwrap_or_default(),
        });

        self.client
            .actions()
            .create_workflow_dispatch(&self.owner, &self.repo, &self.workflow, &self.branch)
            .inputs(inputs)
            .send()
            .await
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        info!(workflow = %self.workflow, branch = %self.branch, "workflow dispatched");

        let mut last_error = None;
        for attempt in 1..=self.lookup_attempts {
            tokio::time::sleep(self.lookup_interval).await;
            match self.recent_dispatch_runs().await {
                Ok(runs) => {
                    if let Some(run) = select_run(&runs, request.request_id.as_str()) {
                        debug!(run_id = run.id, attempt, "located dispatched run");
                        return Ok(RunHandle {
                            run_id: run.id,
                            html_url: run.html_url.clone(),
                        });
                    }
                    debug!(attempt, candidates = runs.len(), "dispatched run not visible yet");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "failed to list workflow runs");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(match last_error {
            Some(message) if self.lookup_attempts == 1 => DispatchError::Api(message),
            _ => DispatchError::RunNotFound {
                request_id: request.request_id.clone(),
                attempts: self.lookup_attempts,
            },
        })
    }

    async fn run_status(&self, run: &RunHandle) -> Result<RunStatus, ChannelError> {
        let record: WorkflowRunRecord = self
            .client
            .get(self.run_url(run), None::<&()>)
            .await
            .map_err(ChannelError::transport)?;
        Ok(RunStatus {
            state: RunState::from_label(record.status.as_deref().unwrap_or_default()),
            conclusion: record.conclusion,
        })
    }

    async fn run_artifacts(&self, run: &RunHandle) -> Result<Vec<Artifact>, ChannelError> {
        let page: ArtifactPage = self
            .client
            .get(format!("{}/artifacts", self.run_url(run)), None::<&()>)
            .await
            .map_err(ChannelError::transport)?;

        let mut artifacts = Vec::new();
        for record in page.artifacts.into_iter().filter(|a| !a.expired) {
            let data = self
                .client
                .actions()
                .download_artifact(
                    &self.owner,
                    &self.repo,
                    ArtifactId(record.id),
                    ArchiveFormat::Zip,
                )
                .await
                .map_err(ChannelError::transport)?;
            debug!(artifact = %record.name, bytes = data.len(), "downloaded artifact");
            artifacts.push(Artifact::new(record.name, data.to_vec()));
        }
        Ok(artifacts)
    }
}
