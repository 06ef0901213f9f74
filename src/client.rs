//! Blocking HTTP client for the blackbox API
//!
//! Used by the CLI subcommands and the git-hook automation. Every call
//! unwraps the `{ok, data, error}` envelope and turns non-2xx replies into
//! [`ClientError::Api`].

use crate::api::{
    ApiResponse, CreateSessionRequest, HealthStatus, ListParams, ResolveProjectRequest,
    ServiceInfo, UserRequest,
};
use crate::config::ClientConfig;
use crate::db::{
    CodeSnippet, Event, NewEvent, NewProject, NewRun, NewSnippet, Project, Run, RunUpdate,
    Session, User,
};
use crate::stats::Summary;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot connect to API at {url}: {message}")]
    Connection { url: String, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from API: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP status for API errors
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client bound to one API base URL
#[derive(Debug, Clone)]
pub struct BlackboxClient {
    base_url: String,
    agent: ureq::Agent,
}

impl BlackboxClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.api_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // === Health ===

    pub fn info(&self) -> Result<ServiceInfo> {
        self.get("/", &ListParams::default())
    }

    pub fn health(&self, full: bool) -> Result<HealthStatus> {
        let path = if full { "/health/full" } else { "/health" };
        self.get(path, &ListParams::default())
    }

    // === Users ===

    pub fn create_user(&self, username: &str) -> Result<User> {
        self.post("/users", &UserRequest { username: username.to_string() })
    }

    pub fn resolve_user(&self, username: &str) -> Result<User> {
        self.post("/users/resolve", &UserRequest { username: username.to_string() })
    }

    pub fn get_user(&self, id: i32) -> Result<User> {
        self.get(&format!("/users/{}", id), &ListParams::default())
    }

    pub fn list_users(&self, params: &ListParams) -> Result<Vec<User>> {
        self.get("/users", params)
    }

    // === Projects ===

    pub fn create_project(&self, project: &NewProject) -> Result<Project> {
        self.post("/projects", project)
    }

    pub fn resolve_project(&self, name: &str, owner_id: Option<i32>) -> Result<Project> {
        self.post(
            "/projects/resolve",
            &ResolveProjectRequest { name: name.to_string(), owner_id },
        )
    }

    pub fn get_project(&self, id: i32) -> Result<Project> {
        self.get(&format!("/projects/{}", id), &ListParams::default())
    }

    pub fn list_projects(&self, params: &ListParams) -> Result<Vec<Project>> {
        self.get("/projects", params)
    }

    // === Sessions ===

    pub fn start_session(&self, project_id: i32) -> Result<Session> {
        self.post("/sessions", &CreateSessionRequest { project_id })
    }

    pub fn get_session(&self, id: i32) -> Result<Session> {
        self.get(&format!("/sessions/{}", id), &ListParams::default())
    }

    pub fn list_sessions(&self, params: &ListParams) -> Result<Vec<Session>> {
        self.get("/sessions", params)
    }

    pub fn end_session(&self, id: i32) -> Result<Session> {
        let url = self.url(&format!("/sessions/{}/end", id));
        let result = self.agent.request("PATCH", &url).call();
        self.finish(&url, result)
    }

    // === Snippets ===

    pub fn create_snippet(&self, snippet: &NewSnippet) -> Result<CodeSnippet> {
        self.post("/snippets", snippet)
    }

    pub fn get_snippet(&self, id: i32) -> Result<CodeSnippet> {
        self.get(&format!("/snippets/{}", id), &ListParams::default())
    }

    pub fn list_snippets(&self, params: &ListParams) -> Result<Vec<CodeSnippet>> {
        self.get("/snippets", params)
    }

    // === Runs ===

    pub fn create_run(&self, run: &NewRun) -> Result<Run> {
        self.post("/runs", run)
    }

    pub fn get_run(&self, id: i32) -> Result<Run> {
        self.get(&format!("/runs/{}", id), &ListParams::default())
    }

    pub fn list_runs(&self, params: &ListParams) -> Result<Vec<Run>> {
        self.get("/runs", params)
    }

    pub fn update_run(&self, id: i32, update: &RunUpdate) -> Result<Run> {
        let url = self.url(&format!("/runs/{}", id));
        let result = self.agent.request("PATCH", &url).send_json(update);
        self.finish(&url, result)
    }

    // === Events ===

    pub fn log_event(&self, event: &NewEvent) -> Result<Event> {
        self.post("/events", event)
    }

    pub fn get_event(&self, id: i32) -> Result<Event> {
        self.get(&format!("/events/{}", id), &ListParams::default())
    }

    pub fn list_events(&self, params: &ListParams) -> Result<Vec<Event>> {
        self.get("/events", params)
    }

    // === Stats ===

    pub fn summary(&self) -> Result<Summary> {
        self.get("/stats/summary", &ListParams::default())
    }

    // === Transport ===

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, params: &ListParams) -> Result<T> {
        let url = self.url(path);
        let mut request = self.agent.get(&url);
        for (key, value) in params.to_pairs() {
            request = request.query(key, &value);
        }
        self.finish(&url, request.call())
    }

    fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let result = self.agent.post(&url).send_json(body);
        self.finish(&url, result)
    }

    fn finish<T: DeserializeOwned>(
        &self,
        url: &str,
        result: std::result::Result<ureq::Response, ureq::Error>,
    ) -> Result<T> {
        tracing::debug!(%url, "api request");
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let message = response
                    .into_json::<ApiResponse<serde_json::Value>>()
                    .ok()
                    .and_then(|envelope| envelope.error)
                    .unwrap_or_else(|| format!("HTTP {}", status));
                return Err(ClientError::Api { status, message });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(ClientError::Connection {
                    url: url.to_string(),
                    message: transport.to_string(),
                });
            }
        };

        let status = response.status();
        let envelope: ApiResponse<T> = response
            .into_json()
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        match (envelope.ok, envelope.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(ClientError::Api {
                status,
                message: envelope.error.unwrap_or_else(|| "empty response".to_string()),
            }),
        }
    }
}
