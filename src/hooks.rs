//! Git hook automation
//!
//! `auto-commit` and `auto-event` are called from git hooks. They resolve the
//! git user and the project through the API, then log one event. Nothing here
//! may fail a commit: every error is logged at debug level and dropped.

use crate::client::BlackboxClient;
use crate::db::{Event, NewEvent};
use crate::types::EventType;
use std::fs;
use std::path::{Path, PathBuf};

/// Username recorded when git has no `user.name`
pub const UNKNOWN_GIT_USER: &str = "unknown";

/// First line after the shebang of every script we install
const HOOK_MARKER: &str = "# blackbox-hook";

/// One event to ingest from a hook
#[derive(Debug, Clone, PartialEq)]
pub struct AutoEvent {
    pub project: String,
    pub event_type: String,
    pub message: String,
    pub commit_hash: Option<String>,
    pub git_user: Option<String>,
}

impl AutoEvent {
    /// A commit: logged as `info` with message `Commit: <msg>`
    pub fn commit(
        project: &str,
        message: &str,
        commit_hash: Option<String>,
        git_user: Option<String>,
    ) -> Self {
        Self {
            project: project.to_string(),
            event_type: EventType::Info.to_string(),
            message: format!("Commit: {}", message),
            commit_hash,
            git_user,
        }
    }

    pub fn event(project: &str, event_type: &str, message: &str, git_user: Option<String>) -> Self {
        Self {
            project: project.to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            commit_hash: None,
            git_user,
        }
    }

    pub fn git_user(&self) -> &str {
        match self.git_user.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => user,
            _ => UNKNOWN_GIT_USER,
        }
    }

    /// `{"commit_hash": ..., "git_user": ...}`, omitting an absent hash
    pub fn metadata_json(&self) -> String {
        let mut metadata = serde_json::Map::new();
        if let Some(hash) = &self.commit_hash {
            metadata.insert("commit_hash".into(), hash.clone().into());
        }
        metadata.insert("git_user".into(), self.git_user().into());
        serde_json::Value::Object(metadata).to_string()
    }
}

/// Ingest one hook event. Returns the logged event, or `None` if any step failed.
pub fn auto_log(client: &BlackboxClient, auto: &AutoEvent) -> Option<Event> {
    let event_type: EventType = match auto.event_type.parse() {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(error = %e, "auto-log skipped");
            return None;
        }
    };

    // A missing owner still lets the event land on an ownerless project
    let owner_id = match client.resolve_user(auto.git_user()) {
        Ok(user) => Some(user.id),
        Err(e) => {
            tracing::debug!(error = %e, user = auto.git_user(), "could not resolve git user");
            None
        }
    };

    let project = match client.resolve_project(&auto.project, owner_id) {
        Ok(project) => project,
        Err(e) => {
            tracing::debug!(error = %e, project = %auto.project, "could not resolve project");
            return None;
        }
    };

    let new_event = NewEvent {
        project_id: project.id,
        run_id: None,
        event_type,
        message: Some(auto.message.clone()),
        metadata_json: Some(auto.metadata_json()),
    };
    match client.log_event(&new_event) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "could not log event");
            None
        }
    }
}

// ============================================================================
// Hook installation
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0} is not a git repository (no .git directory)")]
    NotARepo(PathBuf),

    #[error("Failed to write hook: {0}")]
    Io(#[from] std::io::Error),
}

/// What `install_hooks` did per script
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstallReport {
    pub installed: Vec<PathBuf>,
    /// Existing hooks not written by blackbox, left untouched
    pub skipped: Vec<PathBuf>,
}

/// Write `post-commit` and `post-checkout` into `<repo>/.git/hooks`
///
/// `binary` is the command the scripts invoke. Hooks carrying our marker are
/// always rewritten; other existing hooks only with `force`.
pub fn install_hooks(repo: &Path, binary: &str, force: bool) -> Result<InstallReport, HookError> {
    let git_dir = repo.join(".git");
    if !git_dir.is_dir() {
        return Err(HookError::NotARepo(repo.to_path_buf()));
    }
    let hooks_dir = git_dir.join("hooks");
    fs::create_dir_all(&hooks_dir)?;

    let mut report = InstallReport::default();
    for (name, script) in [
        ("post-commit", post_commit_script(binary)),
        ("post-checkout", post_checkout_script(binary)),
    ] {
        let path = hooks_dir.join(name);
        if path.exists() && !force && !is_blackbox_hook(&path) {
            tracing::debug!(path = %path.display(), "leaving foreign hook in place");
            report.skipped.push(path);
            continue;
        }
        fs::write(&path, script)?;
        make_executable(&path)?;
        report.installed.push(path);
    }
    Ok(report)
}

fn is_blackbox_hook(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|contents| contents.contains(HOOK_MARKER))
        .unwrap_or(false)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn post_commit_script(binary: &str) -> String {
    format!(
        r#"#!/bin/sh
{marker}: log each commit to the blackbox API
PROJECT=$(basename "$(git rev-parse --show-toplevel)")
HASH=$(git rev-parse HEAD)
MESSAGE=$(git log -1 --pretty=%s)
GIT_USER=$(git config user.name || echo {unknown})
{bin} auto-commit --project "$PROJECT" --message "$MESSAGE" --commit-hash "$HASH" --git-user "$GIT_USER" >/dev/null 2>&1 || true
"#,
        marker = HOOK_MARKER,
        unknown = UNKNOWN_GIT_USER,
        bin = shell_quote(binary),
    )
}

fn post_checkout_script(binary: &str) -> String {
    format!(
        r#"#!/bin/sh
{marker}: log branch checkouts to the blackbox API
# $3 is 1 for a branch checkout, 0 for a file checkout
[ "$3" = "1" ] || exit 0
PROJECT=$(basename "$(git rev-parse --show-toplevel)")
BRANCH=$(git rev-parse --abbrev-ref HEAD)
GIT_USER=$(git config user.name || echo {unknown})
{bin} auto-event --project "$PROJECT" --type info --message "Checkout: $BRANCH" --git-user "$GIT_USER" >/dev/null 2>&1 || true
"#,
        marker = HOOK_MARKER,
        unknown = UNKNOWN_GIT_USER,
        bin = shell_quote(binary),
    )
}
