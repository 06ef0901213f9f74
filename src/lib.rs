//! Blackbox - a flight recorder for development activity
//!
//! Records users, projects, coding sessions, code snippets, runs of those
//! snippets, and free-form events, then answers with summary statistics.
//!
//! # Overview
//!
//! The core is [`Database`], an explicitly passed handle over a pooled SQLite
//! store. Every create validates its foreign keys inside one write
//! transaction, `resolve_*` performs race-free find-or-create by natural key,
//! and [`Database::summary`] aggregates from a single snapshot.
//!
//! | Entity | Parent | Notes |
//! |--------|--------|-------|
//! | `User` | - | unique `username` |
//! | `Project` | `User` (optional owner) | unique `(name, owner)` |
//! | `Session` | `Project` | `end_session` is idempotent |
//! | `CodeSnippet` | `Project` | language defaults to `python` |
//! | `Run` | `Session`, `CodeSnippet` (optional) | status starts `pending` |
//! | `Event` | `Project`, `Run` (optional) | metadata stored verbatim |
//!
//! # Quick Start
//!
//! ```no_run
//! use blackbox::{Database, RunStatus};
//! use blackbox::db::NewRun;
//!
//! let db = Database::open_at(".blackbox/blackbox.db").unwrap();
//!
//! // Hooks resolve instead of create: repeated calls return the same rows
//! let user = db.resolve_user("alice").unwrap();
//! let project = db.resolve_project("my-repo", Some(user.id)).unwrap();
//!
//! let session = db.create_session(project.id).unwrap();
//! db.create_run(&NewRun { session_id: session.id, snippet_id: None }).unwrap();
//!
//! let summary = db.summary().unwrap();
//! println!("Runs: {}, pending: {}", summary.total_runs, summary.runs_with(RunStatus::Pending));
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod hooks;
pub mod resolve;
pub mod schema;
pub mod serve;
pub mod stats;
pub mod types;

pub use api::{ApiResponse, ListParams};
pub use client::{BlackboxClient, ClientError};
pub use config::{Config, IgnoredOverride};
pub use db::{
    CodeSnippet, Database, DbError, Event, NewEvent, NewProject, NewRun, NewSnippet, Project, Run,
    RunUpdate, Session, User,
};
pub use serve::{route, ApiServer};
pub use stats::Summary;
pub use types::{EventType, Page, PageError, RunStatus};
