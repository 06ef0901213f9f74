//! SQLite database with Diesel ORM
//!
//! Stores users, projects, sessions, code snippets, runs and events.
//! Every write runs inside an IMMEDIATE transaction so foreign-key checks,
//! the insert and the read-back observe one consistent state.

use crate::config::DatabaseConfig;
use crate::schema::*;
use crate::types::{EventType, Page, PageError, RunStatus, MAX_PAGE_LIMIT};
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current UTC time as an RFC 3339 string (microsecond precision)
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DbError::Validation(format!("{} is not an RFC 3339 timestamp: {}", field, e)))
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Queryable user
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUserRow<'a> {
    username: &'a str,
    created_at: &'a str,
}

/// Queryable project
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Option<i32>,
}

/// Fields for creating a project
#[derive(Insertable, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = projects)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner_id: Option<i32>,
}

/// Queryable session
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = sessions)]
pub struct Session {
    pub id: i32,
    pub project_id: i32,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Insertable)]
#[diesel(table_name = sessions)]
struct NewSessionRow<'a> {
    project_id: i32,
    started_at: &'a str,
}

/// Queryable code snippet
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = code_snippets)]
pub struct CodeSnippet {
    pub id: i32,
    pub project_id: i32,
    pub filename: Option<String>,
    pub language: String,
    pub code: String,
    pub created_at: String,
}

/// Language recorded when a snippet doesn't name one
pub const DEFAULT_LANGUAGE: &str = "python";

/// Fields for creating a code snippet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSnippet {
    pub project_id: i32,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub code: String,
}

#[derive(Insertable)]
#[diesel(table_name = code_snippets)]
struct NewSnippetRow<'a> {
    project_id: i32,
    filename: Option<&'a str>,
    language: &'a str,
    code: &'a str,
    created_at: &'a str,
}

/// Queryable run
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = runs)]
pub struct Run {
    pub id: i32,
    pub session_id: i32,
    pub snippet_id: Option<i32>,
    pub status: RunStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration: Option<f64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_value: Option<String>,
}

/// Fields for creating a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub session_id: i32,
    #[serde(default)]
    pub snippet_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = runs)]
struct NewRunRow<'a> {
    session_id: i32,
    snippet_id: Option<i32>,
    status: RunStatus,
    started_at: &'a str,
}

/// Partial update of a run. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub return_value: Option<String>,
}

impl RunUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.ended_at.is_none()
            && self.duration.is_none()
            && self.stdout.is_none()
            && self.stderr.is_none()
            && self.return_value.is_none()
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = runs)]
struct RunChanges<'a> {
    status: Option<RunStatus>,
    started_at: Option<&'a str>,
    ended_at: Option<&'a str>,
    duration: Option<f64>,
    stdout: Option<&'a str>,
    stderr: Option<&'a str>,
    return_value: Option<&'a str>,
}

impl<'a> From<&'a RunUpdate> for RunChanges<'a> {
    fn from(update: &'a RunUpdate) -> Self {
        Self {
            status: update.status,
            started_at: update.started_at.as_deref(),
            ended_at: update.ended_at.as_deref(),
            duration: update.duration,
            stdout: update.stdout.as_deref(),
            stderr: update.stderr.as_deref(),
            return_value: update.return_value.as_deref(),
        }
    }
}

/// Queryable event
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: i32,
    pub timestamp: String,
    pub project_id: i32,
    pub run_id: Option<i32>,
    pub event_type: EventType,
    pub message: Option<String>,
    pub metadata_json: Option<String>,
}

/// Fields for logging an event. `metadata_json` is stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub project_id: i32,
    #[serde(default)]
    pub run_id: Option<i32>,
    pub event_type: EventType,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata_json: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = events)]
struct NewEventRow<'a> {
    timestamp: &'a str,
    project_id: i32,
    run_id: Option<i32>,
    event_type: EventType,
    message: Option<&'a str>,
    metadata_json: Option<&'a str>,
}

// ============================================================================
// List Filters
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub owner_id: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project_id: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct SnippetFilter {
    pub project_id: Option<i32>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub session_id: Option<i32>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<i32>,
    pub run_id: Option<i32>,
    pub event_type: Option<EventType>,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The record itself, or a record it references, does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },

    /// A uniqueness constraint or state invariant was violated
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[source] diesel::result::Error),
}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DbError::Conflict(info.message().to_string())
            }
            other => DbError::Query(other),
        }
    }
}

impl From<PageError> for DbError {
    fn from(e: PageError) -> Self {
        DbError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Per-connection pragmas applied whenever the pool hands out a connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Database {
    /// Open the database described by the `[database]` config section
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = &config.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Connection(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.get_conn()?
            .batch_execute("PRAGMA journal_mode = WAL;")?;
        db.init_schema()?;
        tracing::debug!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// Open database at specified path with default pool settings
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: path.as_ref().to_path_buf(),
            ..DatabaseConfig::default()
        })
    }

    /// Fresh private in-memory database
    ///
    /// Uses a single pooled connection that is never recycled, since every
    /// new SQLite connection to `:memory:` would see an empty database.
    pub fn in_memory() -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: DatabaseConfig::default().busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    /// Run `f` on a pooled connection without a transaction
    fn read<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut conn = self.get_conn()?;
        f(&mut *conn)
    }

    /// Run `f` inside an IMMEDIATE transaction (takes the write lock up front)
    fn write<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut conn = self.get_conn()?;
        conn.immediate_transaction(f)
    }

    /// Run `f` inside a deferred transaction: all reads see one snapshot
    pub(crate) fn snapshot<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut pooled = self.get_conn()?;
        let conn: &mut SqliteConnection = &mut pooled;
        conn.transaction(f)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                owner_id INTEGER,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                project_id INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                FOREIGN KEY (project_id) REFERENCES projects(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS code_snippets (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                project_id INTEGER NOT NULL,
                filename TEXT,
                language TEXT NOT NULL DEFAULT 'python',
                code TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                session_id INTEGER NOT NULL,
                snippet_id INTEGER,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'success', 'failed')),
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration REAL,
                stdout TEXT,
                stderr TEXT,
                return_value TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(id),
                FOREIGN KEY (snippet_id) REFERENCES code_snippets(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                timestamp TEXT NOT NULL,
                project_id INTEGER NOT NULL,
                run_id INTEGER,
                event_type TEXT NOT NULL
                    CHECK (event_type IN ('info', 'warning', 'error', 'run', 'metric')),
                message TEXT,
                metadata_json TEXT,
                FOREIGN KEY (project_id) REFERENCES projects(id),
                FOREIGN KEY (run_id) REFERENCES runs(id)
            )
        "#).execute(&mut conn)?;

        // A missing owner is its own key (ids start at 1)
        diesel::sql_query("CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_name_owner ON projects(name, IFNULL(owner_id, 0))").execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_snippets_project ON code_snippets(project_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_snippets_language ON code_snippets(language)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_runs_snippet ON runs(snippet_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)").execute(&mut conn)?;

        Ok(())
    }

    /// Storage health probe
    pub fn ping(&self) -> Result<()> {
        self.read(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user. Usernames are unique; a duplicate is a `Conflict`.
    pub fn create_user(&self, username: &str) -> Result<User> {
        let username = require_text("username", username)?;
        let now = now_timestamp();

        self.write(|conn| {
            diesel::insert_into(users::table)
                .values(&NewUserRow {
                    username,
                    created_at: &now,
                })
                .execute(conn)
                .map_err(|e| match DbError::from(e) {
                    DbError::Conflict(_) => {
                        DbError::Conflict(format!("user '{}' already exists", username))
                    }
                    other => other,
                })?;
            let id = last_insert_id(conn)?;
            fetch_user(conn, id)
        })
    }

    pub fn get_user(&self, id: i32) -> Result<User> {
        self.read(|conn| fetch_user(conn, id))
    }

    pub fn list_users(&self, page: Page) -> Result<Vec<User>> {
        self.read(|conn| {
            Ok(users::table
                .order(users::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<User>(conn)?)
        })
    }

    /// Look up a user by its natural key
    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let username = username.trim();
        self.read(|conn| {
            Ok(users::table
                .filter(users::username.eq(username))
                .first::<User>(conn)
                .optional()?)
        })
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Create a project. `(name, owner_id)` is unique; a duplicate is a `Conflict`.
    pub fn create_project(&self, project: &NewProject) -> Result<Project> {
        let name = require_text("project name", &project.name)?;
        let row = NewProject {
            name: name.to_string(),
            description: project.description.clone(),
            owner_id: project.owner_id,
        };

        self.write(|conn| {
            if let Some(owner_id) = row.owner_id {
                require_user(conn, owner_id)?;
            }
            diesel::insert_into(projects::table)
                .values(&row)
                .execute(conn)
                .map_err(|e| match DbError::from(e) {
                    DbError::Conflict(_) => DbError::Conflict(format!(
                        "project '{}' already exists for {}",
                        row.name,
                        owner_label(row.owner_id)
                    )),
                    other => other,
                })?;
            let id = last_insert_id(conn)?;
            fetch_project(conn, id)
        })
    }

    pub fn get_project(&self, id: i32) -> Result<Project> {
        self.read(|conn| fetch_project(conn, id))
    }

    pub fn list_projects(&self, filter: &ProjectFilter, page: Page) -> Result<Vec<Project>> {
        self.read(|conn| {
            let mut query = projects::table.into_boxed();
            if let Some(owner_id) = filter.owner_id {
                query = query.filter(projects::owner_id.eq(owner_id));
            }
            Ok(query
                .order(projects::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<Project>(conn)?)
        })
    }

    /// Look up a project by its natural key `(name, owner_id)`
    pub fn find_project(&self, name: &str, owner_id: Option<i32>) -> Result<Option<Project>> {
        let name = name.trim();
        self.read(|conn| {
            let mut query = projects::table
                .filter(projects::name.eq(name))
                .into_boxed();
            query = match owner_id {
                Some(owner_id) => query.filter(projects::owner_id.eq(owner_id)),
                None => query.filter(projects::owner_id.is_null()),
            };
            Ok(query.first::<Project>(conn).optional()?)
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn create_session(&self, project_id: i32) -> Result<Session> {
        let now = now_timestamp();
        self.write(|conn| {
            require_project(conn, project_id)?;
            diesel::insert_into(sessions::table)
                .values(&NewSessionRow {
                    project_id,
                    started_at: &now,
                })
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            fetch_session(conn, id)
        })
    }

    pub fn get_session(&self, id: i32) -> Result<Session> {
        self.read(|conn| fetch_session(conn, id))
    }

    pub fn list_sessions(&self, filter: &SessionFilter, page: Page) -> Result<Vec<Session>> {
        self.read(|conn| {
            let mut query = sessions::table.into_boxed();
            if let Some(project_id) = filter.project_id {
                query = query.filter(sessions::project_id.eq(project_id));
            }
            Ok(query
                .order(sessions::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<Session>(conn)?)
        })
    }

    /// End a session
    ///
    /// Ending an already-ended session is a no-op that returns the stored
    /// record, so `ended_at` never changes once set.
    pub fn end_session(&self, id: i32) -> Result<Session> {
        self.write(|conn| {
            let session = fetch_session(conn, id)?;
            if session.is_ended() {
                return Ok(session);
            }

            // ended_at must never precede started_at, even under clock skew
            let now = Utc::now();
            let ended = match parse_timestamp("started_at", &session.started_at) {
                Ok(started) if started > now => started,
                _ => now,
            };

            diesel::update(sessions::table.find(id))
                .set(sessions::ended_at.eq(Some(format_timestamp(ended))))
                .execute(conn)?;
            fetch_session(conn, id)
        })
    }

    // ========================================================================
    // Code Snippets
    // ========================================================================

    pub fn create_snippet(&self, snippet: &NewSnippet) -> Result<CodeSnippet> {
        let language = snippet
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LANGUAGE);
        let now = now_timestamp();

        self.write(|conn| {
            require_project(conn, snippet.project_id)?;
            diesel::insert_into(code_snippets::table)
                .values(&NewSnippetRow {
                    project_id: snippet.project_id,
                    filename: snippet.filename.as_deref(),
                    language,
                    code: &snippet.code,
                    created_at: &now,
                })
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            fetch_snippet(conn, id)
        })
    }

    pub fn get_snippet(&self, id: i32) -> Result<CodeSnippet> {
        self.read(|conn| fetch_snippet(conn, id))
    }

    pub fn list_snippets(&self, filter: &SnippetFilter, page: Page) -> Result<Vec<CodeSnippet>> {
        self.read(|conn| {
            let mut query = code_snippets::table.into_boxed();
            if let Some(project_id) = filter.project_id {
                query = query.filter(code_snippets::project_id.eq(project_id));
            }
            if let Some(language) = &filter.language {
                query = query.filter(code_snippets::language.eq(language.clone()));
            }
            Ok(query
                .order(code_snippets::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<CodeSnippet>(conn)?)
        })
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Create a run in `pending` state, started now
    pub fn create_run(&self, run: &NewRun) -> Result<Run> {
        let now = now_timestamp();
        self.write(|conn| {
            require_session(conn, run.session_id)?;
            if let Some(snippet_id) = run.snippet_id {
                require_snippet(conn, snippet_id)?;
            }
            diesel::insert_into(runs::table)
                .values(&NewRunRow {
                    session_id: run.session_id,
                    snippet_id: run.snippet_id,
                    status: RunStatus::Pending,
                    started_at: &now,
                })
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            fetch_run(conn, id)
        })
    }

    pub fn get_run(&self, id: i32) -> Result<Run> {
        self.read(|conn| fetch_run(conn, id))
    }

    pub fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<Run>> {
        self.read(|conn| {
            let mut query = runs::table.into_boxed();
            if let Some(session_id) = filter.session_id {
                query = query.filter(runs::session_id.eq(session_id));
            }
            if let Some(status) = filter.status {
                query = query.filter(runs::status.eq(status));
            }
            Ok(query
                .order(runs::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<Run>(conn)?)
        })
    }

    /// Apply a partial update to a run
    ///
    /// Status transitions are not policed; any status may follow any other.
    pub fn update_run(&self, id: i32, update: &RunUpdate) -> Result<Run> {
        if let Some(duration) = update.duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(DbError::Validation(format!(
                    "duration must be a non-negative number of seconds (got {})",
                    duration
                )));
            }
        }

        self.write(|conn| {
            let run = fetch_run(conn, id)?;
            if update.is_empty() {
                return Ok(run);
            }

            let started_at = update.started_at.as_deref().unwrap_or(run.started_at.as_str());
            let started = parse_timestamp("started_at", started_at)?;
            if let Some(ended_at) = update.ended_at.as_deref().or(run.ended_at.as_deref()) {
                let ended = parse_timestamp("ended_at", ended_at)?;
                if ended < started {
                    return Err(DbError::Validation(format!(
                        "ended_at ({}) precedes started_at ({})",
                        ended_at, started_at
                    )));
                }
            }

            diesel::update(runs::table.find(id))
                .set(&RunChanges::from(update))
                .execute(conn)?;
            fetch_run(conn, id)
        })
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn create_event(&self, event: &NewEvent) -> Result<Event> {
        let now = now_timestamp();
        self.write(|conn| {
            require_project(conn, event.project_id)?;
            if let Some(run_id) = event.run_id {
                require_run(conn, run_id)?;
            }
            diesel::insert_into(events::table)
                .values(&NewEventRow {
                    timestamp: &now,
                    project_id: event.project_id,
                    run_id: event.run_id,
                    event_type: event.event_type,
                    message: event.message.as_deref(),
                    metadata_json: event.metadata_json.as_deref(),
                })
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            fetch_event(conn, id)
        })
    }

    pub fn get_event(&self, id: i32) -> Result<Event> {
        self.read(|conn| fetch_event(conn, id))
    }

    pub fn list_events(&self, filter: &EventFilter, page: Page) -> Result<Vec<Event>> {
        self.read(|conn| {
            let mut query = events::table.into_boxed();
            if let Some(project_id) = filter.project_id {
                query = query.filter(events::project_id.eq(project_id));
            }
            if let Some(run_id) = filter.run_id {
                query = query.filter(events::run_id.eq(run_id));
            }
            if let Some(event_type) = filter.event_type {
                query = query.filter(events::event_type.eq(event_type));
            }
            Ok(query
                .order(events::id.asc())
                .offset(offset(page))
                .limit(limit(page))
                .load::<Event>(conn)?)
        })
    }
}

// ============================================================================
// Row helpers (run on an already-acquired connection)
// ============================================================================

fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DbError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

/// OFFSET for a list query
fn offset(page: Page) -> i64 {
    page.skip().max(0)
}

/// LIMIT for a list query. SQLite reads a negative LIMIT as unbounded, so the
/// cap is applied here as well as in `Page::new`.
fn limit(page: Page) -> i64 {
    page.limit().clamp(1, MAX_PAGE_LIMIT)
}

fn owner_label(owner_id: Option<i32>) -> String {
    match owner_id {
        Some(id) => format!("owner {}", id),
        None => "no owner".to_string(),
    }
}

fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32> {
    let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)?;
    Ok(id)
}

fn require(found: bool, entity: &'static str, id: i32) -> Result<()> {
    if found {
        Ok(())
    } else {
        Err(DbError::NotFound { entity, id })
    }
}

fn require_user(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let found = diesel::select(diesel::dsl::exists(users::table.find(id))).get_result(conn)?;
    require(found, "User", id)
}

fn require_project(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let found = diesel::select(diesel::dsl::exists(projects::table.find(id))).get_result(conn)?;
    require(found, "Project", id)
}

fn require_session(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let found = diesel::select(diesel::dsl::exists(sessions::table.find(id))).get_result(conn)?;
    require(found, "Session", id)
}

fn require_snippet(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let found = diesel::select(diesel::dsl::exists(code_snippets::table.find(id))).get_result(conn)?;
    require(found, "Snippet", id)
}

fn require_run(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let found = diesel::select(diesel::dsl::exists(runs::table.find(id))).get_result(conn)?;
    require(found, "Run", id)
}

fn fetch_user(conn: &mut SqliteConnection, id: i32) -> Result<User> {
    users::table
        .find(id)
        .first::<User>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "User", id })
}

fn fetch_project(conn: &mut SqliteConnection, id: i32) -> Result<Project> {
    projects::table
        .find(id)
        .first::<Project>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "Project", id })
}

fn fetch_session(conn: &mut SqliteConnection, id: i32) -> Result<Session> {
    sessions::table
        .find(id)
        .first::<Session>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "Session", id })
}

fn fetch_snippet(conn: &mut SqliteConnection, id: i32) -> Result<CodeSnippet> {
    code_snippets::table
        .find(id)
        .first::<CodeSnippet>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "Snippet", id })
}

fn fetch_run(conn: &mut SqliteConnection, id: i32) -> Result<Run> {
    runs::table
        .find(id)
        .first::<Run>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "Run", id })
}

fn fetch_event(conn: &mut SqliteConnection, id: i32) -> Result<Event> {
    events::table
        .find(id)
        .first::<Event>(conn)
        .optional()?
        .ok_or(DbError::NotFound { entity: "Event", id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn db() -> Database {
        Database::in_memory().unwrap()
    }

    /// user -> project -> session, returning (project_id, session_id)
    fn seed(db: &Database) -> (i32, i32) {
        let user = db.create_user("alice").unwrap();
        let project = db
            .create_project(&NewProject {
                name: "P".to_string(),
                description: None,
                owner_id: Some(user.id),
            })
            .unwrap();
        let session = db.create_session(project.id).unwrap();
        (project.id, session.id)
    }

    // === Create / Get ===

    #[test]
    fn test_create_and_get_user() {
        let db = db();
        let user = db.create_user("alice").unwrap();
        assert!(user.id > 0);
        assert_eq!(user.username, "alice");
        assert!(parse_timestamp("created_at", &user.created_at).is_ok());
        assert_eq!(db.get_user(user.id).unwrap(), user);
    }

    #[test]
    fn test_duplicate_username_conflicts() {
        let db = db();
        db.create_user("alice").unwrap();
        let err = db.create_user("alice").unwrap_err();
        assert!(matches!(err, DbError::Conflict(ref msg) if msg.contains("alice")));
        assert_eq!(db.list_users(Page::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_blank_username_is_invalid() {
        let db = db();
        assert!(matches!(db.create_user("   "), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_ids_increase_per_entity() {
        let db = db();
        let a = db.create_user("a").unwrap();
        let b = db.create_user("b").unwrap();
        let c = db.create_user("c").unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let db = db();
        assert!(matches!(
            db.get_user(42),
            Err(DbError::NotFound { entity: "User", id: 42 })
        ));
        assert!(matches!(db.get_project(1), Err(DbError::NotFound { .. })));
        assert!(matches!(db.get_session(1), Err(DbError::NotFound { .. })));
        assert!(matches!(db.get_snippet(1), Err(DbError::NotFound { .. })));
        assert!(matches!(db.get_run(1), Err(DbError::NotFound { .. })));
        assert!(matches!(db.get_event(1), Err(DbError::NotFound { .. })));
    }

    // === Referential integrity ===

    #[test]
    fn test_foreign_keys_are_checked_on_create() {
        let db = db();

        let err = db
            .create_project(&NewProject {
                name: "orphan".to_string(),
                owner_id: Some(99),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { entity: "User", id: 99 }));

        assert!(matches!(
            db.create_session(7),
            Err(DbError::NotFound { entity: "Project", id: 7 })
        ));
        assert!(matches!(
            db.create_snippet(&NewSnippet {
                project_id: 3,
                code: "x".into(),
                ..Default::default()
            }),
            Err(DbError::NotFound { entity: "Project", id: 3 })
        ));
        assert!(matches!(
            db.create_run(&NewRun { session_id: 5, snippet_id: None }),
            Err(DbError::NotFound { entity: "Session", id: 5 })
        ));

        let (project_id, session_id) = seed(&db);
        assert!(matches!(
            db.create_run(&NewRun { session_id, snippet_id: Some(11) }),
            Err(DbError::NotFound { entity: "Snippet", id: 11 })
        ));
        assert!(matches!(
            db.create_event(&NewEvent {
                project_id,
                run_id: Some(8),
                event_type: EventType::Info,
                message: None,
                metadata_json: None,
            }),
            Err(DbError::NotFound { entity: "Run", id: 8 })
        ));
    }

    #[test]
    fn test_project_without_owner() {
        let db = db();
        let project = db
            .create_project(&NewProject {
                name: "solo".to_string(),
                description: Some("no owner".to_string()),
                owner_id: None,
            })
            .unwrap();
        assert_eq!(project.owner_id, None);
        assert_eq!(project.description.as_deref(), Some("no owner"));

        let err = db
            .create_project(&NewProject {
                name: "solo".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(ref msg) if msg.contains("no owner")));
    }

    #[test]
    fn test_snippet_language_defaults_to_python() {
        let db = db();
        let (project_id, _) = seed(&db);
        let snippet = db
            .create_snippet(&NewSnippet {
                project_id,
                filename: Some("hello.py".into()),
                language: None,
                code: "print('hello')".into(),
            })
            .unwrap();
        assert_eq!(snippet.language, DEFAULT_LANGUAGE);
        assert_eq!(snippet.filename.as_deref(), Some("hello.py"));

        let rust = db
            .create_snippet(&NewSnippet {
                project_id,
                filename: None,
                language: Some("rust".into()),
                code: "fn main() {}".into(),
            })
            .unwrap();
        let filter = SnippetFilter {
            language: Some("rust".into()),
            ..Default::default()
        };
        assert_eq!(db.list_snippets(&filter, Page::default()).unwrap(), vec![rust]);
    }

    // === Sessions ===

    #[test]
    fn test_end_session_is_idempotent() {
        let db = db();
        let (_, session_id) = seed(&db);

        let first = db.end_session(session_id).unwrap();
        let ended_at = first.ended_at.clone().unwrap();
        assert!(ended_at >= first.started_at);

        let second = db.end_session(session_id).unwrap();
        assert_eq!(second, first);
        assert_eq!(db.get_session(session_id).unwrap().ended_at, Some(ended_at));
    }

    #[test]
    fn test_end_missing_session() {
        let db = db();
        assert!(matches!(
            db.end_session(3),
            Err(DbError::NotFound { entity: "Session", id: 3 })
        ));
    }

    // === Runs ===

    #[test]
    fn test_run_lifecycle() {
        let db = db();
        let (_, session_id) = seed(&db);
        let run = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.ended_at.is_none());

        let running = db
            .update_run(run.id, &RunUpdate {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.status, RunStatus::Running);

        let done = db
            .update_run(run.id, &RunUpdate {
                status: Some(RunStatus::Success),
                stdout: Some("ok".into()),
                duration: Some(1.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(done.status, RunStatus::Success);
        assert_eq!(done.stdout.as_deref(), Some("ok"));
        assert_eq!(done.duration, Some(1.5));
        // untouched fields survive a partial update
        assert_eq!(done.started_at, run.started_at);
        assert!(done.stderr.is_none());
    }

    #[test]
    fn test_empty_run_update_is_noop() {
        let db = db();
        let (_, session_id) = seed(&db);
        let run = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();
        assert_eq!(db.update_run(run.id, &RunUpdate::default()).unwrap(), run);
        assert!(matches!(
            db.update_run(999, &RunUpdate::default()),
            Err(DbError::NotFound { entity: "Run", id: 999 })
        ));
    }

    #[test]
    fn test_run_update_validation() {
        let db = db();
        let (_, session_id) = seed(&db);
        let run = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();

        let negative = RunUpdate {
            duration: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(db.update_run(run.id, &negative), Err(DbError::Validation(_))));

        let backwards = RunUpdate {
            started_at: Some("2024-01-02T00:00:00Z".into()),
            ended_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(matches!(db.update_run(run.id, &backwards), Err(DbError::Validation(_))));

        let garbage = RunUpdate {
            ended_at: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(matches!(db.update_run(run.id, &garbage), Err(DbError::Validation(_))));

        // nothing was applied
        assert_eq!(db.get_run(run.id).unwrap(), run);
    }

    #[test]
    fn test_list_runs_by_status() {
        let db = db();
        let (_, session_id) = seed(&db);
        let a = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();
        let b = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();
        db.update_run(b.id, &RunUpdate {
            status: Some(RunStatus::Failed),
            stderr: Some("boom".into()),
            ..Default::default()
        })
        .unwrap();

        let pending = db
            .list_runs(&RunFilter { status: Some(RunStatus::Pending), ..Default::default() }, Page::default())
            .unwrap();
        assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id]);

        let other_session = db
            .list_runs(&RunFilter { session_id: Some(session_id + 1), ..Default::default() }, Page::default())
            .unwrap();
        assert!(other_session.is_empty());
    }

    // === Events ===

    #[test]
    fn test_event_metadata_round_trips_verbatim() {
        let db = db();
        let (project_id, _) = seed(&db);
        let metadata = r#"{"latency":45}"#;
        let event = db
            .create_event(&NewEvent {
                project_id,
                run_id: None,
                event_type: EventType::Metric,
                message: Some("request".into()),
                metadata_json: Some(metadata.to_string()),
            })
            .unwrap();
        let fetched = db.get_event(event.id).unwrap();
        assert_eq!(fetched.metadata_json.as_deref(), Some(metadata));
        assert_eq!(fetched.event_type, EventType::Metric);
    }

    #[test]
    fn test_list_events_filters() {
        let db = db();
        let (project_id, session_id) = seed(&db);
        let run = db.create_run(&NewRun { session_id, snippet_id: None }).unwrap();
        for (event_type, run_id) in [
            (EventType::Info, None),
            (EventType::Run, Some(run.id)),
            (EventType::Error, Some(run.id)),
        ] {
            db.create_event(&NewEvent {
                project_id,
                run_id,
                event_type,
                message: None,
                metadata_json: None,
            })
            .unwrap();
        }

        let by_run = db
            .list_events(&EventFilter { run_id: Some(run.id), ..Default::default() }, Page::default())
            .unwrap();
        assert_eq!(by_run.len(), 2);

        let errors = db
            .list_events(&EventFilter { event_type: Some(EventType::Error), ..Default::default() }, Page::default())
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].run_id, Some(run.id));
    }

    // === Pagination ===

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_list_page_is_slice_of_full_ordering(count in 0usize..25, skip in 0i64..30, limit in 1i64..30) {
            let db = db();
            for i in 0..count {
                db.create_user(&format!("user{}", i)).unwrap();
            }
            let full: Vec<i32> = db
                .list_users(Page::new(0, MAX_LIST).unwrap())
                .unwrap()
                .into_iter()
                .map(|u| u.id)
                .collect();
            prop_assert!(full.windows(2).all(|w| w[0] < w[1]));

            let page: Vec<i32> = db
                .list_users(Page::new(skip, limit).unwrap())
                .unwrap()
                .into_iter()
                .map(|u| u.id)
                .collect();
            let start = (skip as usize).min(full.len());
            let end = (start + limit as usize).min(full.len());
            prop_assert_eq!(page, full[start..end].to_vec());
        }
    }

    const MAX_LIST: i64 = crate::types::MAX_PAGE_LIMIT;

    #[test]
    fn test_store_caps_page_size() {
        let db = db();
        let (project_id, _) = seed(&db);
        for i in 0..(MAX_LIST + 5) {
            db.create_session(project_id).unwrap_or_else(|e| panic!("session {}: {}", i, e));
        }

        let oversized = Page::new(0, 5000).unwrap();
        let sessions = db.list_sessions(&SessionFilter::default(), oversized).unwrap();
        assert_eq!(sessions.len() as i64, MAX_LIST);

        let tail = db
            .list_sessions(&SessionFilter::default(), Page::new(MAX_LIST, 5000).unwrap())
            .unwrap();
        assert_eq!(tail.len(), 6);
    }

    #[test]
    fn test_invalid_page_is_validation_error() {
        for (skip, limit) in [(0, -1), (0, 0), (-3, 2)] {
            let err = DbError::from(Page::new(skip, limit).unwrap_err());
            assert!(matches!(err, DbError::Validation(_)), "({}, {}) gave {:?}", skip, limit, err);
        }
    }

    #[test]
    fn test_list_on_empty_store() {
        let db = db();
        assert!(db.list_users(Page::default()).unwrap().is_empty());
        assert!(db
            .list_projects(&ProjectFilter { owner_id: Some(1) }, Page::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ping() {
        assert!(db().ping().is_ok());
    }

    #[test]
    fn test_open_at_creates_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("blackbox.db");
        let db = Database::open_at(&path).unwrap();
        db.create_user("bob").unwrap();
        assert!(path.exists());

        // reopening sees the same data
        let reopened = Database::open_at(&path).unwrap();
        assert!(reopened.find_user_by_username("bob").unwrap().is_some());
    }
}
