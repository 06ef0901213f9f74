//! HTTP API server
//!
//! `blackbox serve` → binds, spawns worker threads, answers JSON requests.
//! Routing is a pure function of (method, url, body) so it can be exercised
//! without a socket.

use crate::api::{
    ApiResponse, CreateSessionRequest, HealthStatus, ListParams, ResolveProjectRequest,
    ServiceInfo, UserRequest,
};
use crate::db::{
    now_timestamp, Database, DbError, EventFilter, NewEvent, NewProject, NewRun, NewSnippet,
    ProjectFilter, RunFilter, RunUpdate, SessionFilter, SnippetFilter,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tiny_http::{Header, Method, Request, Response, Server};

const SERVICE_NAME: &str = "Blackbox API";

/// Status code and serialized envelope for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, data: T) -> Self {
        match serde_json::to_string(&ApiResponse::success(data)) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, format!("Failed to encode response: {}", e)),
        }
    }

    fn ok<T: Serialize>(data: T) -> Self {
        Self::json(200, data)
    }

    fn created<T: Serialize>(data: T) -> Self {
        Self::json(201, data)
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        let body = serde_json::to_string(&ApiResponse::<()>::failure(message))
            .unwrap_or_else(|_| r#"{"ok":false,"data":null,"error":"internal error"}"#.to_string());
        Self { status, body }
    }
}

#[derive(Debug)]
struct ApiError {
    status: u16,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        let status = match &e {
            DbError::NotFound { .. } => 404,
            DbError::Conflict(_) => 409,
            DbError::Validation(_) => 400,
            DbError::Connection(_) | DbError::Query(_) => {
                tracing::error!(error = %e, "storage failure");
                500
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

type HandlerResult = std::result::Result<Reply, ApiError>;

/// Map a request onto a store operation
pub fn route(db: &Database, method: &Method, url: &str, body: &str) -> Reply {
    dispatch(db, method, url, body).unwrap_or_else(|e| Reply::error(e.status, e.message))
}

fn dispatch(db: &Database, method: &Method, url: &str, body: &str) -> HandlerResult {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        // CORS preflight
        (Method::Options, _) => Ok(Reply {
            status: 204,
            body: String::new(),
        }),

        // Health
        (Method::Get, []) => Ok(Reply::ok(ServiceInfo {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
        (Method::Get, ["health"]) => Ok(Reply::ok(HealthStatus {
            status: "healthy".to_string(),
            database: "not_checked".to_string(),
            timestamp: now_timestamp(),
        })),
        (Method::Get, ["health", "full"]) => Ok(health_full(db)),

        // Users
        (Method::Post, ["users"]) => {
            let req: UserRequest = parse_body(body)?;
            let user = db.create_user(&req.username)?;
            tracing::info!(id = user.id, username = %user.username, "created user");
            Ok(Reply::created(user))
        }
        (Method::Post, ["users", "resolve"]) => {
            let req: UserRequest = parse_body(body)?;
            Ok(Reply::ok(db.resolve_user(&req.username)?))
        }
        (Method::Get, ["users"]) => {
            let params = parse_query(query)?;
            Ok(Reply::ok(db.list_users(page(&params)?)?))
        }
        (Method::Get, ["users", id]) => Ok(Reply::ok(db.get_user(parse_id(id)?)?)),

        // Projects
        (Method::Post, ["projects"]) => {
            let req: NewProject = parse_body(body)?;
            Ok(Reply::created(db.create_project(&req)?))
        }
        (Method::Post, ["projects", "resolve"]) => {
            let req: ResolveProjectRequest = parse_body(body)?;
            Ok(Reply::ok(db.resolve_project(&req.name, req.owner_id)?))
        }
        (Method::Get, ["projects"]) => {
            let params = parse_query(query)?;
            let filter = ProjectFilter {
                owner_id: params.owner_id,
            };
            Ok(Reply::ok(db.list_projects(&filter, page(&params)?)?))
        }
        (Method::Get, ["projects", id]) => Ok(Reply::ok(db.get_project(parse_id(id)?)?)),

        // Sessions
        (Method::Post, ["sessions"]) => {
            let req: CreateSessionRequest = parse_body(body)?;
            Ok(Reply::created(db.create_session(req.project_id)?))
        }
        (Method::Get, ["sessions"]) => {
            let params = parse_query(query)?;
            let filter = SessionFilter {
                project_id: params.project_id,
            };
            Ok(Reply::ok(db.list_sessions(&filter, page(&params)?)?))
        }
        (Method::Get, ["sessions", id]) => Ok(Reply::ok(db.get_session(parse_id(id)?)?)),
        (Method::Patch, ["sessions", id, "end"]) => Ok(Reply::ok(db.end_session(parse_id(id)?)?)),

        // Snippets
        (Method::Post, ["snippets"]) => {
            let req: NewSnippet = parse_body(body)?;
            Ok(Reply::created(db.create_snippet(&req)?))
        }
        (Method::Get, ["snippets"]) => {
            let params = parse_query(query)?;
            let filter = SnippetFilter {
                project_id: params.project_id,
                language: params.language.clone(),
            };
            Ok(Reply::ok(db.list_snippets(&filter, page(&params)?)?))
        }
        (Method::Get, ["snippets", id]) => Ok(Reply::ok(db.get_snippet(parse_id(id)?)?)),

        // Runs
        (Method::Post, ["runs"]) => {
            let req: NewRun = parse_body(body)?;
            Ok(Reply::created(db.create_run(&req)?))
        }
        (Method::Get, ["runs"]) => {
            let params = parse_query(query)?;
            let filter = RunFilter {
                session_id: params.session_id,
                status: params.status,
            };
            Ok(Reply::ok(db.list_runs(&filter, page(&params)?)?))
        }
        (Method::Get, ["runs", id]) => Ok(Reply::ok(db.get_run(parse_id(id)?)?)),
        (Method::Patch, ["runs", id]) => {
            let id = parse_id(id)?;
            let update: RunUpdate = parse_body(body)?;
            Ok(Reply::ok(db.update_run(id, &update)?))
        }

        // Events
        (Method::Post, ["events"]) => {
            let req: NewEvent = parse_body(body)?;
            if let Some(metadata) = &req.metadata_json {
                serde_json::from_str::<serde_json::Value>(metadata)
                    .map_err(|e| ApiError::bad_request(format!("metadata_json is not valid JSON: {}", e)))?;
            }
            Ok(Reply::created(db.create_event(&req)?))
        }
        (Method::Get, ["events"]) => {
            let params = parse_query(query)?;
            let filter = EventFilter {
                project_id: params.project_id,
                run_id: params.run_id,
                event_type: params.event_type,
            };
            Ok(Reply::ok(db.list_events(&filter, page(&params)?)?))
        }
        (Method::Get, ["events", id]) => Ok(Reply::ok(db.get_event(parse_id(id)?)?)),

        // Stats
        (Method::Get, ["stats", "summary"]) => Ok(Reply::ok(db.summary()?)),

        // 404
        _ => Err(ApiError {
            status: 404,
            message: format!("No route for {} {}", method, path),
        }),
    }
}

fn health_full(db: &Database) -> Reply {
    match db.ping() {
        Ok(()) => Reply::ok(HealthStatus {
            status: "healthy".to_string(),
            database: "connected".to_string(),
            timestamp: now_timestamp(),
        }),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            Reply::error(503, "Service unhealthy")
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> std::result::Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)))
}

fn parse_query(query: &str) -> std::result::Result<ListParams, ApiError> {
    serde_urlencoded::from_str(query)
        .map_err(|e| ApiError::bad_request(format!("Invalid query: {}", e)))
}

fn page(params: &ListParams) -> std::result::Result<crate::types::Page, ApiError> {
    params
        .page()
        .map_err(|e| ApiError::from(DbError::from(e)))
}

fn parse_id(raw: &str) -> std::result::Result<i32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid id '{}'", raw)))
}

// ============================================================================
// Socket handling
// ============================================================================

/// A bound listener plus the store it serves
pub struct ApiServer {
    server: Arc<Server>,
    db: Database,
    workers: usize,
}

impl ApiServer {
    /// Bind to `addr` ("host:port"; port 0 picks a free port)
    pub fn bind(addr: &str, db: Database, workers: usize) -> std::io::Result<Self> {
        let server = Server::http(addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            server: Arc::new(server),
            db,
            workers: workers.max(1),
        })
    }

    /// Port actually bound
    pub fn port(&self) -> Option<u16> {
        self.server.server_addr().to_ip().map(|addr| addr.port())
    }

    /// Serve requests until the listener shuts down
    pub fn run(self) -> std::io::Result<()> {
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let server = Arc::clone(&self.server);
            let db = self.db.clone();
            let handle = std::thread::Builder::new()
                .name(format!("api-worker-{}", worker))
                .spawn(move || {
                    for request in server.incoming_requests() {
                        if let Err(e) = handle_request(&db, request) {
                            tracing::warn!(error = %e, "failed to send response");
                        }
                    }
                })?;
            handles.push(handle);
        }

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("api worker panicked");
            }
        }
        Ok(())
    }
}

/// Start the API server described by `config`
pub fn start_api_server(addr: &str, workers: usize, db: Database) -> std::io::Result<()> {
    let server = ApiServer::bind(addr, db, workers)?;
    let url = format!("http://{}", addr);

    eprintln!("\n\x1b[1;32m📦 Blackbox\x1b[0m");
    eprintln!("   API:          {}", url);
    eprintln!("   Health check: {}/health", url);
    eprintln!("   Press Ctrl+C to stop\n");
    tracing::info!(%addr, workers, "api server listening");

    server.run()
}

fn handle_request(db: &Database, mut request: Request) -> std::io::Result<()> {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();

    let mut body = String::new();
    let reply = match request.as_reader().read_to_string(&mut body) {
        Ok(_) => route(db, &method, &url, &body),
        Err(e) => Reply::error(400, format!("Failed to read body: {}", e)),
    };

    tracing::info!(
        %method,
        %url,
        status = reply.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    respond(request, reply)
}

fn respond(request: Request, reply: Reply) -> std::io::Result<()> {
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    for (name, value) in [
        ("Content-Type", "application/json"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, PATCH, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type"),
    ] {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    request.respond(response)
}
