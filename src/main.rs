//! Blackbox CLI - log projects, sessions, code runs and events to the blackbox API

use anyhow::{Context, Result};
use blackbox::api::ListParams;
use blackbox::client::BlackboxClient;
use blackbox::db::{NewEvent, NewProject, NewRun, NewSnippet, RunUpdate};
use blackbox::hooks::{self, AutoEvent};
use blackbox::serve::start_api_server;
use blackbox::stats::Summary;
use blackbox::types::{EventType, RunStatus};
use blackbox::{Config, Database};
use clap::{Args, CommandFactory, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "blackbox")]
#[command(version)]
#[command(about = "Development activity logger: projects, sessions, code runs and events")]
#[command(long_about = r#"
Blackbox records what happens while you develop:
  • users and projects (auto-created by git hooks)
  • coding sessions, code snippets and their runs
  • free-form events with JSON metadata

Example usage:
  blackbox serve
  blackbox project create demo --desc "scratch work"
  blackbox session start --project-id 1
  blackbox stats
"#)]
struct Cli {
    /// API base URL (overrides config and BLACKBOX_API_URL)
    #[arg(long, global = true)]
    api: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct PageArgs {
    /// Records to skip
    #[arg(long)]
    skip: Option<i64>,

    /// Maximum records to return (default 100, max 1000)
    #[arg(long)]
    limit: Option<i64>,
}

impl PageArgs {
    fn params(self) -> ListParams {
        ListParams {
            skip: self.skip,
            limit: self.limit,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Request worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage coding sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage code snippets
    Snippet {
        #[command(subcommand)]
        action: SnippetAction,
    },

    /// Manage code runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Log and query events
    Event {
        #[command(subcommand)]
        action: EventAction,
    },

    /// Show summary statistics
    Stats,

    /// Log a git commit (used by hooks, never fails)
    AutoCommit {
        #[arg(long)]
        project: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        commit_hash: Option<String>,

        #[arg(long)]
        git_user: Option<String>,
    },

    /// Log an event (used by hooks, never fails)
    AutoEvent {
        #[arg(long)]
        project: String,

        /// info, warning, error, run or metric
        #[arg(long = "type")]
        event_type: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        git_user: Option<String>,
    },

    /// Manage git hooks
    Hooks {
        #[command(subcommand)]
        action: HooksAction,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user
    Create { username: String },
    /// List users
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one user
    Get { id: i32 },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create {
        name: String,
        #[arg(long)]
        desc: Option<String>,
        #[arg(long)]
        owner_id: Option<i32>,
    },
    /// List projects
    List {
        #[arg(long)]
        owner_id: Option<i32>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one project
    Get { id: i32 },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session
    Start {
        #[arg(long)]
        project_id: i32,
    },
    /// List sessions
    List {
        #[arg(long)]
        project_id: Option<i32>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one session
    Get { id: i32 },
    /// End a session
    End { id: i32 },
}

#[derive(Subcommand)]
enum SnippetAction {
    /// Store a code snippet
    Create {
        #[arg(long)]
        project_id: i32,
        #[arg(long)]
        code: String,
        #[arg(long)]
        file: Option<String>,
        /// Defaults to python
        #[arg(long)]
        lang: Option<String>,
    },
    /// List snippets
    List {
        #[arg(long)]
        project_id: Option<i32>,
        #[arg(long)]
        lang: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one snippet
    Get { id: i32 },
}

#[derive(Subcommand)]
enum RunAction {
    /// Record a run (status pending)
    Create {
        #[arg(long)]
        session_id: i32,
        #[arg(long)]
        snippet_id: Option<i32>,
    },
    /// List runs
    List {
        #[arg(long)]
        session_id: Option<i32>,
        #[arg(long)]
        status: Option<RunStatus>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one run
    Get { id: i32 },
    /// Update a run's status or output
    Update {
        id: i32,
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        stdout: Option<String>,
        #[arg(long)]
        stderr: Option<String>,
        /// Seconds
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long)]
        return_value: Option<String>,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Log an event
    Log {
        #[arg(long)]
        project_id: i32,
        #[arg(long = "type")]
        event_type: EventType,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        run_id: Option<i32>,
        /// JSON object stored with the event
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List events
    List {
        #[arg(long)]
        project_id: Option<i32>,
        #[arg(long)]
        run_id: Option<i32>,
        #[arg(long = "type")]
        event_type: Option<EventType>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show one event
    Get { id: i32 },
}

#[derive(Subcommand)]
enum HooksAction {
    /// Install post-commit and post-checkout hooks
    Install {
        /// Repository root
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Overwrite hooks not written by blackbox
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let (mut config, ignored) = Config::load();

    let default_level = match cli.command {
        Commands::Serve { .. } => config.logging.level.clone(),
        _ => "warn".to_string(),
    };
    init_tracing(cli.verbose, &default_level);
    for skipped in &ignored {
        tracing::warn!(
            var = skipped.var,
            value = %skipped.value,
            "ignoring invalid environment override"
        );
    }

    if let Some(api) = &cli.api {
        config.client.api_url = api.clone();
    }

    if let Err(e) = run(cli.command, config) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool, default_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(command: Commands, config: Config) -> Result<()> {
    let client = BlackboxClient::from_config(&config.client);

    match command {
        Commands::Serve {
            host,
            port,
            workers,
            db,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            if let Some(db) = db {
                config.database.path = db;
            }

            let database = Database::open(&config.database).with_context(|| {
                format!("opening database {}", config.database.path.display())
            })?;
            start_api_server(&config.bind_addr(), config.server.workers, database)
                .with_context(|| format!("serving on {}", config.bind_addr()))?;
        }

        Commands::User { action } => match action {
            UserAction::Create { username } => {
                let user = client.create_user(&username)?;
                success(&format!("User created: ID={}, username={}", user.id, user.username));
            }
            UserAction::List { page } => print_list("user", &client.list_users(&page.params())?)?,
            UserAction::Get { id } => print_json(&client.get_user(id)?)?,
        },

        Commands::Project { action } => match action {
            ProjectAction::Create {
                name,
                desc,
                owner_id,
            } => {
                let project = client.create_project(&NewProject {
                    name,
                    description: desc,
                    owner_id,
                })?;
                success(&format!("Project created: ID={}, name={}", project.id, project.name));
            }
            ProjectAction::List { owner_id, page } => {
                let params = ListParams {
                    owner_id,
                    ..page.params()
                };
                print_list("project", &client.list_projects(&params)?)?;
            }
            ProjectAction::Get { id } => print_json(&client.get_project(id)?)?,
        },

        Commands::Session { action } => match action {
            SessionAction::Start { project_id } => {
                let session = client.start_session(project_id)?;
                success(&format!(
                    "Session started: ID={}, started_at={}",
                    session.id, session.started_at
                ));
            }
            SessionAction::List { project_id, page } => {
                let params = ListParams {
                    project_id,
                    ..page.params()
                };
                print_list("session", &client.list_sessions(&params)?)?;
            }
            SessionAction::Get { id } => print_json(&client.get_session(id)?)?,
            SessionAction::End { id } => {
                let session = client.end_session(id)?;
                success(&format!(
                    "Session ended: ID={}, ended_at={}",
                    session.id,
                    session.ended_at.as_deref().unwrap_or("-")
                ));
            }
        },

        Commands::Snippet { action } => match action {
            SnippetAction::Create {
                project_id,
                code,
                file,
                lang,
            } => {
                let snippet = client.create_snippet(&NewSnippet {
                    project_id,
                    filename: file,
                    language: lang,
                    code,
                })?;
                success(&format!(
                    "Snippet created: ID={}, language={}",
                    snippet.id, snippet.language
                ));
            }
            SnippetAction::List {
                project_id,
                lang,
                page,
            } => {
                let params = ListParams {
                    project_id,
                    language: lang,
                    ..page.params()
                };
                print_list("snippet", &client.list_snippets(&params)?)?;
            }
            SnippetAction::Get { id } => print_json(&client.get_snippet(id)?)?,
        },

        Commands::Run { action } => match action {
            RunAction::Create {
                session_id,
                snippet_id,
            } => {
                let run = client.create_run(&NewRun {
                    session_id,
                    snippet_id,
                })?;
                success(&format!("Run created: ID={}, status={}", run.id, run.status));
            }
            RunAction::List {
                session_id,
                status,
                page,
            } => {
                let params = ListParams {
                    session_id,
                    status,
                    ..page.params()
                };
                print_list("run", &client.list_runs(&params)?)?;
            }
            RunAction::Get { id } => print_json(&client.get_run(id)?)?,
            RunAction::Update {
                id,
                status,
                stdout,
                stderr,
                duration,
                return_value,
            } => {
                let run = client.update_run(
                    id,
                    &RunUpdate {
                        status,
                        stdout,
                        stderr,
                        duration,
                        return_value,
                        ..Default::default()
                    },
                )?;
                let mut line = format!("Run updated: ID={}, status={}", run.id, run.status);
                if let (true, Some(duration)) = (run.status.is_finished(), run.duration) {
                    line.push_str(&format!(", duration={}s", duration));
                }
                success(&line);
            }
        },

        Commands::Event { action } => match action {
            EventAction::Log {
                project_id,
                event_type,
                message,
                run_id,
                metadata,
            } => {
                let event = client.log_event(&NewEvent {
                    project_id,
                    run_id,
                    event_type,
                    message,
                    metadata_json: metadata,
                })?;
                success(&format!(
                    "Event logged: ID={}, timestamp={}",
                    event.id, event.timestamp
                ));
            }
            EventAction::List {
                project_id,
                run_id,
                event_type,
                page,
            } => {
                let params = ListParams {
                    project_id,
                    run_id,
                    event_type,
                    ..page.params()
                };
                print_list("event", &client.list_events(&params)?)?;
            }
            EventAction::Get { id } => print_json(&client.get_event(id)?)?,
        },

        Commands::Stats => print_summary(&client.summary()?),

        Commands::AutoCommit {
            project,
            message,
            commit_hash,
            git_user,
        } => {
            let auto = AutoEvent::commit(&project, &message, commit_hash, git_user);
            hooks::auto_log(&client, &auto);
        }

        Commands::AutoEvent {
            project,
            event_type,
            message,
            git_user,
        } => {
            let auto = AutoEvent::event(&project, &event_type, &message, git_user);
            hooks::auto_log(&client, &auto);
        }

        Commands::Hooks { action } => match action {
            HooksAction::Install { repo, force } => {
                let binary = std::env::current_exe()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|_| "blackbox".to_string());
                let report = hooks::install_hooks(&repo, &binary, force)?;
                for path in &report.installed {
                    println!("   {} {}", "Installed".green(), path.display());
                }
                for path in &report.skipped {
                    println!(
                        "   {} {} (existing hook, use --force to replace)",
                        "Skipping".yellow(),
                        path.display()
                    );
                }
            }
        },

        Commands::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "blackbox", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_list<T: Serialize>(kind: &str, items: &[T]) -> Result<()> {
    println!("{}", format!("Found {} {}(s):", items.len(), kind).cyan());
    print_json(&items)
}

fn print_summary(summary: &Summary) {
    println!("{}", "Blackbox Statistics".bold());
    for (label, count) in [
        ("Users", summary.total_users),
        ("Projects", summary.total_projects),
        ("Sessions", summary.total_sessions),
        ("Snippets", summary.total_snippets),
        ("Runs", summary.total_runs),
        ("Events", summary.total_events),
    ] {
        println!("   {:<10} {}", label, count);
    }

    println!("\n{}", "Runs by status".bold());
    for (status, count) in &summary.runs_by_status {
        println!("   {:<10} {}", status.to_string(), count);
    }

    println!("\n{}", "Events by type".bold());
    for (event_type, count) in &summary.events_by_type {
        println!("   {:<10} {}", event_type.to_string(), count);
    }
}
