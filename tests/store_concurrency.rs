//! Concurrency tests against a file-backed store
//!
//! Many threads share one pooled `Database` the way the server's workers do.

use blackbox::db::{NewEvent, NewRun, ProjectFilter, RunUpdate};
use blackbox::{Database, EventType, Page, RunStatus};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const THREADS: usize = 8;

fn open_shared() -> (TempDir, Database) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open_at(dir.path().join("race.db")).expect("Failed to open db");
    (dir, db)
}

/// Run `f` on THREADS threads released together, collecting results
fn race<T, F>(db: &Database, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&Database, usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(THREADS));
    let f = Arc::new(f);
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            let f = Arc::clone(&f);
            thread::spawn(move || {
                barrier.wait();
                f(&db, i)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().expect("thread panicked")).collect()
}

#[test]
fn test_concurrent_resolve_user_yields_one_row() {
    let (_dir, db) = open_shared();
    let ids = race(&db, |db, _| db.resolve_user("racer").expect("resolve_user").id);

    assert!(ids.windows(2).all(|w| w[0] == w[1]), "ids differ: {:?}", ids);
    assert_eq!(db.list_users(Page::default()).unwrap().len(), 1);
}

#[test]
fn test_concurrent_resolve_project_yields_one_row_per_key() {
    let (_dir, db) = open_shared();
    let owner = db.create_user("owner").unwrap();

    let owned = race(&db, move |db, _| {
        db.resolve_project("shared", Some(owner.id)).expect("resolve_project").id
    });
    let orphans = race(&db, |db, _| db.resolve_project("shared", None).expect("resolve_project").id);

    assert!(owned.windows(2).all(|w| w[0] == w[1]));
    assert!(orphans.windows(2).all(|w| w[0] == w[1]));
    assert_ne!(owned[0], orphans[0]);
    assert_eq!(
        db.list_projects(&ProjectFilter::default(), Page::default()).unwrap().len(),
        2
    );
}

#[test]
fn test_summary_consistent_under_concurrent_writes() {
    let (_dir, db) = open_shared();
    let project = db.resolve_project("busy", None).unwrap();
    let session = db.create_session(project.id).unwrap();

    let writers = {
        let db = db.clone();
        thread::spawn(move || {
            race(&db, move |db, i| {
                for n in 0..5 {
                    let run = db
                        .create_run(&NewRun { session_id: session.id, snippet_id: None })
                        .expect("create_run");
                    let status = if (i + n) % 2 == 0 { RunStatus::Success } else { RunStatus::Failed };
                    db.update_run(run.id, &RunUpdate { status: Some(status), ..Default::default() })
                        .expect("update_run");
                    db.create_event(&NewEvent {
                        project_id: project.id,
                        run_id: Some(run.id),
                        event_type: EventType::Run,
                        message: None,
                        metadata_json: None,
                    })
                    .expect("create_event");
                }
            })
        })
    };

    // Read while writers are active
    for _ in 0..20 {
        let summary = db.summary().expect("summary");
        assert!(summary.is_consistent(), "inconsistent: {:?}", summary);
    }
    writers.join().expect("writers panicked");

    let summary = db.summary().unwrap();
    assert_eq!(summary.total_runs, (THREADS * 5) as i64);
    assert_eq!(summary.events_with(EventType::Run), (THREADS * 5) as i64);
    assert_eq!(summary.runs_with(RunStatus::Pending), 0);
    assert_eq!(
        summary.runs_with(RunStatus::Success) + summary.runs_with(RunStatus::Failed),
        summary.total_runs
    );
}

#[test]
fn test_concurrent_creates_get_distinct_increasing_ids() {
    let (_dir, db) = open_shared();
    let project = db.resolve_project("ids", None).unwrap();
    let mut ids = race(&db, move |db, _| db.create_session(project.id).expect("create_session").id);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), THREADS);
}
