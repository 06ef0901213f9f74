//! Summary statistics over the whole store
//!
//! Counts are computed on demand inside one read transaction, so the
//! per-status and per-type breakdowns always add up to their totals.

use crate::db::{Database, Result};
use crate::schema::*;
use crate::types::{EventType, RunStatus};
use diesel::dsl::count_star;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Totals per entity plus run and event breakdowns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total_users: i64,
    pub total_projects: i64,
    pub total_sessions: i64,
    pub total_snippets: i64,
    pub total_runs: i64,
    pub total_events: i64,
    /// Every status is present, zero-filled
    pub runs_by_status: BTreeMap<RunStatus, i64>,
    /// Every event type is present, zero-filled
    pub events_by_type: BTreeMap<EventType, i64>,
}

impl Summary {
    /// Breakdowns sum to their totals
    pub fn is_consistent(&self) -> bool {
        self.runs_by_status.values().sum::<i64>() == self.total_runs
            && self.events_by_type.values().sum::<i64>() == self.total_events
    }

    pub fn runs_with(&self, status: RunStatus) -> i64 {
        self.runs_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn events_with(&self, event_type: EventType) -> i64 {
        self.events_by_type.get(&event_type).copied().unwrap_or(0)
    }
}

impl Database {
    /// Compute the summary from a single consistent snapshot
    pub fn summary(&self) -> Result<Summary> {
        self.snapshot(|conn| {
            let mut runs_by_status: BTreeMap<RunStatus, i64> =
                RunStatus::ALL.iter().map(|s| (*s, 0)).collect();
            let run_groups = runs::table
                .group_by(runs::status)
                .select((runs::status, count_star()))
                .load::<(RunStatus, i64)>(conn)?;
            for (status, count) in run_groups {
                runs_by_status.insert(status, count);
            }

            let mut events_by_type: BTreeMap<EventType, i64> =
                EventType::ALL.iter().map(|t| (*t, 0)).collect();
            let event_groups = events::table
                .group_by(events::event_type)
                .select((events::event_type, count_star()))
                .load::<(EventType, i64)>(conn)?;
            for (event_type, count) in event_groups {
                events_by_type.insert(event_type, count);
            }

            Ok(Summary {
                total_users: users::table.count().get_result(conn)?,
                total_projects: projects::table.count().get_result(conn)?,
                total_sessions: sessions::table.count().get_result(conn)?,
                total_snippets: code_snippets::table.count().get_result(conn)?,
                total_runs: runs::table.count().get_result(conn)?,
                total_events: events::table.count().get_result(conn)?,
                runs_by_status,
                events_by_type,
            })
        })
    }
}
