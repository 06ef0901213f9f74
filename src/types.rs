//! Value types shared by the store, the API and the CLI
//!
//! Run statuses and event types are stored as lowercase TEXT and cross the
//! wire as lowercase JSON strings.

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default page size for list operations
pub const DEFAULT_PAGE_LIMIT: i64 = 100;

/// Hard cap on page size, applied regardless of what the caller asks for
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Returned when a string names no known status or event type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
    pub expected: String,
}

/// Lifecycle state of a run. Transitions are driven by the caller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Success,
        RunStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    /// True once the run has reached success or failed
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

/// Kind of a logged event
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Warning,
    Error,
    Run,
    Metric,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Info,
        EventType::Warning,
        EventType::Error,
        EventType::Run,
        EventType::Metric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Info => "info",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::Run => "run",
            EventType::Metric => "metric",
        }
    }
}

fn parse_kind<T: Copy>(
    kind: &'static str,
    value: &str,
    all: &[T],
    name: fn(&T) -> &'static str,
) -> Result<T, ParseKindError> {
    let wanted = value.trim().to_ascii_lowercase();
    all.iter()
        .copied()
        .find(|v| name(v) == wanted)
        .ok_or_else(|| ParseKindError {
            kind,
            value: value.to_string(),
            expected: all.iter().map(name).collect::<Vec<_>>().join(", "),
        })
}

impl FromStr for RunStatus {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_kind("run status", s, &RunStatus::ALL, RunStatus::as_str)
    }
}

impl FromStr for EventType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_kind("event type", s, &EventType::ALL, EventType::as_str)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Sqlite> for RunStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for RunStatus {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

impl ToSql<Text, Sqlite> for EventType {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for EventType {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

/// Rejected pagination window
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    #[error("skip must be >= 0 (got {0})")]
    NegativeSkip(i64),

    #[error("limit must be > 0 (got {0})")]
    NonPositiveLimit(i64),
}

/// Offset/limit window for list operations
///
/// Only constructible through [`Page::new`], so `skip >= 0` and
/// `1 <= limit <= MAX_PAGE_LIMIT` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    skip: i64,
    limit: i64,
}

impl Page {
    /// Validate a caller-supplied window. `limit` above the cap is clamped.
    pub fn new(skip: i64, limit: i64) -> Result<Self, PageError> {
        if skip < 0 {
            return Err(PageError::NegativeSkip(skip));
        }
        if limit <= 0 {
            return Err(PageError::NonPositiveLimit(limit));
        }
        Ok(Self {
            skip,
            limit: limit.min(MAX_PAGE_LIMIT),
        })
    }

    /// Build from optional query parameters, filling in defaults
    pub fn from_params(skip: Option<i64>, limit: Option<i64>) -> Result<Self, PageError> {
        Self::new(skip.unwrap_or(0), limit.unwrap_or(DEFAULT_PAGE_LIMIT))
    }

    pub fn skip(&self) -> i64 {
        self.skip
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_parse_and_display() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!("SUCCESS".parse::<RunStatus>().unwrap(), RunStatus::Success);
        assert_eq!(RunStatus::default(), RunStatus::Pending);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = "done".parse::<RunStatus>().unwrap_err();
        assert_eq!(err.kind, "run status");
        assert!(err.to_string().contains("pending, running, success, failed"));

        assert!("debug".parse::<EventType>().is_err());
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&EventType::Metric).unwrap(), "\"metric\"");
        let status: RunStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, RunStatus::Running);
        assert!(serde_json::from_str::<EventType>("\"bogus\"").is_err());
    }

    #[test]
    fn test_is_finished() {
        assert!(!RunStatus::Pending.is_finished());
        assert!(!RunStatus::Running.is_finished());
        assert!(RunStatus::Success.is_finished());
        assert!(RunStatus::Failed.is_finished());
    }

    #[test]
    fn test_page_validation() {
        assert_eq!(Page::from_params(None, None).unwrap(), Page::default());
        assert_eq!(Page::new(-1, 10), Err(PageError::NegativeSkip(-1)));
        assert_eq!(Page::new(0, 0), Err(PageError::NonPositiveLimit(0)));
        assert_eq!(Page::new(0, -5), Err(PageError::NonPositiveLimit(-5)));
        assert_eq!(Page::new(3, 50_000).unwrap().limit(), MAX_PAGE_LIMIT);

        let page = Page::new(3, 7).unwrap();
        assert_eq!((page.skip(), page.limit()), (3, 7));
    }
}
