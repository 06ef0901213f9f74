//! Wire contract shared by the HTTP server and the CLI client
//!
//! Every response body is an [`ApiResponse`] envelope. Create bodies for
//! projects, snippets, runs and events reuse the store's input structs.

use crate::types::{EventType, Page, PageError, RunStatus};
use serde::{Deserialize, Serialize};

/// Response envelope: `{"ok": bool, "data": T | null, "error": string | null}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// `POST /users` and `POST /users/resolve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub username: String,
}

/// `POST /projects/resolve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveProjectRequest {
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<i32>,
}

/// `POST /sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub project_id: i32,
}

/// Query string accepted by every list route. Filters a route doesn't use
/// are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub owner_id: Option<i32>,
    pub project_id: Option<i32>,
    pub session_id: Option<i32>,
    pub run_id: Option<i32>,
    pub language: Option<String>,
    pub status: Option<RunStatus>,
    pub event_type: Option<EventType>,
}

impl ListParams {
    pub fn page(&self) -> Result<Page, PageError> {
        Page::from_params(self.skip, self.limit)
    }

    /// Render as `key=value` pairs, skipping unset fields
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        let ints = [
            ("skip", self.skip),
            ("limit", self.limit),
            ("owner_id", self.owner_id.map(i64::from)),
            ("project_id", self.project_id.map(i64::from)),
            ("session_id", self.session_id.map(i64::from)),
            ("run_id", self.run_id.map(i64::from)),
        ];
        for (key, value) in ints {
            if let Some(v) = value {
                pairs.push((key, v.to_string()));
            }
        }
        if let Some(language) = &self.language {
            pairs.push(("language", language.clone()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.to_string()));
        }
        if let Some(event_type) = self.event_type {
            pairs.push(("event_type", event_type.to_string()));
        }
        pairs
    }
}

/// `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// `GET /health` and `GET /health/full`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub database: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("hello".to_string());
        assert!(response.ok);
        assert_eq!(response.data.as_deref(), Some("hello"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_api_response_serializes_to_json() {
        let json = serde_json::to_string(&ApiResponse::success(3)).unwrap();
        assert!(json.contains("\"ok\":true"));
        assert!(json.contains("\"data\":3"));
        assert!(json.contains("\"error\":null"));

        let json = serde_json::to_string(&ApiResponse::<()>::failure("nope")).unwrap();
        assert!(json.contains("\"ok\":false"));
        assert!(json.contains("\"error\":\"nope\""));
    }

    #[test]
    fn test_list_params_from_query_string() {
        let params: ListParams =
            serde_urlencoded::from_str("skip=5&limit=2&status=failed&session_id=3").unwrap();
        assert_eq!(params.skip, Some(5));
        assert_eq!(params.status, Some(RunStatus::Failed));
        assert_eq!(params.session_id, Some(3));
        assert_eq!(params.page().unwrap(), Page::new(5, 2).unwrap());

        assert!(serde_urlencoded::from_str::<ListParams>("event_type=loud").is_err());
    }

    #[test]
    fn test_list_params_to_pairs_round_trip() {
        let params = ListParams {
            project_id: Some(4),
            event_type: Some(EventType::Warning),
            language: Some("rust".into()),
            ..Default::default()
        };
        let query = serde_urlencoded::to_string(params.to_pairs()).unwrap();
        let parsed: ListParams = serde_urlencoded::from_str(&query).unwrap();
        assert_eq!(parsed.project_id, Some(4));
        assert_eq!(parsed.event_type, Some(EventType::Warning));
        assert_eq!(parsed.language.as_deref(), Some("rust"));
        assert_eq!(parsed.skip, None);
    }
}
