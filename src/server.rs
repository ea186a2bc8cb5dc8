//! The HTTP serving surface: a long-poll `GET /changes` feed over the
//! store and the tracker, plus a liveness probe tied to the replication
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::envelope::ChangeEnvelope;
use crate::sequence::Sequence;
use crate::storage::{ChangeStore, ScanResult};
use crate::tracker::ChangeTracker;

const DEFAULT_LIMIT: usize = 100;

/// The first sequence a change can ever occupy. A `since` below the
/// store's oldest entry but above this means the consumer fell behind
/// the purge window.
const LOWEST_POSSIBLE: Sequence = Sequence { lsn: 0, index: 1 };

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChangeStore>,
    pub tracker: ChangeTracker,
    pub healthy: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/changes", get(get_changes))
        .route("/health", get(get_health))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn invalid_parameter(name: &str) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_PARAMETER",
            message: format!("invalid parameter: {name}"),
        }
    }

    fn too_old() -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "SNAPSHOT_TOO_OLD",
            message: "requested sequence is older than the retained window".to_string(),
        }
    }

    fn internal(message: String) -> ApiError {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ChangeList {
    #[serde(rename = "firstSequence")]
    first_sequence: String,
    #[serde(rename = "lastSequence")]
    last_sequence: String,
    changes: Vec<ChangeItem>,
}

#[derive(Debug, Serialize)]
struct ChangeItem {
    sequence: String,
    #[serde(flatten)]
    envelope: ChangeEnvelope,
}

/// Parsed `/changes` query string. Repeated `scope` params accumulate;
/// everything else takes the first occurrence.
#[derive(Debug, Default, PartialEq)]
struct ChangesParams {
    since: Sequence,
    scopes: Vec<String>,
    limit: usize,
    block_secs: u64,
}

fn scope_is_valid(scope: &str) -> bool {
    !scope.is_empty()
        && scope
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn parse_params(pairs: &[(String, String)]) -> Result<ChangesParams, ApiError> {
    let mut params = ChangesParams {
        limit: DEFAULT_LIMIT,
        ..ChangesParams::default()
    };
    let mut seen_since = false;
    let mut seen_limit = false;
    let mut seen_block = false;
    for (key, value) in pairs {
        match key.as_str() {
            "scope" => {
                if !scope_is_valid(value) {
                    return Err(ApiError::invalid_parameter("scope"));
                }
                params.scopes.push(value.clone());
            }
            "since" if !seen_since => {
                params.since = Sequence::parse(value)
                    .map_err(|_| ApiError::invalid_parameter("since"))?;
                seen_since = true;
            }
            "limit" if !seen_limit => {
                params.limit = value
                    .parse()
                    .map_err(|_| ApiError::invalid_parameter("limit"))?;
                seen_limit = true;
            }
            "block" if !seen_block => {
                params.block_secs = value
                    .parse()
                    .map_err(|_| ApiError::invalid_parameter("block"))?;
                seen_block = true;
            }
            _ => {}
        }
    }
    if params.scopes.is_empty() {
        // No scope means the default, unscoped stream.
        params.scopes.push(String::new());
    }
    Ok(params)
}

async fn get_changes(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<ChangeList>, ApiError> {
    let params = parse_params(&pairs)?;

    // Consumers pass back the last sequence they saw; start past it.
    let since = Sequence::new(params.since.lsn, params.since.index.wrapping_add(1));

    let mut result = receive_changes(&state, &params.scopes, since, params.limit)?;

    if result.entries.is_empty() && params.block_secs > 0 {
        let wait_at = Sequence::new(result.last.lsn, result.last.index + 1);
        debug!(%wait_at, block_secs = params.block_secs, "blocking for changes");
        let woke_at = state
            .tracker
            .timed_wait(
                wait_at,
                Duration::from_secs(params.block_secs),
                &params.scopes,
            )
            .await;
        if woke_at > since {
            result = receive_changes(&state, &params.scopes, since, params.limit)?;
        }
    }

    let mut changes = Vec::with_capacity(result.entries.len());
    for entry in &result.entries {
        let envelope = ChangeEnvelope::decode(entry)
            .map_err(|err| ApiError::internal(format!("invalid stored change: {err}")))?;
        changes.push(ChangeItem {
            sequence: envelope.sequence().to_string(),
            envelope,
        });
    }

    // When the limit truncated the scan, point the consumer at the last
    // change actually returned rather than the store tail.
    let last_sequence = if changes.len() == params.limit && params.limit > 0 {
        changes[changes.len() - 1].sequence.clone()
    } else {
        result.last.to_string()
    };

    Ok(Json(ChangeList {
        first_sequence: result.first.to_string(),
        last_sequence,
        changes,
    }))
}

fn receive_changes(
    state: &AppState,
    scopes: &[String],
    since: Sequence,
    limit: usize,
) -> Result<ScanResult, ApiError> {
    let result = state
        .store
        .scan(scopes, since, limit)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if since < result.first && since > LOWEST_POSSIBLE {
        return Err(ApiError::too_old());
    }
    debug!(count = result.entries.len(), "scanned changes");
    Ok(result)
}

async fn get_health(State(state): State<AppState>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "replication down").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_no_params() {
        let params = parse_params(&[]).unwrap();
        assert_eq!(params.since, Sequence::default());
        assert_eq!(params.scopes, vec![String::new()]);
        assert_eq!(params.limit, DEFAULT_LIMIT);
        assert_eq!(params.block_secs, 0);
    }

    #[test]
    fn repeated_scopes_accumulate() {
        let params =
            parse_params(&pairs(&[("scope", "a"), ("scope", "b_2")])).unwrap();
        assert_eq!(params.scopes, vec!["a".to_string(), "b_2".to_string()]);
    }

    #[test]
    fn scope_charset_is_enforced() {
        assert!(parse_params(&pairs(&[("scope", "Bad")])).is_err());
        assert!(parse_params(&pairs(&[("scope", "a b")])).is_err());
        assert!(parse_params(&pairs(&[("scope", "")])).is_err());
        assert!(parse_params(&pairs(&[("scope", "ok-scope_9")])).is_ok());
    }

    #[test]
    fn since_and_numeric_params_parse() {
        let params = parse_params(&pairs(&[
            ("since", "1.2.3"),
            ("limit", "5"),
            ("block", "30"),
        ]))
        .unwrap();
        assert_eq!(params.since, Sequence::new((1 << 32) | 2, 3));
        assert_eq!(params.limit, 5);
        assert_eq!(params.block_secs, 30);
    }

    #[test]
    fn bad_numeric_params_are_rejected() {
        assert!(parse_params(&pairs(&[("limit", "x")])).is_err());
        assert!(parse_params(&pairs(&[("block", "-1")])).is_err());
        assert!(parse_params(&pairs(&[("since", "zz")])).is_err());
    }
}
